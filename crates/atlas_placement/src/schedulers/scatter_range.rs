//! Scatter-range: balance one key range in isolation.
//!
//! Wraps the cluster in a range-restricted view with a tolerance ratio of 2
//! and runs the ordinary leader and region balancers over it, so a single
//! table's worth of keys spreads out even when the cluster as a whole is
//! already balanced.

use std::sync::Arc;

use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::controller::OperatorController;
use crate::operator::{OpKind, Operator};
use crate::schedulers::{BalanceLeaderScheduler, BalanceRegionScheduler, Scheduler};
use crate::view::ClusterView;

pub const SCATTER_RANGE: &str = "scatter-range";
const RANGE_TOLERANT_RATIO: f64 = 2.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ScatterRangeConfig {
    range_name: String,
    start_key: String,
    end_key: String,
}

pub struct ScatterRangeScheduler {
    name: String,
    start: Vec<u8>,
    end: Vec<u8>,
    config: ScatterRangeConfig,
    balance_leader: BalanceLeaderScheduler,
    balance_region: BalanceRegionScheduler,
    controller: Arc<OperatorController>,
}

impl ScatterRangeScheduler {
    pub fn new(
        controller: Arc<OperatorController>,
        start: Vec<u8>,
        end: Vec<u8>,
        range_name: String,
    ) -> Self {
        let config = ScatterRangeConfig {
            range_name: range_name.clone(),
            start_key: String::from_utf8_lossy(&start).into_owned(),
            end_key: String::from_utf8_lossy(&end).into_owned(),
        };
        Self {
            name: format!("scatter-range-{range_name}"),
            start,
            end,
            config,
            balance_leader: BalanceLeaderScheduler::new(controller.clone()),
            balance_region: BalanceRegionScheduler::new(controller.clone()),
            controller,
        }
    }
}

impl Scheduler for ScatterRangeScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        SCATTER_RANGE
    }

    fn encode_config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::RANGE) < view.cfg.range_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let ranged = view.range_view(self.start.clone(), self.end.clone(), RANGE_TOLERANT_RATIO);

        let mut ops = self.balance_leader.schedule(&ranged, rng);
        if let Some(op) = ops.first_mut() {
            op.set_desc(format!("scatter-range-leader-{}", self.config.range_name));
            op.attach_kind(OpKind::RANGE);
            view.counter.inc(&self.name, "new-leader-operator");
            return ops;
        }
        let mut ops = self.balance_region.schedule(&ranged, rng);
        if let Some(op) = ops.first_mut() {
            op.set_desc(format!("scatter-range-region-{}", self.config.range_name));
            op.attach_kind(OpKind::RANGE);
            view.counter.inc(&self.name, "new-region-operator");
            return ops;
        }
        view.counter.inc(&self.name, "no-need");
        Vec::new()
    }
}
