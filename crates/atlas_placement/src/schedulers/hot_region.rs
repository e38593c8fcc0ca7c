//! Hot-region balancing, one scheduler instance per flow direction.
//!
//! Works off the flow windows in [`FlowStats`]: find the store carrying the
//! most qualified hot flow, pick its hottest region, and shed it to the
//! coldest store that passes placement filters. If the cold store already
//! holds a replica the fix is a cheap leader transfer, otherwise the peer
//! moves. Hot-region targets may use `specialUse=hotRegion` stores that
//! generic balancing avoids.

use std::sync::Arc;

use rand::rngs::SmallRng;

use crate::controller::OperatorController;
use crate::filter::{
    filter_targets, ExcludedFilter, Filter, HealthFilter, PendingPeerCountFilter,
    SnapshotCountFilter, SpecialUseFilter, StateFilter, StorageThresholdFilter, StoreLimitFilter,
};
use crate::limiter::StoreLimitKind;
use crate::metadata::StoreId;
use crate::operator::{create_move_peer, create_transfer_leader, OpKind, Operator};
use crate::schedulers::Scheduler;
use crate::stats::{FlowKind, FlowStats};
use crate::view::ClusterView;

pub const HOT_REGION: &str = "hot-region";
const TOP_HOT_REGIONS: usize = 16;

pub struct HotRegionScheduler {
    name: String,
    flow: FlowKind,
    controller: Arc<OperatorController>,
}

impl HotRegionScheduler {
    pub fn new(controller: Arc<OperatorController>, flow: FlowKind) -> Self {
        Self {
            name: format!("hot-{}-region", flow.as_str()),
            flow,
            controller,
        }
    }

    fn store_rate(flows: &FlowStats, flow: FlowKind, store_id: StoreId) -> f64 {
        flows.store_rates(flow).get(&store_id).copied().unwrap_or(0.0)
    }
}

impl Scheduler for HotRegionScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        HOT_REGION
    }

    fn encode_config(&self) -> serde_json::Value {
        serde_json::json!({ "flow": match self.flow {
            FlowKind::Read => "read",
            FlowKind::Write => "write",
        }})
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::HOT_REGION) < view.cfg.hot_region_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, _rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let hot = view.flows.hot_regions(self.flow, TOP_HOT_REGIONS);
        if hot.is_empty() {
            view.counter.inc(&self.name, "no-hot-region");
            return Vec::new();
        }

        // Hottest store first, then its hottest region.
        let Some(hottest_store) = hot
            .iter()
            .map(|h| h.store_id)
            .max_by(|a, b| {
                Self::store_rate(&view.flows, self.flow, *a)
                    .partial_cmp(&Self::store_rate(&view.flows, self.flow, *b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.cmp(a))
            })
        else {
            return Vec::new();
        };

        for candidate in hot.iter().filter(|h| h.store_id == hottest_store) {
            let Some(region) = view.meta.get_region(candidate.region_id) else {
                continue;
            };
            if !region.is_healthy() || region.leader_store_id() != Some(hottest_store) {
                continue;
            }

            // Reads serve from the leader, so a leader transfer to a colder
            // follower is the cheap fix. Writes replicate to every peer and
            // only a peer move actually sheds load.
            if self.flow == FlowKind::Read {
                let follower_target = region
                    .follower_peers()
                    .iter()
                    .map(|p| p.store_id)
                    .filter(|id| {
                        view.get_store(*id)
                            .map(|s| s.is_up() && !s.stats.is_busy)
                            .unwrap_or(false)
                    })
                    .min_by(|a, b| {
                        Self::store_rate(&view.flows, self.flow, *a)
                            .partial_cmp(&Self::store_rate(&view.flows, self.flow, *b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.cmp(b))
                    });
                let cold_follower = follower_target.filter(|id| {
                    Self::store_rate(&view.flows, self.flow, *id) < candidate.bytes_rate
                });
                if let Some(target) = cold_follower {
                    match create_transfer_leader(
                        &self.name,
                        &region,
                        target,
                        OpKind::HOT_REGION,
                        view.cfg.store_balance_rate,
                    ) {
                        Ok(op) => {
                            view.counter.inc(&self.name, "new-operator");
                            return vec![op];
                        }
                        Err(_) => {
                            view.counter.inc(&self.name, "create-operator-fail");
                        }
                    }
                }
            }

            // Otherwise move the hot peer to the coldest eligible store.
            let filters: Vec<Box<dyn Filter>> = vec![
                Box::new(StateFilter),
                Box::new(HealthFilter),
                Box::new(SnapshotCountFilter),
                Box::new(PendingPeerCountFilter::new(view.pending_counts())),
                Box::new(StorageThresholdFilter),
                Box::new(SpecialUseFilter::allowing_hot_region()),
                Box::new(StoreLimitFilter::new(
                    view.limiter.clone(),
                    StoreLimitKind::AddPeer,
                )),
                Box::new(ExcludedFilter::targets(region.store_ids())),
            ];
            let target = filter_targets(&view.cfg, &view.stores(), &filters)
                .into_iter()
                .min_by(|a, b| {
                    Self::store_rate(&view.flows, self.flow, a.id)
                        .partial_cmp(&Self::store_rate(&view.flows, self.flow, b.id))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.id.cmp(&b.id))
                });
            let Some(target) = target else {
                view.counter.inc(&self.name, "no-target-store");
                continue;
            };
            match create_move_peer(
                &view.meta,
                &self.name,
                &region,
                hottest_store,
                target.id,
                OpKind::HOT_REGION,
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => {
                    view.counter.inc(&self.name, "new-operator");
                    return vec![op];
                }
                Err(_) => {
                    view.counter.inc(&self.name, "create-operator-fail");
                }
            }
        }
        Vec::new()
    }
}
