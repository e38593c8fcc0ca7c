//! Leader and region balancing.

use std::sync::Arc;

use rand::rngs::SmallRng;

use crate::config::SchedulePolicy;
use crate::controller::OperatorController;
use crate::filter::{
    BalanceSelector, ExcludedFilter, Filter, HealthFilter, PendingPeerCountFilter,
    RejectLeaderFilter, ScheduleKind, SnapshotCountFilter, SpecialUseFilter, StateFilter,
    StorageThresholdFilter, StoreLimitFilter,
};
use crate::limiter::StoreLimitKind;
use crate::metadata::ResourceKind;
use crate::operator::{create_move_peer, create_transfer_leader, OpKind, Operator};
use crate::schedulers::{best_follower_target, Scheduler};
use crate::view::ClusterView;

pub const BALANCE_LEADER: &str = "balance-leader";
pub const BALANCE_REGION: &str = "balance-region";

/// Moves leadership from the most leader-loaded store to the least loaded of
/// a region's followers.
pub struct BalanceLeaderScheduler {
    name: String,
    controller: Arc<OperatorController>,
}

impl BalanceLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self {
            name: BALANCE_LEADER.to_string(),
            controller,
        }
    }
}

impl Scheduler for BalanceLeaderScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        BALANCE_LEADER
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::LEADER) < view.cfg.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let stores = view.stores();
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StateFilter),
            Box::new(HealthFilter),
            Box::new(RejectLeaderFilter),
        ];
        let selector = BalanceSelector::new(
            ScheduleKind {
                resource: ResourceKind::Leader,
                policy: view.cfg.leader_schedule_policy,
            },
            filters,
        );
        let Some(source) = selector.select_source(&view.cfg, &stores) else {
            view.counter.inc(&self.name, "no-source-store");
            return Vec::new();
        };
        let Some(region) = view.random_healthy_leader_region(source.id, rng) else {
            view.counter.inc(&self.name, "no-leader-region");
            return Vec::new();
        };
        let Some(target_id) = best_follower_target(view, &region, true) else {
            view.counter.inc(&self.name, "no-target-store");
            return Vec::new();
        };
        let Some(target) = view.get_store(target_id) else {
            return Vec::new();
        };

        let policy = view.cfg.leader_schedule_policy;
        let source_score = view.leader_score(&source);
        let target_score = view.leader_score(&target);
        if !view.should_balance(source_score, target_score, &region, policy) {
            view.counter.inc(&self.name, "skip");
            return Vec::new();
        }

        match create_transfer_leader(
            BALANCE_LEADER,
            &region,
            target_id,
            OpKind::BALANCE,
            view.cfg.store_balance_rate,
        ) {
            Ok(op) => {
                view.counter.inc(&self.name, "new-operator");
                vec![op]
            }
            Err(err) => {
                tracing::debug!(region_id = region.id, error = %err, "balance-leader failed");
                view.counter.inc(&self.name, "create-operator-fail");
                Vec::new()
            }
        }
    }
}

/// Moves a replica from the most region-loaded store to the emptiest store
/// that passes placement filters.
pub struct BalanceRegionScheduler {
    name: String,
    controller: Arc<OperatorController>,
}

impl BalanceRegionScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self {
            name: BALANCE_REGION.to_string(),
            controller,
        }
    }
}

impl Scheduler for BalanceRegionScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        BALANCE_REGION
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::REGION) < view.cfg.region_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let stores = view.stores();
        let source_selector = BalanceSelector::new(
            ScheduleKind {
                resource: ResourceKind::Region,
                policy: SchedulePolicy::BySize,
            },
            vec![Box::new(StateFilter), Box::new(HealthFilter)],
        );
        let Some(source) = source_selector.select_source(&view.cfg, &stores) else {
            view.counter.inc(&self.name, "no-source-store");
            return Vec::new();
        };

        // Prefer calm regions: retry the random pick a few times to dodge hot
        // or mid-confchange regions.
        let mut picked = None;
        for _ in 0..3 {
            let Some(region) = view.random_healthy_leader_region(source.id, rng) else {
                break;
            };
            let hot = view.flows.is_hot(region.id, crate::stats::FlowKind::Write)
                || view.flows.is_hot(region.id, crate::stats::FlowKind::Read);
            if !hot {
                picked = Some(region);
                break;
            }
            picked = Some(region);
        }
        let Some(region) = picked else {
            view.counter.inc(&self.name, "no-region");
            return Vec::new();
        };
        if region.voter_count() != view.cfg.max_replicas {
            view.counter.inc(&self.name, "abnormal-replica");
            return Vec::new();
        }

        let target_filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StateFilter),
            Box::new(HealthFilter),
            Box::new(SnapshotCountFilter),
            Box::new(PendingPeerCountFilter::new(view.pending_counts())),
            Box::new(StorageThresholdFilter),
            Box::new(SpecialUseFilter::new()),
            Box::new(StoreLimitFilter::new(
                view.limiter.clone(),
                StoreLimitKind::AddPeer,
            )),
            Box::new(ExcludedFilter::targets(region.store_ids())),
        ];
        let target_selector = BalanceSelector::new(
            ScheduleKind {
                resource: ResourceKind::Region,
                policy: SchedulePolicy::BySize,
            },
            target_filters,
        );
        let Some(target) = target_selector.select_target(&view.cfg, &stores) else {
            view.counter.inc(&self.name, "no-target-store");
            return Vec::new();
        };

        let source_score = view.region_score(&source);
        let target_score = view.region_score(&target);
        if !view.should_balance(source_score, target_score, &region, SchedulePolicy::BySize) {
            view.counter.inc(&self.name, "skip");
            return Vec::new();
        }

        match create_move_peer(
            &view.meta,
            BALANCE_REGION,
            &region,
            source.id,
            target.id,
            OpKind::BALANCE,
            view.cfg.store_balance_rate,
        ) {
            Ok(op) => {
                view.counter.inc(&self.name, "new-operator");
                vec![op]
            }
            Err(err) => {
                tracing::debug!(region_id = region.id, error = %err, "balance-region failed");
                view.counter.inc(&self.name, "create-operator-fail");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::config::ScheduleConfig;
    use crate::metadata::Store;
    use crate::operator::Step;
    use crate::schedulers::testutil::TestCluster;

    #[test]
    fn balance_leader_moves_from_busiest_to_emptiest_follower() {
        let mut cfg = ScheduleConfig::default();
        cfg.tolerant_size_ratio = 2.0;
        let tc = TestCluster::new(cfg);
        for id in 1..=4 {
            tc.add_leader_store(id, 0);
        }
        // Store 1 leads everything; stores 2-4 idle.
        for id in 1..=8 {
            tc.add_leader_region(id, &[1, 2, 3]);
        }

        let scheduler = BalanceLeaderScheduler::new(tc.controller.clone());
        let view = tc.view();
        assert!(scheduler.is_allowed(&view));
        let mut rng = SmallRng::seed_from_u64(1);
        let ops = scheduler.schedule(&view, &mut rng);
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert!(op.kind().contains(OpKind::LEADER));
        assert!(op.kind().contains(OpKind::BALANCE));
        match op.step(0) {
            Some(Step::TransferLeader { from: 1, to }) => assert!([2, 3].contains(to)),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn balance_leader_respects_tolerance() {
        let tc = TestCluster::new(ScheduleConfig::default());
        for id in 1..=3 {
            tc.add_leader_store(id, 0);
        }
        // Gap of one leader is within tolerance.
        tc.add_leader_region(1, &[1, 2, 3]);
        tc.add_leader_region(2, &[2, 1, 3]);

        let scheduler = BalanceLeaderScheduler::new(tc.controller.clone());
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(scheduler.schedule(&tc.view(), &mut rng).is_empty());
        assert_eq!(tc.counter.get(BALANCE_LEADER, "skip"), 1);
    }

    #[test]
    fn balance_region_moves_replica_off_the_fullest_store() {
        let mut cfg = ScheduleConfig::default();
        cfg.tolerant_size_ratio = 2.0;
        let tc = TestCluster::new(cfg);
        for id in 1..=4 {
            tc.add_leader_store(id, 0);
        }
        for id in 1..=5 {
            tc.add_leader_region(id, &[1, 2, 3]);
        }

        let scheduler = BalanceRegionScheduler::new(tc.controller.clone());
        let view = tc.view();
        let mut rng = SmallRng::seed_from_u64(3);
        let ops = scheduler.schedule(&view, &mut rng);
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert!(op.kind().contains(OpKind::REGION));
        match op.step(0) {
            Some(Step::AddPeer { store_id: 4, .. }) => {}
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn balance_region_shuns_special_use_stores() {
        let mut cfg = ScheduleConfig::default();
        cfg.tolerant_size_ratio = 2.0;
        let tc = TestCluster::new(cfg);
        for id in 1..=3 {
            tc.add_leader_store(id, 0);
        }
        let mut special = Store::new(4, "s4");
        special.labels.insert(
            crate::config::SPECIAL_USE_LABEL.to_string(),
            crate::config::SPECIAL_USE_RESERVED.to_string(),
        );
        tc.meta.put_store(special).unwrap();
        for id in 1..=5 {
            tc.add_leader_region(id, &[1, 2, 3]);
        }

        let scheduler = BalanceRegionScheduler::new(tc.controller.clone());
        let mut rng = SmallRng::seed_from_u64(3);
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert!(ops.is_empty());
        assert_eq!(tc.counter.get(BALANCE_REGION, "no-target-store"), 1);
    }
}
