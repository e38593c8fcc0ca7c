//! Shuffle schedulers: randomized churn for chaos testing. All operators are
//! Admin-kind so they bypass store-limit accounting.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::controller::OperatorController;
use crate::filter::{
    filter_targets, ExcludedFilter, Filter, HealthFilter, SnapshotCountFilter, SpecialUseFilter,
    StateFilter, StorageThresholdFilter,
};
use crate::metadata::{PeerRole, Region, StoreId};
use crate::operator::{create_move_peer, create_transfer_leader, OpKind, Operator};
use crate::schedulers::Scheduler;
use crate::stats::FlowKind;
use crate::view::ClusterView;

pub const SHUFFLE_LEADER: &str = "shuffle-leader";
pub const SHUFFLE_REGION: &str = "shuffle-region";
pub const SHUFFLE_HOT_REGION: &str = "shuffle-hot-region";

/// Hands leadership to a random follower store.
pub struct ShuffleLeaderScheduler {
    name: String,
    controller: Arc<OperatorController>,
}

impl ShuffleLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self {
            name: SHUFFLE_LEADER.to_string(),
            controller,
        }
    }
}

impl Scheduler for ShuffleLeaderScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        SHUFFLE_LEADER
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::LEADER) < view.cfg.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let mut stores: Vec<StoreId> = filter_targets(
            &view.cfg,
            &view.stores(),
            &[Box::new(StateFilter) as Box<dyn Filter>, Box::new(HealthFilter)],
        )
        .into_iter()
        .map(|s| s.id)
        .collect();
        stores.shuffle(rng);

        for target in stores {
            let Some(region) = view.random_follower_region(target, rng) else {
                continue;
            };
            if region.pending_peer_on(target) || region.down_peer_on(target) {
                continue;
            }
            match create_transfer_leader(
                SHUFFLE_LEADER,
                &region,
                target,
                OpKind::ADMIN,
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => {
                    view.counter.inc(&self.name, "new-operator");
                    return vec![op];
                }
                Err(_) => view.counter.inc(&self.name, "create-operator-fail"),
            }
        }
        view.counter.inc(&self.name, "no-follower");
        Vec::new()
    }
}

/// Moves a random peer of the configured role to a random other store.
pub struct ShuffleRegionScheduler {
    name: String,
    roles: Vec<String>,
    controller: Arc<OperatorController>,
}

impl ShuffleRegionScheduler {
    pub fn new(controller: Arc<OperatorController>, roles: Vec<String>) -> Self {
        Self {
            name: SHUFFLE_REGION.to_string(),
            roles,
            controller,
        }
    }

    fn pick_region(
        &self,
        view: &ClusterView,
        source: StoreId,
        rng: &mut SmallRng,
    ) -> Option<Region> {
        for role in &self.roles {
            let region = match role.as_str() {
                "leader" => view.random_leader_region(source, rng),
                "follower" => view.random_follower_region(source, rng),
                "learner" => view
                    .meta
                    .regions_on_store(source)
                    .into_iter()
                    .find(|r| {
                        r.store_peer(source)
                            .map(|p| p.role == PeerRole::Learner)
                            .unwrap_or(false)
                    }),
                _ => None,
            };
            if let Some(region) = region {
                let eligible = match role.as_str() {
                    "follower" => region
                        .store_peer(source)
                        .map(|p| !p.is_learner())
                        .unwrap_or(false),
                    _ => true,
                };
                if eligible {
                    return Some(region);
                }
            }
        }
        None
    }
}

impl Scheduler for ShuffleRegionScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        SHUFFLE_REGION
    }

    fn encode_config(&self) -> serde_json::Value {
        serde_json::json!({ "roles": self.roles })
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::REGION) < view.cfg.region_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let mut sources: Vec<StoreId> = view
            .stores()
            .iter()
            .filter(|s| !s.is_tombstone())
            .map(|s| s.id)
            .collect();
        sources.shuffle(rng);

        for source in sources {
            let Some(region) = self.pick_region(view, source, rng) else {
                continue;
            };
            let filters: Vec<Box<dyn Filter>> = vec![
                Box::new(StateFilter),
                Box::new(HealthFilter),
                Box::new(SnapshotCountFilter),
                Box::new(StorageThresholdFilter),
                Box::new(SpecialUseFilter::new()),
                Box::new(ExcludedFilter::targets(region.store_ids())),
            ];
            let mut candidates = filter_targets(&view.cfg, &view.stores(), &filters);
            candidates.shuffle(rng);
            let Some(target) = candidates.first() else {
                view.counter.inc(&self.name, "no-target-store");
                continue;
            };
            match create_move_peer(
                &view.meta,
                SHUFFLE_REGION,
                &region,
                source,
                target.id,
                OpKind::ADMIN,
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => {
                    view.counter.inc(&self.name, "new-operator");
                    return vec![op];
                }
                Err(_) => view.counter.inc(&self.name, "create-operator-fail"),
            }
        }
        view.counter.inc(&self.name, "no-region");
        Vec::new()
    }
}

/// Moves a random hot region's peer away from its leader store, taking
/// leadership along.
pub struct ShuffleHotRegionScheduler {
    name: String,
    controller: Arc<OperatorController>,
}

impl ShuffleHotRegionScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self {
            name: SHUFFLE_HOT_REGION.to_string(),
            controller,
        }
    }
}

impl Scheduler for ShuffleHotRegionScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        SHUFFLE_HOT_REGION
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::HOT_REGION)
            < view.cfg.hot_region_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let mut hot = view.flows.hot_regions(FlowKind::Write, 16);
        hot.shuffle(rng);

        for candidate in hot {
            let Some(region) = view.meta.get_region(candidate.region_id) else {
                continue;
            };
            if region.leader_store_id() != Some(candidate.store_id) || !region.is_healthy() {
                continue;
            }
            let filters: Vec<Box<dyn Filter>> = vec![
                Box::new(StateFilter),
                Box::new(HealthFilter),
                Box::new(SnapshotCountFilter),
                Box::new(StorageThresholdFilter),
                Box::new(SpecialUseFilter::allowing_hot_region()),
                Box::new(ExcludedFilter::targets(region.store_ids())),
            ];
            let mut candidates = filter_targets(&view.cfg, &view.stores(), &filters);
            candidates.shuffle(rng);
            let Some(target) = candidates.first() else {
                view.counter.inc(&self.name, "no-target-store");
                continue;
            };
            // Moving the leader's peer carries leadership to the new store.
            match create_move_peer(
                &view.meta,
                SHUFFLE_HOT_REGION,
                &region,
                candidate.store_id,
                target.id,
                OpKind::HOT_REGION | OpKind::ADMIN,
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => {
                    view.counter.inc(&self.name, "new-operator");
                    return vec![op];
                }
                Err(_) => view.counter.inc(&self.name, "create-operator-fail"),
            }
        }
        view.counter.inc(&self.name, "no-hot-region");
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::config::ScheduleConfig;
    use crate::heartbeat::RegionHeartbeat;
    use crate::metadata::Peer;
    use crate::operator::Step;
    use crate::schedulers::testutil::TestCluster;

    #[test]
    fn shuffle_leader_emits_admin_leader_operators() {
        let tc = TestCluster::new(ScheduleConfig::default());
        tc.add_leader_store(1, 6);
        tc.add_leader_store(2, 7);
        tc.add_leader_store(3, 8);
        tc.add_leader_store(4, 9);
        tc.add_leader_region(1, &[1, 2, 3, 4]);
        tc.add_leader_region(2, &[2, 3, 4, 1]);
        tc.add_leader_region(3, &[3, 4, 1, 2]);
        tc.add_leader_region(4, &[4, 1, 2, 3]);

        let scheduler = ShuffleLeaderScheduler::new(tc.controller.clone());
        let mut rng = SmallRng::seed_from_u64(9);
        for _ in 0..4 {
            let ops = scheduler.schedule(&tc.view(), &mut rng);
            assert_eq!(ops.len(), 1);
            assert_eq!(ops[0].kind(), OpKind::LEADER | OpKind::ADMIN);
        }
    }

    #[test]
    fn shuffle_region_moves_the_configured_role() {
        let tc = TestCluster::new(ScheduleConfig::default());
        for id in 1..=4 {
            tc.add_leader_store(id, 0);
        }
        tc.add_leader_region(1, &[1, 2, 3]);

        // Follower shuffling never touches the leader peer.
        let scheduler =
            ShuffleRegionScheduler::new(tc.controller.clone(), vec!["follower".to_string()]);
        let mut rng = SmallRng::seed_from_u64(4);
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind(), OpKind::REGION | OpKind::ADMIN);
        let has_leader_transfer = (0..ops[0].len())
            .any(|i| matches!(ops[0].step(i), Some(Step::TransferLeader { .. })));
        assert!(!has_leader_transfer);
        assert!(matches!(
            ops[0].step(ops[0].len() - 1),
            Some(Step::RemovePeer { store_id: 2 | 3 })
        ));

        // Learner shuffling picks the learner peer.
        let mut region = tc.meta.get_region(1).unwrap();
        region.peers.push(Peer::learner(999, 4));
        region.epoch.conf_ver += 1;
        tc.meta.put_region(region).unwrap();
        let scheduler =
            ShuffleRegionScheduler::new(tc.controller.clone(), vec!["learner".to_string()]);
        // No free store remains, so nothing can move.
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert!(ops.is_empty());
    }

    #[test]
    fn shuffle_hot_region_carries_leadership_with_the_peer() {
        let mut cfg = ScheduleConfig::default();
        cfg.hot_cache_hits = 0;
        let tc = TestCluster::new(cfg);
        for id in 1..=4 {
            tc.add_leader_store(id, 0);
        }
        tc.add_leader_region(1, &[1, 2, 3]);
        let region = tc.meta.get_region(1).unwrap();
        let mut hb = RegionHeartbeat::from_region(&region, 10).unwrap();
        hb.bytes_written = 512 << 20;
        tc.flows.record(&hb);
        tc.flows.record(&hb);

        let scheduler = ShuffleHotRegionScheduler::new(tc.controller.clone());
        let mut rng = SmallRng::seed_from_u64(4);
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        let add_store = match op.step(0) {
            Some(Step::AddPeer { store_id, .. }) => *store_id,
            other => panic!("unexpected step: {other:?}"),
        };
        assert_eq!(add_store, 4);
        let transfer_to = (0..op.len()).find_map(|i| match op.step(i) {
            Some(Step::TransferLeader { to, .. }) => Some(*to),
            _ => None,
        });
        assert_eq!(transfer_to, Some(add_store));
    }
}
