//! Adjacent-region scheduler.
//!
//! Two neighboring regions led from the same store with the same replica
//! layout concentrate split load on one node. The fix runs in two stages:
//! first disperse the shared leader peer of the left region to a fresh store,
//! then, once the layouts differ, move the right region's leadership off the
//! old shared store. The second stage is remembered across cycles because the
//! first one changes the pair's shape.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;

use crate::controller::OperatorController;
use crate::filter::{
    filter_targets, ExcludedFilter, Filter, HealthFilter, SnapshotCountFilter, SpecialUseFilter,
    StateFilter, StorageThresholdFilter,
};
use crate::metadata::{Region, RegionId, StoreId};
use crate::operator::{create_move_peer, create_transfer_leader, OpKind, Operator};
use crate::schedulers::{best_follower_target, Scheduler};
use crate::view::ClusterView;

pub const ADJACENT_REGION: &str = "adjacent-region";
pub const DEFAULT_LEADER_LIMIT: u64 = 64;
pub const DEFAULT_PEER_LIMIT: u64 = 1;

const SCAN_LIMIT: usize = 1024;

pub struct AdjacentRegionScheduler {
    name: String,
    leader_limit: u64,
    peer_limit: u64,
    controller: Arc<OperatorController>,
    /// Right-hand regions owed a leader transfer after their left neighbor's
    /// peer was dispersed, keyed to the store leadership must leave.
    pending_leader_fix: Mutex<HashMap<RegionId, StoreId>>,
}

impl AdjacentRegionScheduler {
    pub fn new(controller: Arc<OperatorController>, leader_limit: u64, peer_limit: u64) -> Self {
        Self {
            name: ADJACENT_REGION.to_string(),
            leader_limit,
            peer_limit,
            controller,
            pending_leader_fix: Mutex::new(HashMap::new()),
        }
    }

    pub fn leader_limit(&self) -> u64 {
        self.leader_limit
    }

    pub fn peer_limit(&self) -> u64 {
        self.peer_limit
    }

    fn leader_fix(&self, view: &ClusterView) -> Option<Operator> {
        let mut pending = self.pending_leader_fix.lock().unwrap();
        let ids: Vec<RegionId> = pending.keys().copied().collect();
        for region_id in ids {
            let store_id = pending[&region_id];
            let Some(region) = view.meta.get_region(region_id) else {
                pending.remove(&region_id);
                continue;
            };
            if region.leader_store_id() != Some(store_id) {
                pending.remove(&region_id);
                continue;
            }
            let Some(target) = best_follower_target(view, &region, false) else {
                continue;
            };
            match create_transfer_leader(
                "balance-adjacent-leader",
                &region,
                target,
                OpKind::ADJACENT,
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => {
                    pending.remove(&region_id);
                    return Some(op);
                }
                Err(_) => {
                    pending.remove(&region_id);
                }
            }
        }
        None
    }

    fn disperse_peer(&self, view: &ClusterView, left: &Region, right: &Region) -> Option<Operator> {
        let leader_store = left.leader_store_id()?;
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StateFilter),
            Box::new(HealthFilter),
            Box::new(SnapshotCountFilter),
            Box::new(StorageThresholdFilter),
            Box::new(SpecialUseFilter::new()),
            Box::new(ExcludedFilter::targets(left.store_ids())),
        ];
        let target = filter_targets(&view.cfg, &view.stores(), &filters)
            .into_iter()
            .min_by(|a, b| {
                view.region_score(a)
                    .partial_cmp(&view.region_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })?;
        let op = create_move_peer(
            &view.meta,
            "balance-adjacent-peer",
            left,
            leader_store,
            target.id,
            OpKind::ADJACENT,
            view.cfg.store_balance_rate,
        )
        .ok()?;
        self.pending_leader_fix
            .lock()
            .unwrap()
            .insert(right.id, leader_store);
        Some(op)
    }
}

impl Scheduler for AdjacentRegionScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        ADJACENT_REGION
    }

    fn encode_config(&self) -> serde_json::Value {
        serde_json::json!({
            "leader_limit": self.leader_limit,
            "peer_limit": self.peer_limit,
        })
    }

    fn is_allowed(&self, _view: &ClusterView) -> bool {
        if self.leader_limit == 0 && self.peer_limit == 0 {
            return false;
        }
        let cap = self.leader_limit.max(self.peer_limit) as usize;
        self.controller.operator_count(OpKind::ADJACENT) < cap
    }

    fn schedule(&self, view: &ClusterView, _rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");

        if self.leader_limit > 0 {
            if let Some(op) = self.leader_fix(view) {
                view.counter.inc(&self.name, "new-leader-operator");
                return vec![op];
            }
        }

        let regions = view.meta.scan_regions(b"", SCAN_LIMIT);
        for pair in regions.windows(2) {
            let (left, right) = (&pair[0], &pair[1]);
            if left.end_key.is_empty() || left.end_key != right.start_key {
                continue;
            }
            let (Some(left_leader), Some(right_leader)) =
                (left.leader_store_id(), right.leader_store_id())
            else {
                continue;
            };
            if left_leader != right_leader {
                continue;
            }
            if !left.is_healthy() || !right.is_healthy() {
                continue;
            }

            if left.store_ids() == right.store_ids() {
                if self.peer_limit == 0 {
                    continue;
                }
                if let Some(op) = self.disperse_peer(view, left, right) {
                    view.counter.inc(&self.name, "new-peer-operator");
                    return vec![op];
                }
            } else if self.leader_limit > 0 {
                // Layouts already differ; a leader transfer off the shared
                // store is enough.
                if let Some(target) = best_follower_target(view, left, false) {
                    if let Ok(op) = create_transfer_leader(
                        "balance-adjacent-leader",
                        left,
                        target,
                        OpKind::ADJACENT,
                        view.cfg.store_balance_rate,
                    ) {
                        view.counter.inc(&self.name, "new-leader-operator");
                        return vec![op];
                    }
                }
            }
        }
        view.counter.inc(&self.name, "no-need");
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::config::ScheduleConfig;
    use crate::metadata::Peer;
    use crate::operator::{apply_step, Step};
    use crate::schedulers::testutil::TestCluster;

    #[test]
    fn limits_gate_allowance() {
        let tc = TestCluster::new(ScheduleConfig::default());
        let off = AdjacentRegionScheduler::new(tc.controller.clone(), 0, 0);
        assert!(!off.is_allowed(&tc.view()));
        let leaders_only = AdjacentRegionScheduler::new(tc.controller.clone(), 4, 0);
        assert!(leaders_only.is_allowed(&tc.view()));
        let peers_only = AdjacentRegionScheduler::new(tc.controller.clone(), 0, 2);
        assert!(peers_only.is_allowed(&tc.view()));
    }

    #[test]
    fn identical_twins_get_a_peer_move_then_a_leader_move() {
        let tc = TestCluster::new(ScheduleConfig::default());
        for id in 1..=4 {
            tc.add_leader_store(id, 0);
        }
        // Two adjacent regions, same stores, both led from store 1.
        tc.add_leader_region_with_range(1, b"", b"a", &[1, 2, 3]);
        tc.add_leader_region_with_range(2, b"a", b"b", &[1, 2, 3]);

        let scheduler = AdjacentRegionScheduler::new(
            tc.controller.clone(),
            DEFAULT_LEADER_LIMIT,
            DEFAULT_PEER_LIMIT,
        );
        let mut rng = SmallRng::seed_from_u64(6);

        // Cycle one: disperse region 1's leader peer to store 4.
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc(), "balance-adjacent-peer");
        assert_eq!(ops[0].region_id(), 1);
        assert!(matches!(
            ops[0].step(0),
            Some(Step::AddPeer { store_id: 4, .. })
        ));

        // The stores execute the move.
        let mut r1 = tc.meta.get_region(1).unwrap();
        for i in 0..ops[0].len() {
            apply_step(&mut r1, ops[0].step(i).unwrap());
        }
        tc.meta.put_region(r1).unwrap();

        // Cycle two: region 2's leadership leaves the old shared store.
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc(), "balance-adjacent-leader");
        assert_eq!(ops[0].region_id(), 2);
        match ops[0].step(0) {
            Some(Step::TransferLeader { from: 1, to }) => assert_ne!(*to, 1),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn different_layouts_get_a_direct_leader_transfer() {
        let tc = TestCluster::new(ScheduleConfig::default());
        for id in 1..=4 {
            tc.add_leader_store(id, 0);
        }
        tc.add_leader_region_with_range(1, b"b", b"c", &[1, 2, 3]);
        tc.add_leader_region_with_range(2, b"c", b"d", &[1, 3, 4]);

        let scheduler = AdjacentRegionScheduler::new(
            tc.controller.clone(),
            DEFAULT_LEADER_LIMIT,
            DEFAULT_PEER_LIMIT,
        );
        let mut rng = SmallRng::seed_from_u64(6);
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc(), "balance-adjacent-leader");
        assert_eq!(ops[0].region_id(), 1);
        assert!(matches!(
            ops[0].step(0),
            Some(Step::TransferLeader { from: 1, .. })
        ));
    }

    #[test]
    fn settled_neighbors_need_nothing() {
        let tc = TestCluster::new(ScheduleConfig::default());
        for id in 1..=3 {
            tc.add_leader_store(id, 0);
        }
        tc.add_leader_region_with_range(1, b"", b"a", &[1, 2, 3]);
        let mut r2 = crate::metadata::Region {
            id: 2,
            start_key: b"a".to_vec(),
            end_key: b"b".to_vec(),
            epoch: crate::metadata::RegionEpoch::new(1, 1),
            peers: vec![
                Peer::voter(201, 2),
                Peer::voter(202, 1),
                Peer::voter(203, 3),
            ],
            approximate_size: 10,
            ..Default::default()
        };
        r2.leader = Some(Peer::voter(201, 2));
        tc.meta.put_region(r2).unwrap();

        let scheduler = AdjacentRegionScheduler::new(
            tc.controller.clone(),
            DEFAULT_LEADER_LIMIT,
            DEFAULT_PEER_LIMIT,
        );
        let mut rng = SmallRng::seed_from_u64(6);
        assert!(scheduler.schedule(&tc.view(), &mut rng).is_empty());
        assert_eq!(tc.counter.get(ADJACENT_REGION, "no-need"), 1);
    }
}
