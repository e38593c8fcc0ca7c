//! Label-driven leadership placement: the label scheduler honors the
//! reject-leader label property, evict/grant force leadership off or onto an
//! explicit store set.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::SmallRng;

use crate::config::REJECT_LEADER_PROPERTY;
use crate::controller::OperatorController;
use crate::metadata::StoreId;
use crate::operator::{create_transfer_leader, OpKind, Operator};
use crate::schedulers::{best_follower_target, Scheduler};
use crate::view::ClusterView;

pub const LABEL: &str = "label";
pub const EVICT_LEADER: &str = "evict-leader";
pub const GRANT_LEADER: &str = "grant-leader";

/// Drains leadership from stores carrying the reject-leader property.
pub struct LabelScheduler {
    name: String,
    controller: Arc<OperatorController>,
}

impl LabelScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self {
            name: LABEL.to_string(),
            controller,
        }
    }
}

impl Scheduler for LabelScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        LABEL
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::LEADER) < view.cfg.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let mut rejecting: Vec<StoreId> = view
            .stores()
            .iter()
            .filter(|s| view.cfg.store_has_property(REJECT_LEADER_PROPERTY, &s.labels))
            .map(|s| s.id)
            .collect();
        rejecting.sort_unstable();

        for store_id in rejecting {
            let Some(region) = view.random_leader_region(store_id, rng) else {
                continue;
            };
            let Some(target) = best_follower_target(view, &region, true) else {
                view.counter.inc(&self.name, "no-target-store");
                continue;
            };
            match create_transfer_leader(
                "label-reject-leader",
                &region,
                target,
                OpKind::default(),
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

/// Forces leadership off a fixed store set.
pub struct EvictLeaderScheduler {
    name: String,
    stores: BTreeSet<StoreId>,
    controller: Arc<OperatorController>,
}

impl EvictLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>, stores: BTreeSet<StoreId>) -> Self {
        Self {
            name: EVICT_LEADER.to_string(),
            stores,
            controller,
        }
    }
}

impl Scheduler for EvictLeaderScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        EVICT_LEADER
    }

    fn encode_config(&self) -> serde_json::Value {
        serde_json::json!({ "store_ids": self.stores.iter().copied().collect::<Vec<_>>() })
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::LEADER) < view.cfg.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        for &store_id in &self.stores {
            let Some(region) = view.random_leader_region(store_id, rng) else {
                continue;
            };
            let Some(target) = best_follower_target(view, &region, true) else {
                view.counter.inc(&self.name, "no-target-store");
                continue;
            };
            match create_transfer_leader(
                EVICT_LEADER,
                &region,
                target,
                OpKind::default(),
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => {
                    view.counter.inc(&self.name, "new-operator");
                    return vec![op];
                }
                Err(_) => view.counter.inc(&self.name, "create-operator-fail"),
            }
        }
        view.counter.inc(&self.name, "no-leader");
        Vec::new()
    }
}

/// Forces leadership onto a fixed store set.
pub struct GrantLeaderScheduler {
    name: String,
    stores: BTreeSet<StoreId>,
    controller: Arc<OperatorController>,
}

impl GrantLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>, stores: BTreeSet<StoreId>) -> Self {
        Self {
            name: GRANT_LEADER.to_string(),
            stores,
            controller,
        }
    }
}

impl Scheduler for GrantLeaderScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        GRANT_LEADER
    }

    fn encode_config(&self) -> serde_json::Value {
        serde_json::json!({ "store_ids": self.stores.iter().copied().collect::<Vec<_>>() })
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::LEADER) < view.cfg.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        for &store_id in &self.stores {
            let Some(region) = view.random_follower_region(store_id, rng) else {
                continue;
            };
            // Only grab leadership through a settled voter.
            let eligible = region
                .store_peer(store_id)
                .map(|p| !p.is_learner() && !region.pending_peer_on(store_id))
                .unwrap_or(false);
            if !eligible {
                continue;
            }
            match create_transfer_leader(
                GRANT_LEADER,
                &region,
                store_id,
                OpKind::default(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::config::ScheduleConfig;
    use crate::metadata::{Peer, Store};
    use crate::operator::Step;
    use crate::schedulers::testutil::TestCluster;

    fn reject_leader_cfg() -> ScheduleConfig {
        let mut cfg = ScheduleConfig::default();
        cfg.label_properties.insert(
            REJECT_LEADER_PROPERTY.to_string(),
            vec![("noleader".to_string(), "true".to_string())],
        );
        cfg
    }

    #[test]
    fn label_scheduler_drains_rejecting_stores() {
        let tc = TestCluster::new(reject_leader_cfg());
        let mut s1 = Store::new(1, "s1");
        s1.labels
            .insert("noleader".to_string(), "true".to_string());
        tc.meta.put_store(s1).unwrap();
        tc.add_leader_store(2, 0);
        tc.add_leader_store(3, 0);
        tc.add_leader_region(1, &[1, 2, 3]);
        tc.add_leader_region(2, &[2, 1, 3]);

        let scheduler = LabelScheduler::new(tc.controller.clone());
        let mut rng = SmallRng::seed_from_u64(2);
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        // Store 3 is the emptier follower; leadership leaves store 1.
        assert!(matches!(
            ops[0].step(0),
            Some(Step::TransferLeader { from: 1, to: 3 })
        ));

        // With a pending peer on store 3, fall back to store 2.
        let mut region = tc.meta.get_region(1).unwrap();
        let on3: Vec<Peer> = region
            .peers
            .iter()
            .filter(|p| p.store_id == 3)
            .copied()
            .collect();
        region.pending_peers = on3;
        tc.meta.put_region(region).unwrap();
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0].step(0),
            Some(Step::TransferLeader { from: 1, to: 2 })
        ));
    }

    #[test]
    fn evict_leader_moves_leadership_away() {
        let tc = TestCluster::new(ScheduleConfig::default());
        for id in 1..=3 {
            tc.add_leader_store(id, 0);
        }
        tc.add_leader_region(1, &[1, 2]);
        tc.add_leader_region(2, &[2, 1]);
        tc.add_leader_region(3, &[3, 1]);

        let scheduler =
            EvictLeaderScheduler::new(tc.controller.clone(), BTreeSet::from([1]));
        assert!(scheduler.is_allowed(&tc.view()));
        let mut rng = SmallRng::seed_from_u64(2);
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0].step(0),
            Some(Step::TransferLeader { from: 1, to: 2 })
        ));
        assert_eq!(
            scheduler.encode_config(),
            serde_json::json!({ "store_ids": [1] })
        );
    }

    #[test]
    fn grant_leader_pulls_leadership_in() {
        let tc = TestCluster::new(ScheduleConfig::default());
        for id in 1..=3 {
            tc.add_leader_store(id, 0);
        }
        tc.add_leader_region(1, &[1, 2, 3]);

        let scheduler =
            GrantLeaderScheduler::new(tc.controller.clone(), BTreeSet::from([3]));
        let mut rng = SmallRng::seed_from_u64(2);
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0].step(0),
            Some(Step::TransferLeader { from: 1, to: 3 })
        ));
    }
}
