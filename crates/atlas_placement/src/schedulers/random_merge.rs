//! Random-merge: periodically fold a random small region into an adjacent
//! neighbor, keeping region counts from creeping up on mostly-deleted
//! keyspaces.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::controller::OperatorController;
use crate::metadata::Region;
use crate::operator::{create_merge_operators, OpKind, Operator};
use crate::schedulers::Scheduler;
use crate::view::ClusterView;

pub const RANDOM_MERGE: &str = "random-merge";

pub struct RandomMergeScheduler {
    name: String,
    controller: Arc<OperatorController>,
}

impl RandomMergeScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self {
            name: RANDOM_MERGE.to_string(),
            controller,
        }
    }

    fn small_enough(view: &ClusterView, region: &Region) -> bool {
        region.approximate_size < view.cfg.max_merge_region_size
            && region.approximate_keys < view.cfg.max_merge_region_keys
            && region.is_healthy()
    }
}

impl Scheduler for RandomMergeScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        RANDOM_MERGE
    }

    fn is_allowed(&self, view: &ClusterView) -> bool {
        self.controller.operator_count(OpKind::MERGE) < view.cfg.merge_schedule_limit
    }

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator> {
        view.counter.inc(&self.name, "schedule");
        let mut stores = view.stores();
        stores.retain(|s| s.is_up());
        stores.shuffle(rng);

        for store in stores {
            let Some(region) = view.random_healthy_leader_region(store.id, rng) else {
                continue;
            };
            if !Self::small_enough(view, &region) {
                continue;
            }
            let (prev, next) = view.meta.adjacent_regions(&region);
            let Some(target) = [prev, next]
                .into_iter()
                .flatten()
                .filter(|t| Self::small_enough(view, t))
                .min_by_key(|t| (t.approximate_size, t.id))
            else {
                continue;
            };
            match create_merge_operators(
                RANDOM_MERGE,
                &region,
                &target,
                OpKind::ADMIN,
                view.cfg.store_balance_rate,
            ) {
                Ok((active, passive)) => {
                    view.counter.inc(&self.name, "new-operator");
                    return vec![active, passive];
                }
                Err(_) => view.counter.inc(&self.name, "create-operator-fail"),
            }
        }
        view.counter.inc(&self.name, "no-region");
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::config::ScheduleConfig;
    use crate::schedulers::testutil::TestCluster;

    #[test]
    fn merges_a_small_region_with_its_neighbor() {
        let tc = TestCluster::new(ScheduleConfig::default());
        for id in 1..=3 {
            tc.add_leader_store(id, 0);
        }
        tc.add_leader_region_with_range(1, b"", b"a", &[1, 2, 3]);
        tc.add_leader_region_with_range(2, b"a", b"b", &[1, 2, 3]);
        tc.add_leader_region_with_range(3, b"b", b"", &[1, 2, 3]);

        let scheduler = RandomMergeScheduler::new(tc.controller.clone());
        assert!(scheduler.is_allowed(&tc.view()));
        let mut rng = SmallRng::seed_from_u64(13);
        let ops = scheduler.schedule(&tc.view(), &mut rng);
        assert_eq!(ops.len(), 2, "merge proposes an operator pair");
        assert!(ops.iter().all(|op| op.kind().contains(OpKind::MERGE)));
        assert!(ops.iter().all(|op| op.kind().contains(OpKind::ADMIN)));
        assert_ne!(ops[0].region_id(), ops[1].region_id());
    }

    #[test]
    fn big_regions_are_left_alone() {
        let mut cfg = ScheduleConfig::default();
        cfg.max_merge_region_size = 5;
        let tc = TestCluster::new(cfg);
        for id in 1..=3 {
            tc.add_leader_store(id, 0);
        }
        tc.add_leader_region_with_range(1, b"", b"a", &[1, 2, 3]);
        tc.add_leader_region_with_range(2, b"a", b"", &[1, 2, 3]);

        let scheduler = RandomMergeScheduler::new(tc.controller.clone());
        let mut rng = SmallRng::seed_from_u64(13);
        assert!(scheduler.schedule(&tc.view(), &mut rng).is_empty());
    }
}
