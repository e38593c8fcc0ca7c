//! Reactive per-region checks.
//!
//! The replica checker keeps every region at the right replica count, off
//! dead or draining stores, and as spread out across failure domains as the
//! candidates allow. The merge checker folds undersized regions into an
//! adjacent neighbor. Checks run in a fixed order and the first operator
//! produced wins the patrol round for that region.

use std::sync::Arc;

use crate::error::Error;
use crate::filter::{
    DistinctScoreFilter, ExcludedFilter, Filter, HealthFilter, PendingPeerCountFilter,
    ReplicaSelector, SnapshotCountFilter, SpecialUseFilter, StateFilter, StorageThresholdFilter,
    StoreLimitFilter,
};
use crate::limiter::StoreLimitKind;
use crate::metadata::{Peer, Region, StoreId};
use crate::operator::{
    create_add_peer, create_merge_operators, create_move_peer, create_remove_peer, OpKind,
    OpPriority, Operator,
};
use crate::stats::EventCounter;
use crate::view::ClusterView;

const REPLICA_CHECKER: &str = "replica-checker";
const MERGE_CHECKER: &str = "merge-checker";

pub struct ReplicaChecker {
    counter: Arc<EventCounter>,
}

impl ReplicaChecker {
    pub fn new(counter: Arc<EventCounter>) -> Self {
        Self { counter }
    }

    fn base_filters(&self, view: &ClusterView) -> Vec<Box<dyn Filter>> {
        vec![
            Box::new(StoreLimitFilter::new(
                view.limiter.clone(),
                StoreLimitKind::AddPeer,
            )),
            Box::new(HealthFilter),
            Box::new(SnapshotCountFilter),
            Box::new(PendingPeerCountFilter::new(view.pending_counts())),
            Box::new(SpecialUseFilter::new()),
        ]
    }

    pub fn check(&self, view: &ClusterView, region: &Region) -> Option<Operator> {
        self.counter.inc(REPLICA_CHECKER, "check");
        if let Some(mut op) = self.check_down_peer(view, region) {
            self.counter.inc(REPLICA_CHECKER, "new-operator");
            op.set_priority(OpPriority::High);
            return Some(op);
        }
        if let Some(mut op) = self.check_offline_peer(view, region) {
            self.counter.inc(REPLICA_CHECKER, "new-operator");
            op.set_priority(OpPriority::High);
            return Some(op);
        }

        if region.peers.len() < view.cfg.max_replicas && view.cfg.enable_make_up_replica {
            tracing::debug!(
                region_id = region.id,
                peers = region.peers.len(),
                "region has fewer than max replicas"
            );
            let mut filters = self.base_filters(view);
            filters.push(Box::new(StorageThresholdFilter));
            let Some((target, _)) = self.select_store_to_add(view, region, filters) else {
                self.counter.inc(REPLICA_CHECKER, "no-target-store");
                return None;
            };
            match create_add_peer(
                &view.meta,
                "make-up-replica",
                region,
                target,
                OpKind::REPLICA,
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => {
                    self.counter.inc(REPLICA_CHECKER, "new-operator");
                    return Some(op);
                }
                Err(err) => {
                    tracing::debug!(region_id = region.id, error = %err, "make-up-replica failed");
                    self.counter.inc(REPLICA_CHECKER, "create-operator-fail");
                    return None;
                }
            }
        }

        // Learners transiently push the peer count over the cap; only count
        // voters here so in-flight movements are not fought.
        if region.voter_count() > view.cfg.max_replicas && view.cfg.enable_remove_extra_replica {
            let Some((worst, _)) = self.select_worst_peer(view, region) else {
                self.counter.inc(REPLICA_CHECKER, "no-worst-peer");
                return None;
            };
            match create_remove_peer(
                &view.meta,
                "remove-extra-replica",
                region,
                worst.store_id,
                OpKind::REPLICA,
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => {
                    self.counter.inc(REPLICA_CHECKER, "new-operator");
                    return Some(op);
                }
                Err(_) => {
                    self.counter.inc(REPLICA_CHECKER, "create-operator-fail");
                    return None;
                }
            }
        }

        self.check_best_replacement(view, region)
    }

    fn check_down_peer(&self, view: &ClusterView, region: &Region) -> Option<Operator> {
        if !view.cfg.enable_remove_down_replica {
            return None;
        }
        for stats in &region.down_peers {
            let store_id = stats.peer.store_id;
            let Some(store) = view.get_store(store_id) else {
                tracing::warn!(store_id, "down peer references an unknown store");
                return None;
            };
            if store.down_time() < view.cfg.max_store_down_time {
                continue;
            }
            if stats.down_seconds < view.cfg.max_store_down_time.as_secs() {
                continue;
            }
            return self.fix_peer(view, region, &stats.peer, "down");
        }
        None
    }

    fn check_offline_peer(&self, view: &ClusterView, region: &Region) -> Option<Operator> {
        if !view.cfg.enable_replace_offline_replica {
            return None;
        }
        // A learner means a conf-change is already in flight; touching the
        // membership now would race it.
        if region.learner_count() != 0 {
            return None;
        }
        for peer in &region.peers {
            let Some(store) = view.get_store(peer.store_id) else {
                tracing::warn!(store_id = peer.store_id, "peer references an unknown store");
                return None;
            };
            if store.is_up() {
                continue;
            }
            return self.fix_peer(view, region, peer, "offline");
        }
        None
    }

    fn check_best_replacement(&self, view: &ClusterView, region: &Region) -> Option<Operator> {
        if !view.cfg.enable_location_replacement {
            return None;
        }
        let Some((worst, old_score)) = self.select_worst_peer(view, region) else {
            self.counter.inc(REPLICA_CHECKER, "all-right");
            return None;
        };
        let Some((target, new_score)) = self.select_replacement(view, region, &worst, true) else {
            self.counter.inc(REPLICA_CHECKER, "no-replacement-store");
            return None;
        };
        // Only strictly better placements are worth a snapshot.
        if new_score <= old_score {
            self.counter.inc(REPLICA_CHECKER, "not-better");
            return None;
        }
        match create_move_peer(
            &view.meta,
            "move-to-better-location",
            region,
            worst.store_id,
            target,
            OpKind::REPLICA,
            view.cfg.store_balance_rate,
        ) {
            Ok(op) => {
                self.counter.inc(REPLICA_CHECKER, "new-operator");
                Some(op)
            }
            Err(_) => {
                self.counter.inc(REPLICA_CHECKER, "create-operator-fail");
                None
            }
        }
    }

    /// Replace `peer`: shed the extra replica when over-replicated, otherwise
    /// move it to the best candidate store.
    fn fix_peer(
        &self,
        view: &ClusterView,
        region: &Region,
        peer: &Peer,
        status: &str,
    ) -> Option<Operator> {
        if region.peers.len() > view.cfg.max_replicas {
            let desc = format!("remove-extra-{status}-replica");
            return match create_remove_peer(
                &view.meta,
                &desc,
                region,
                peer.store_id,
                OpKind::REPLICA,
                view.cfg.store_balance_rate,
            ) {
                Ok(op) => Some(op),
                Err(_) => {
                    self.counter.inc(REPLICA_CHECKER, &format!("{desc}-fail"));
                    None
                }
            };
        }

        let Some((target, _)) = self.select_replacement(view, region, peer, false) else {
            self.counter.inc(REPLICA_CHECKER, &format!("no-store-{status}"));
            tracing::debug!(region_id = region.id, "no best store to add replica");
            return None;
        };
        let desc = format!("replace-{status}-replica");
        match create_move_peer(
            &view.meta,
            &desc,
            region,
            peer.store_id,
            target,
            OpKind::REPLICA,
            view.cfg.store_balance_rate,
        ) {
            Ok(op) => Some(op),
            Err(_) => {
                self.counter.inc(REPLICA_CHECKER, &format!("{desc}-fail"));
                None
            }
        }
    }

    /// Best store for a fresh replica, with its resulting distinct score.
    fn select_store_to_add(
        &self,
        view: &ClusterView,
        region: &Region,
        mut filters: Vec<Box<dyn Filter>>,
    ) -> Option<(StoreId, f64)> {
        filters.push(Box::new(StateFilter));
        filters.push(Box::new(ExcludedFilter::targets(region.store_ids())));
        let region_stores = view.region_stores(region);
        let selector = ReplicaSelector::new(
            region_stores.clone(),
            view.cfg.location_labels.clone(),
            filters,
        );
        let target = selector.select_target(&view.cfg, &view.stores())?;
        let score = crate::filter::distinct_score(
            &view.cfg.location_labels,
            &region_stores,
            &target,
        );
        Some((target.id, score))
    }

    /// Best store to take over from `old_peer`, scored against the region
    /// with that peer removed.
    fn select_replacement(
        &self,
        view: &ClusterView,
        region: &Region,
        old_peer: &Peer,
        require_better_location: bool,
    ) -> Option<(StoreId, f64)> {
        let mut shrunk = region.clone();
        shrunk.peers.retain(|p| p.store_id != old_peer.store_id);

        let mut filters = self.base_filters(view);
        filters.push(Box::new(StorageThresholdFilter));
        filters.push(Box::new(StateFilter));
        // Exclude every current store, including the one being replaced.
        filters.push(Box::new(ExcludedFilter::targets(region.store_ids())));
        if require_better_location {
            let old_store = view.get_store(old_peer.store_id)?;
            let remaining = view.region_stores(&shrunk);
            filters.push(Box::new(DistinctScoreFilter::new(
                view.cfg.location_labels.clone(),
                remaining,
                &old_store,
            )));
        }

        let region_stores = view.region_stores(&shrunk);
        let selector = ReplicaSelector::new(
            region_stores.clone(),
            view.cfg.location_labels.clone(),
            filters,
        );
        let target = selector.select_target(&view.cfg, &view.stores())?;
        let score = crate::filter::distinct_score(
            &view.cfg.location_labels,
            &region_stores,
            &target,
        );
        Some((target.id, score))
    }

    /// The region's worst-placed peer with its distinct score.
    fn select_worst_peer(&self, view: &ClusterView, region: &Region) -> Option<(Peer, f64)> {
        let region_stores = view.region_stores(region);
        let selector = ReplicaSelector::new(
            region_stores.clone(),
            view.cfg.location_labels.clone(),
            Vec::new(),
        );
        let worst_store = selector.select_source(&view.cfg, &region_stores)?;
        let peer = region.store_peer(worst_store.id)?;
        let score = crate::filter::distinct_score(
            &view.cfg.location_labels,
            &region_stores,
            &worst_store,
        );
        Some((*peer, score))
    }
}

/// Proposes merging undersized regions into an adjacent neighbor.
pub struct MergeChecker {
    counter: Arc<EventCounter>,
}

impl MergeChecker {
    pub fn new(counter: Arc<EventCounter>) -> Self {
        Self { counter }
    }

    fn mergeable(&self, view: &ClusterView, region: &Region) -> bool {
        region.approximate_size < view.cfg.max_merge_region_size
            && region.approximate_keys < view.cfg.max_merge_region_keys
            && region.is_healthy()
    }

    pub fn check(&self, view: &ClusterView, region: &Region) -> Option<(Operator, Operator)> {
        self.counter.inc(MERGE_CHECKER, "check");
        if !self.mergeable(view, region) {
            return None;
        }
        if region.voter_count() != view.cfg.max_replicas {
            self.counter.inc(MERGE_CHECKER, "abnormal-replica");
            return None;
        }

        let (prev, next) = view.meta.adjacent_regions(region);
        let target = [prev, next]
            .into_iter()
            .flatten()
            .filter(|t| self.mergeable(view, t) && t.voter_count() == view.cfg.max_replicas)
            .min_by_key(|t| (t.approximate_size, t.id))?;

        match create_merge_operators(
            "merge-small-region",
            region,
            &target,
            OpKind::default(),
            view.cfg.store_balance_rate,
        ) {
            Ok(pair) => {
                self.counter.inc(MERGE_CHECKER, "new-operator");
                Some(pair)
            }
            Err(Error::RegionNotAdjacent) => None,
            Err(_) => {
                self.counter.inc(MERGE_CHECKER, "create-operator-fail");
                None
            }
        }
    }
}
