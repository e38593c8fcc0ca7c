//! Read view over cluster state for checkers and schedulers.
//!
//! A view bundles the metadata map, a config snapshot, the store limiter, and
//! flow stats. Scatter-range derives a restricted view covering only one key
//! range: scores and random picks are then computed against regions in that
//! range, and the tolerance ratio can be overridden.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::config::{ScheduleConfig, SchedulePolicy};
use crate::metadata::{MetaStore, Region, ResourceKind, Store, StoreId};
use crate::limiter::StoreLimiter;
use crate::stats::{EventCounter, FlowStats};

#[derive(Clone)]
pub struct ClusterView {
    pub meta: Arc<MetaStore>,
    pub cfg: ScheduleConfig,
    pub limiter: Arc<StoreLimiter>,
    pub flows: Arc<FlowStats>,
    pub counter: Arc<EventCounter>,
    key_range: Option<(Vec<u8>, Vec<u8>)>,
    tolerant_override: Option<f64>,
}

impl ClusterView {
    pub fn new(
        meta: Arc<MetaStore>,
        cfg: ScheduleConfig,
        limiter: Arc<StoreLimiter>,
        flows: Arc<FlowStats>,
        counter: Arc<EventCounter>,
    ) -> Self {
        Self {
            meta,
            cfg,
            limiter,
            flows,
            counter,
            key_range: None,
            tolerant_override: None,
        }
    }

    /// Restrict the view to `[start, end)` with its own tolerance ratio.
    pub fn range_view(&self, start: Vec<u8>, end: Vec<u8>, tolerant_ratio: f64) -> Self {
        let mut view = self.clone();
        view.key_range = Some((start, end));
        view.tolerant_override = Some(tolerant_ratio);
        view
    }

    pub fn key_range(&self) -> Option<(&[u8], &[u8])> {
        self.key_range
            .as_ref()
            .map(|(s, e)| (s.as_slice(), e.as_slice()))
    }

    pub fn tolerant_size_ratio(&self) -> f64 {
        self.tolerant_override.unwrap_or(self.cfg.tolerant_size_ratio)
    }

    /// Store records, with leader/region counters recomputed over the
    /// restricted range when one is set. Selectors scoring these stores are
    /// then automatically range-scoped.
    pub fn stores(&self) -> Vec<Store> {
        self.meta
            .stores()
            .into_iter()
            .map(|s| self.adjust_store(s))
            .collect()
    }

    pub fn get_store(&self, id: StoreId) -> Option<Store> {
        self.meta.get_store(id).map(|s| self.adjust_store(s))
    }

    pub fn region_stores(&self, region: &Region) -> Vec<Store> {
        region
            .peers
            .iter()
            .filter_map(|p| self.get_store(p.store_id))
            .collect()
    }

    fn adjust_store(&self, mut store: Store) -> Store {
        let Some((start, end)) = self.key_range() else {
            return store;
        };
        let in_range = |r: &Region| r.in_key_range(start, end);
        let regions = self.meta.regions_on_store(store.id);
        store.region_count = regions.iter().filter(|r| in_range(r)).count() as u64;
        store.region_size = regions
            .iter()
            .filter(|r| in_range(r))
            .map(|r| r.approximate_size)
            .sum();
        let leaders = self.meta.leaders_on_store(store.id);
        store.leader_count = leaders.iter().filter(|r| in_range(r)).count() as u64;
        store.leader_size = leaders
            .iter()
            .filter(|r| in_range(r))
            .map(|r| r.approximate_size)
            .sum();
        store
    }

    pub fn pending_counts(&self) -> HashMap<StoreId, u64> {
        self.meta
            .stores()
            .iter()
            .map(|s| (s.id, self.meta.pending_peer_count(s.id)))
            .collect()
    }

    /// Resource score, recomputed over the restricted range when one is set.
    pub fn resource_score(
        &self,
        store: &Store,
        resource: ResourceKind,
        policy: SchedulePolicy,
    ) -> f64 {
        self.adjust_store(store.clone()).resource_score(resource, policy)
    }

    pub fn leader_score(&self, store: &Store) -> f64 {
        self.resource_score(store, ResourceKind::Leader, self.cfg.leader_schedule_policy)
    }

    pub fn region_score(&self, store: &Store) -> f64 {
        self.resource_score(store, ResourceKind::Region, SchedulePolicy::BySize)
    }

    pub fn random_leader_region(&self, store_id: StoreId, rng: &mut impl Rng) -> Option<Region> {
        self.meta
            .random_leader_region(store_id, self.key_range(), false, rng)
    }

    pub fn random_healthy_leader_region(
        &self,
        store_id: StoreId,
        rng: &mut impl Rng,
    ) -> Option<Region> {
        self.meta
            .random_leader_region(store_id, self.key_range(), true, rng)
    }

    pub fn random_follower_region(&self, store_id: StoreId, rng: &mut impl Rng) -> Option<Region> {
        self.meta
            .random_follower_region(store_id, self.key_range(), false, rng)
    }

    /// One region's worth of influence on the balance score.
    fn region_influence(&self, region: &Region, policy: SchedulePolicy) -> f64 {
        match policy {
            SchedulePolicy::ByCount => 1.0,
            SchedulePolicy::BySize => (region.approximate_size as f64).max(1.0),
        }
    }

    /// A move is only worth it when the score gap exceeds the influence of
    /// the region being moved, scaled by the tolerance ratio. Skipping when
    /// the gap is within tolerance is what lets the cluster converge instead
    /// of thrashing.
    pub fn should_balance(
        &self,
        source_score: f64,
        target_score: f64,
        region: &Region,
        policy: SchedulePolicy,
    ) -> bool {
        source_score - target_score > self.region_influence(region, policy) * self.tolerant_size_ratio()
    }
}
