//! Store predicates and candidate selection.
//!
//! Filters are AND-chained keep-predicates: a store survives the chain only
//! if every filter keeps it, on the relevant side (source = a store we move
//! work off, target = a store we move work onto).

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{
    ScheduleConfig, SchedulePolicy, REJECT_LEADER_PROPERTY, SPECIAL_USE_HOT_REGION,
    SPECIAL_USE_LABEL,
};
use crate::limiter::{StoreLimitKind, StoreLimiter};
use crate::metadata::{ResourceKind, Store, StoreId};

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Keep `store` as a candidate source.
    fn filter_source(&self, _cfg: &ScheduleConfig, _store: &Store) -> bool {
        true
    }

    /// Keep `store` as a candidate target.
    fn filter_target(&self, _cfg: &ScheduleConfig, _store: &Store) -> bool {
        true
    }
}

pub fn filter_sources(cfg: &ScheduleConfig, stores: &[Store], filters: &[Box<dyn Filter>]) -> Vec<Store> {
    stores
        .iter()
        .filter(|s| filters.iter().all(|f| f.filter_source(cfg, s)))
        .cloned()
        .collect()
}

pub fn filter_targets(cfg: &ScheduleConfig, stores: &[Store], filters: &[Box<dyn Filter>]) -> Vec<Store> {
    stores
        .iter()
        .filter(|s| filters.iter().all(|f| f.filter_target(cfg, s)))
        .cloned()
        .collect()
}

/// Excludes an explicit store set (typically the region's current stores).
pub struct ExcludedFilter {
    sources: BTreeSet<StoreId>,
    targets: BTreeSet<StoreId>,
}

impl ExcludedFilter {
    pub fn new(sources: BTreeSet<StoreId>, targets: BTreeSet<StoreId>) -> Self {
        Self { sources, targets }
    }

    pub fn targets(targets: BTreeSet<StoreId>) -> Self {
        Self::new(BTreeSet::new(), targets)
    }
}

impl Filter for ExcludedFilter {
    fn name(&self) -> &'static str {
        "excluded"
    }

    fn filter_source(&self, _cfg: &ScheduleConfig, store: &Store) -> bool {
        !self.sources.contains(&store.id)
    }

    fn filter_target(&self, _cfg: &ScheduleConfig, store: &Store) -> bool {
        !self.targets.contains(&store.id)
    }
}

/// Targets must be Up; Offline and Tombstone stores only ever drain.
pub struct StateFilter;

impl Filter for StateFilter {
    fn name(&self) -> &'static str {
        "state"
    }

    fn filter_source(&self, _cfg: &ScheduleConfig, store: &Store) -> bool {
        !store.is_tombstone()
    }

    fn filter_target(&self, _cfg: &ScheduleConfig, store: &Store) -> bool {
        store.is_up()
    }
}

/// Rejects stores with a heartbeat gap or a busy flag.
pub struct HealthFilter;

impl Filter for HealthFilter {
    fn name(&self) -> &'static str {
        "health"
    }

    fn filter_source(&self, cfg: &ScheduleConfig, store: &Store) -> bool {
        store.down_time() < cfg.max_store_down_time
    }

    fn filter_target(&self, cfg: &ScheduleConfig, store: &Store) -> bool {
        !store.stats.is_busy && store.down_time() < cfg.max_store_down_time
    }
}

pub struct SnapshotCountFilter;

impl Filter for SnapshotCountFilter {
    fn name(&self) -> &'static str {
        "snapshot-count"
    }

    fn filter_source(&self, cfg: &ScheduleConfig, store: &Store) -> bool {
        store.stats.snapshot_count() < cfg.max_snapshot_count
    }

    fn filter_target(&self, cfg: &ScheduleConfig, store: &Store) -> bool {
        store.stats.snapshot_count() < cfg.max_snapshot_count
    }
}

/// Pending-peer counts are supplied at construction since the filter only
/// sees the store record.
pub struct PendingPeerCountFilter {
    counts: std::collections::HashMap<StoreId, u64>,
}

impl PendingPeerCountFilter {
    pub fn new(counts: std::collections::HashMap<StoreId, u64>) -> Self {
        Self { counts }
    }
}

impl Filter for PendingPeerCountFilter {
    fn name(&self) -> &'static str {
        "pending-peer-count"
    }

    fn filter_target(&self, cfg: &ScheduleConfig, store: &Store) -> bool {
        self.counts.get(&store.id).copied().unwrap_or(0) < cfg.max_pending_peer_count
    }
}

/// Targets must have room below the low-space watermark.
pub struct StorageThresholdFilter;

impl Filter for StorageThresholdFilter {
    fn name(&self) -> &'static str {
        "storage-threshold"
    }

    fn filter_target(&self, cfg: &ScheduleConfig, store: &Store) -> bool {
        !store.is_low_space(cfg.low_space_ratio)
    }
}

/// Target admission requires a token in the store's bucket for `kind`.
pub struct StoreLimitFilter {
    limiter: Arc<StoreLimiter>,
    kind: StoreLimitKind,
}

impl StoreLimitFilter {
    pub fn new(limiter: Arc<StoreLimiter>, kind: StoreLimitKind) -> Self {
        Self { limiter, kind }
    }
}

impl Filter for StoreLimitFilter {
    fn name(&self) -> &'static str {
        "store-limit"
    }

    fn filter_target(&self, _cfg: &ScheduleConfig, store: &Store) -> bool {
        self.limiter.available(store.id, self.kind)
    }
}

/// Stores labeled for special use never receive generic traffic. Hot-region
/// scheduling may opt in to `specialUse=hotRegion` stores.
pub struct SpecialUseFilter {
    allow_hot_region: bool,
}

impl SpecialUseFilter {
    pub fn new() -> Self {
        Self {
            allow_hot_region: false,
        }
    }

    pub fn allowing_hot_region() -> Self {
        Self {
            allow_hot_region: true,
        }
    }
}

impl Default for SpecialUseFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for SpecialUseFilter {
    fn name(&self) -> &'static str {
        "special-use"
    }

    fn filter_target(&self, _cfg: &ScheduleConfig, store: &Store) -> bool {
        match store.labels.get(SPECIAL_USE_LABEL).map(String::as_str) {
            None => true,
            Some(SPECIAL_USE_HOT_REGION) => self.allow_hot_region,
            Some(_) => false,
        }
    }
}

/// Keeps leaders off stores carrying the reject-leader label property.
pub struct RejectLeaderFilter;

impl Filter for RejectLeaderFilter {
    fn name(&self) -> &'static str {
        "reject-leader"
    }

    fn filter_target(&self, cfg: &ScheduleConfig, store: &Store) -> bool {
        !cfg.store_has_property(REJECT_LEADER_PROPERTY, &store.labels)
    }
}

/// The location-safety predicate: a candidate must keep the replica spread at
/// least as distinct as the peer it replaces.
pub struct DistinctScoreFilter {
    labels: Vec<String>,
    region_stores: Vec<Store>,
    safe_score: f64,
}

impl DistinctScoreFilter {
    /// `region_stores` are the region's stores minus the one being replaced.
    pub fn new(labels: Vec<String>, region_stores: Vec<Store>, old_store: &Store) -> Self {
        let safe_score = distinct_score(&labels, &region_stores, old_store);
        Self {
            labels,
            region_stores,
            safe_score,
        }
    }
}

impl Filter for DistinctScoreFilter {
    fn name(&self) -> &'static str {
        "distinct-score"
    }

    fn filter_target(&self, _cfg: &ScheduleConfig, store: &Store) -> bool {
        distinct_score(&self.labels, &self.region_stores, store) >= self.safe_score
    }
}

/// Label-depth-weighted spread of `candidate` against the region's stores.
/// Differing at a higher label level (earlier in `labels`) contributes an
/// exponentially larger share; identical locations contribute nothing.
pub fn distinct_score(labels: &[String], stores: &[Store], candidate: &Store) -> f64 {
    let mut score = 0.0;
    for store in stores {
        if store.id == candidate.id {
            continue;
        }
        let first_diff = labels
            .iter()
            .position(|label| store.labels.get(label) != candidate.labels.get(label));
        if let Some(idx) = first_diff {
            score += 2f64.powi((labels.len() - idx - 1) as i32);
        }
    }
    score
}

/// Orders two candidates: higher score wins, then fewer regions, then lower
/// store id. `Greater` means `a` is the better candidate.
pub fn compare_store_score(a: &Store, score_a: f64, b: &Store, score_b: f64) -> Ordering {
    score_a
        .partial_cmp(&score_b)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.region_count.cmp(&a.region_count))
        .then_with(|| b.id.cmp(&a.id))
}

#[derive(Clone, Copy, Debug)]
pub struct ScheduleKind {
    pub resource: ResourceKind,
    pub policy: SchedulePolicy,
}

/// Picks balance endpoints by resource score extremum.
pub struct BalanceSelector {
    kind: ScheduleKind,
    filters: Vec<Box<dyn Filter>>,
}

impl BalanceSelector {
    pub fn new(kind: ScheduleKind, filters: Vec<Box<dyn Filter>>) -> Self {
        Self { kind, filters }
    }

    /// The most loaded store that passes the source side of the chain.
    pub fn select_source(&self, cfg: &ScheduleConfig, stores: &[Store]) -> Option<Store> {
        filter_sources(cfg, stores, &self.filters)
            .into_iter()
            .max_by(|a, b| {
                let score_a = a.resource_score(self.kind.resource, self.kind.policy);
                let score_b = b.resource_score(self.kind.resource, self.kind.policy);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            })
    }

    /// The least loaded store that passes the target side of the chain.
    pub fn select_target(&self, cfg: &ScheduleConfig, stores: &[Store]) -> Option<Store> {
        filter_targets(cfg, stores, &self.filters)
            .into_iter()
            .min_by(|a, b| {
                let score_a = a.resource_score(self.kind.resource, self.kind.policy);
                let score_b = b.resource_score(self.kind.resource, self.kind.policy);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
    }
}

/// Picks replica placement by distinct score against the region's stores.
pub struct ReplicaSelector {
    region_stores: Vec<Store>,
    labels: Vec<String>,
    filters: Vec<Box<dyn Filter>>,
}

impl ReplicaSelector {
    pub fn new(region_stores: Vec<Store>, labels: Vec<String>, filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            region_stores,
            labels,
            filters,
        }
    }

    /// The best store to place a new replica on.
    pub fn select_target(&self, cfg: &ScheduleConfig, candidates: &[Store]) -> Option<Store> {
        filter_targets(cfg, candidates, &self.filters)
            .into_iter()
            .max_by(|a, b| {
                let score_a = distinct_score(&self.labels, &self.region_stores, a);
                let score_b = distinct_score(&self.labels, &self.region_stores, b);
                compare_store_score(a, score_a, b, score_b)
            })
    }

    /// The worst-placed existing store (lowest distinct score).
    pub fn select_source(&self, cfg: &ScheduleConfig, candidates: &[Store]) -> Option<Store> {
        filter_sources(cfg, candidates, &self.filters)
            .into_iter()
            .min_by(|a, b| {
                let score_a = distinct_score(&self.labels, &self.region_stores, a);
                let score_b = distinct_score(&self.labels, &self.region_stores, b);
                compare_store_score(a, score_a, b, score_b)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::StoreStats;

    fn store_with_counts(
        id: StoreId,
        region_count: u64,
        region_size: u64,
        leader_count: u64,
        leader_size: u64,
    ) -> Store {
        let mut store = Store::new(id, format!("s{id}"));
        store.region_count = region_count;
        store.region_size = region_size;
        store.leader_count = leader_count;
        store.leader_size = leader_size;
        store
    }

    fn labeled_store(id: StoreId, pairs: &[(&str, &str)]) -> Store {
        let mut store = Store::new(id, format!("s{id}"));
        for (k, v) in pairs {
            store.labels.insert(k.to_string(), v.to_string());
        }
        store
    }

    #[test]
    fn candidate_comparison_prefers_score_then_emptier_then_lower_id() {
        let store1 = store_with_counts(1, 1, 1, 0, 0);
        let store2 = store_with_counts(2, 1, 1, 0, 0);
        let store3 = store_with_counts(3, 3, 3, 0, 0);

        assert_eq!(compare_store_score(&store1, 2.0, &store2, 1.0), Ordering::Greater);
        assert_eq!(compare_store_score(&store1, 1.0, &store2, 2.0), Ordering::Less);
        // Equal score: the store with fewer regions wins.
        assert_eq!(compare_store_score(&store1, 1.0, &store3, 1.0), Ordering::Greater);
        // Equal score and count: the lower id wins, regardless of size.
        let bulky = store_with_counts(5, 1, 100, 0, 0);
        assert_eq!(compare_store_score(&store1, 1.0, &bulky, 1.0), Ordering::Greater);
        assert_eq!(compare_store_score(&store1, 1.0, &store2, 1.0), Ordering::Greater);
    }

    #[test]
    fn balance_selector_honors_count_and_size_policies() {
        let stores = vec![
            store_with_counts(1, 10, 10, 5, 10),
            store_with_counts(2, 4, 4, 5, 66),
            store_with_counts(3, 4, 4, 5, 6),
            store_with_counts(4, 2, 2, 5, 20),
        ];

        for policy in [SchedulePolicy::ByCount, SchedulePolicy::BySize] {
            let selector = BalanceSelector::new(
                ScheduleKind {
                    resource: ResourceKind::Region,
                    policy,
                },
                Vec::new(),
            );
            let cfg = ScheduleConfig::default();
            assert_eq!(selector.select_source(&cfg, &stores).unwrap().id, 1);
            assert_eq!(selector.select_target(&cfg, &stores).unwrap().id, 4);
        }

        let stores = vec![
            store_with_counts(1, 10, 10, 20, 25),
            store_with_counts(2, 10, 10, 66, 5),
            store_with_counts(3, 10, 10, 6, 5),
            store_with_counts(4, 10, 10, 20, 1),
        ];
        let selector = BalanceSelector::new(
            ScheduleKind {
                resource: ResourceKind::Leader,
                policy: SchedulePolicy::ByCount,
            },
            Vec::new(),
        );
        let cfg = ScheduleConfig::default();
        assert_eq!(selector.select_source(&cfg, &stores).unwrap().id, 2);
        assert_eq!(selector.select_target(&cfg, &stores).unwrap().id, 3);

        let selector = BalanceSelector::new(
            ScheduleKind {
                resource: ResourceKind::Leader,
                policy: SchedulePolicy::BySize,
            },
            Vec::new(),
        );
        assert_eq!(selector.select_source(&cfg, &stores).unwrap().id, 1);
        assert_eq!(selector.select_target(&cfg, &stores).unwrap().id, 4);
    }

    #[test]
    fn distinct_score_weights_higher_label_levels() {
        let labels = vec!["zone".to_string(), "host".to_string()];
        let region_stores = vec![
            labeled_store(1, &[("zone", "z1"), ("host", "h1")]),
            labeled_store(2, &[("zone", "z2"), ("host", "h2")]),
        ];
        // New zone: differs at level 0 with both stores.
        let fresh_zone = labeled_store(4, &[("zone", "z3"), ("host", "h4")]);
        assert_eq!(distinct_score(&labels, &region_stores, &fresh_zone), 4.0);
        // Same zone as store 1, different host: 1 + 2.
        let same_zone = labeled_store(4, &[("zone", "z1"), ("host", "h4")]);
        assert_eq!(distinct_score(&labels, &region_stores, &same_zone), 3.0);
        // Identical location to store 1 contributes nothing for that pair.
        let same_host = labeled_store(4, &[("zone", "z1"), ("host", "h1")]);
        assert_eq!(distinct_score(&labels, &region_stores, &same_host), 2.0);
    }

    #[test]
    fn special_use_stores_only_admit_hot_region_traffic() {
        let cfg = ScheduleConfig::default();
        let reserved = labeled_store(5, &[(SPECIAL_USE_LABEL, "reserved")]);
        let hot = labeled_store(4, &[(SPECIAL_USE_LABEL, SPECIAL_USE_HOT_REGION)]);
        let plain = labeled_store(1, &[]);

        let generic = SpecialUseFilter::new();
        assert!(!generic.filter_target(&cfg, &reserved));
        assert!(!generic.filter_target(&cfg, &hot));
        assert!(generic.filter_target(&cfg, &plain));

        let hot_pass = SpecialUseFilter::allowing_hot_region();
        assert!(!hot_pass.filter_target(&cfg, &reserved));
        assert!(hot_pass.filter_target(&cfg, &hot));
    }

    #[test]
    fn storage_threshold_rejects_nearly_full_stores() {
        let cfg = ScheduleConfig::default();
        let mut store = Store::new(1, "s1");
        store.stats = StoreStats {
            capacity: 100,
            available: 10,
            used_size: 90,
            ..Default::default()
        };
        assert!(!StorageThresholdFilter.filter_target(&cfg, &store));
        store.stats.available = 50;
        assert!(StorageThresholdFilter.filter_target(&cfg, &store));
    }

    #[test]
    fn replica_selector_finds_most_distinct_target() {
        let cfg = ScheduleConfig::default();
        let labels = vec!["zone".to_string()];
        let region_stores = vec![
            labeled_store(1, &[("zone", "z1")]),
            labeled_store(2, &[("zone", "z2")]),
        ];
        let candidates = vec![
            labeled_store(3, &[("zone", "z1")]),
            labeled_store(4, &[("zone", "z3")]),
        ];
        let selector = ReplicaSelector::new(region_stores, labels, Vec::new());
        assert_eq!(selector.select_target(&cfg, &candidates).unwrap().id, 4);
    }
}
