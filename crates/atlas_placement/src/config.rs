//! Scheduling configuration.
//!
//! One flat struct holds every tunable the checkers, schedulers, and the
//! operator controller consult. Workers receive a cloned snapshot per pass so
//! config changes between passes never tear a single decision.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether balance scores count replicas or weigh their byte sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePolicy {
    ByCount,
    BySize,
}

/// Label property key: leaders are steered away from matching stores.
pub const REJECT_LEADER_PROPERTY: &str = "reject-leader";

/// Store label reserving a store for special use.
pub const SPECIAL_USE_LABEL: &str = "specialUse";
pub const SPECIAL_USE_HOT_REGION: &str = "hotRegion";
pub const SPECIAL_USE_RESERVED: &str = "reserved";

#[derive(Clone, Debug)]
pub struct ScheduleConfig {
    /// Target voter count per region.
    pub max_replicas: usize,
    /// Failure-domain label keys, most significant first (e.g. zone, rack, host).
    pub location_labels: Vec<String>,
    /// A store sending/receiving/applying more snapshots than this is not a
    /// scheduling candidate.
    pub max_snapshot_count: u64,
    pub max_pending_peer_count: u64,
    /// A peer down longer than this is considered lost.
    pub max_store_down_time: Duration,
    /// Storage usage ratio above which a store rejects new replicas.
    pub low_space_ratio: f64,
    /// Score gap, in units of one region's influence, required before a
    /// balance move is worthwhile.
    pub tolerant_size_ratio: f64,

    pub leader_schedule_limit: usize,
    pub region_schedule_limit: usize,
    pub hot_region_schedule_limit: usize,
    pub merge_schedule_limit: usize,
    pub range_schedule_limit: usize,

    pub leader_schedule_policy: SchedulePolicy,
    /// Peer-movement bandwidth assumption (MiB/s) used to budget AddPeer steps.
    pub store_balance_rate: f64,

    /// Regions below both merge thresholds are merge candidates.
    pub max_merge_region_size: u64,
    pub max_merge_region_keys: u64,

    pub patrol_region_interval: Duration,
    /// Regions examined per patrol tick.
    pub patrol_batch: usize,
    pub scheduler_interval: Duration,
    /// Minimum gap between re-sends of the same pending operator step.
    pub operator_resend_interval: Duration,
    /// Operators stuck in the waiting queue longer than this are dropped.
    pub operator_wait_ttl: Duration,
    /// Maximum queued operators waiting for store-limit tokens.
    pub waiting_capacity: usize,
    pub history_retention: Duration,

    /// Byte rate above which a region counts as hot.
    pub hot_region_threshold_bytes: u64,
    /// Consecutive hot reports required before the hot scheduler may act.
    pub hot_cache_hits: u32,

    pub enable_remove_down_replica: bool,
    pub enable_replace_offline_replica: bool,
    pub enable_make_up_replica: bool,
    pub enable_remove_extra_replica: bool,
    pub enable_location_replacement: bool,

    /// Property key -> store label matches (key, value). A store matching any
    /// pair carries the property.
    pub label_properties: BTreeMap<String, Vec<(String, String)>>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_replicas: 3,
            location_labels: Vec::new(),
            max_snapshot_count: 3,
            max_pending_peer_count: 16,
            max_store_down_time: Duration::from_secs(30 * 60),
            low_space_ratio: 0.8,
            tolerant_size_ratio: 2.5,
            leader_schedule_limit: 4,
            region_schedule_limit: 2048,
            hot_region_schedule_limit: 4,
            merge_schedule_limit: 8,
            range_schedule_limit: 4,
            leader_schedule_policy: SchedulePolicy::ByCount,
            store_balance_rate: 15.0,
            max_merge_region_size: 20,
            max_merge_region_keys: 200_000,
            patrol_region_interval: Duration::from_millis(100),
            patrol_batch: 128,
            scheduler_interval: Duration::from_millis(500),
            operator_resend_interval: Duration::from_secs(5),
            operator_wait_ttl: Duration::from_secs(60),
            waiting_capacity: 256,
            history_retention: Duration::from_secs(10 * 60),
            hot_region_threshold_bytes: 1 << 20,
            hot_cache_hits: 3,
            enable_remove_down_replica: true,
            enable_replace_offline_replica: true,
            enable_make_up_replica: true,
            enable_remove_extra_replica: true,
            enable_location_replacement: true,
            label_properties: BTreeMap::new(),
        }
    }
}

impl ScheduleConfig {
    /// True when the store matches any label pair registered under `property`.
    pub fn store_has_property(
        &self,
        property: &str,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        self.label_properties
            .get(property)
            .map(|pairs| {
                pairs
                    .iter()
                    .any(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
            })
            .unwrap_or(false)
    }
}
