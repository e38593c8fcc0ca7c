//! In-memory authoritative view of stores and regions.
//!
//! The map is fed exclusively by heartbeats and is rebuilt from them after a
//! restart. Writes go through one writer lock; readers clone snapshots and
//! must tolerate staleness. A stale heartbeat (older epoch) never overwrites
//! newer state.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SchedulePolicy;
use crate::error::{Error, Result};

pub type StoreId = u64;
pub type RegionId = u64;
pub type PeerId = u64;

/// What a balance pass is moving around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Leader,
    Region,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    Up,
    Offline,
    Tombstone,
}

/// Capacity and snapshot counters reported by the unary store heartbeat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,
    pub sending_snap_count: u64,
    pub receiving_snap_count: u64,
    pub applying_snap_count: u64,
    pub is_busy: bool,
}

impl StoreStats {
    pub fn snapshot_count(&self) -> u64 {
        self.sending_snap_count + self.receiving_snap_count + self.applying_snap_count
    }
}

/// A storage node. Leader/region counters are derived from the region map and
/// maintained by [`MetaStore`]; callers should treat them as read-only.
#[derive(Clone, Debug)]
pub struct Store {
    pub id: StoreId,
    pub address: String,
    pub labels: BTreeMap<String, String>,
    pub state: StoreState,
    pub stats: StoreStats,
    pub leader_count: u64,
    pub leader_size: u64,
    pub leader_weight: f64,
    pub region_count: u64,
    pub region_size: u64,
    pub region_weight: f64,
    pub last_heartbeat: Option<Instant>,
    pub start_time: Option<Instant>,
}

impl Store {
    pub fn new(id: StoreId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            labels: BTreeMap::new(),
            state: StoreState::Up,
            stats: StoreStats::default(),
            leader_count: 0,
            leader_size: 0,
            leader_weight: 1.0,
            region_count: 0,
            region_size: 0,
            region_weight: 1.0,
            last_heartbeat: Some(Instant::now()),
            start_time: Some(Instant::now()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == StoreState::Up
    }

    pub fn is_offline(&self) -> bool {
        self.state == StoreState::Offline
    }

    pub fn is_tombstone(&self) -> bool {
        self.state == StoreState::Tombstone
    }

    /// Time since the last heartbeat. A store with no heartbeat on record is
    /// down until it reports again.
    pub fn down_time(&self) -> Duration {
        self.last_heartbeat
            .map(|hb| Instant::now().saturating_duration_since(hb))
            .unwrap_or(Duration::MAX)
    }

    /// Fraction of capacity already used; 0 when capacity is unreported.
    pub fn usage_ratio(&self) -> f64 {
        if self.stats.capacity == 0 {
            return 0.0;
        }
        1.0 - (self.stats.available as f64 / self.stats.capacity as f64)
    }

    pub fn is_low_space(&self, low_space_ratio: f64) -> bool {
        self.stats.capacity > 0 && self.usage_ratio() > low_space_ratio
    }

    pub fn resource_score(&self, resource: ResourceKind, policy: SchedulePolicy) -> f64 {
        let (count, size, weight) = match resource {
            ResourceKind::Leader => (self.leader_count, self.leader_size, self.leader_weight),
            ResourceKind::Region => (self.region_count, self.region_size, self.region_weight),
        };
        let raw = match policy {
            SchedulePolicy::ByCount => count as f64,
            SchedulePolicy::BySize => size as f64,
        };
        if weight <= 0.0 {
            f64::INFINITY
        } else {
            raw / weight
        }
    }

    pub fn leader_score(&self, policy: SchedulePolicy) -> f64 {
        self.resource_score(ResourceKind::Leader, policy)
    }

    /// Region score is always size-based; weight scales it.
    pub fn region_score(&self) -> f64 {
        self.resource_score(ResourceKind::Region, SchedulePolicy::BySize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Voter,
    Learner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub store_id: StoreId,
    pub role: PeerRole,
}

impl Peer {
    pub fn voter(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    pub fn learner(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }

    pub fn is_learner(&self) -> bool {
        self.role == PeerRole::Learner
    }
}

/// Conf-change/split version pair. A report is stale only when it is behind
/// in the product order: both components at or below the known epoch, at
/// least one strictly below. A report ahead in either component is news.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

impl RegionEpoch {
    pub fn new(conf_ver: u64, version: u64) -> Self {
        Self { conf_ver, version }
    }

    pub fn is_older_than(&self, other: &RegionEpoch) -> bool {
        self.version <= other.version
            && self.conf_ver <= other.conf_ver
            && (self.version < other.version || self.conf_ver < other.conf_ver)
    }
}

/// A peer reported unreachable, with how long it has been down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDownStats {
    pub peer: Peer,
    pub down_seconds: u64,
}

/// One contiguous key range replicated as a consensus group.
/// `end_key` empty means unbounded.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
    pub leader: Option<Peer>,
    pub down_peers: Vec<PeerDownStats>,
    pub pending_peers: Vec<Peer>,
    /// MiB, as estimated by the leader store.
    pub approximate_size: u64,
    pub approximate_keys: u64,
    pub written_bytes: u64,
    pub written_keys: u64,
    pub read_bytes: u64,
    pub read_keys: u64,
}

impl Region {
    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| !p.is_learner())
    }

    pub fn learners(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.is_learner())
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    pub fn learner_count(&self) -> usize {
        self.learners().count()
    }

    pub fn store_peer(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    pub fn store_ids(&self) -> BTreeSet<StoreId> {
        self.peers.iter().map(|p| p.store_id).collect()
    }

    pub fn leader_store_id(&self) -> Option<StoreId> {
        self.leader.as_ref().map(|p| p.store_id)
    }

    pub fn follower_peers(&self) -> Vec<Peer> {
        let leader_store = self.leader_store_id();
        self.voters()
            .filter(|p| Some(p.store_id) != leader_store)
            .copied()
            .collect()
    }

    pub fn pending_peer_on(&self, store_id: StoreId) -> bool {
        self.pending_peers.iter().any(|p| p.store_id == store_id)
    }

    pub fn down_peer_on(&self, store_id: StoreId) -> bool {
        self.down_peers.iter().any(|d| d.peer.store_id == store_id)
    }

    /// No down or pending peers; safe input for balance decisions.
    pub fn is_healthy(&self) -> bool {
        self.down_peers.is_empty() && self.pending_peers.is_empty()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        let this_before = !self.end_key.is_empty() && self.end_key.as_slice() <= start;
        let other_before = !end.is_empty() && end <= self.start_key.as_slice();
        !(this_before || other_before)
    }

    /// True when the region's range intersects `[start, end)`.
    pub fn in_key_range(&self, start: &[u8], end: &[u8]) -> bool {
        self.overlaps(start, end)
    }
}

#[derive(Default)]
struct MetaCore {
    stores: BTreeMap<StoreId, Store>,
    regions: BTreeMap<RegionId, Region>,
    /// start_key -> region id; the keyspace partition.
    range_index: BTreeMap<Vec<u8>, RegionId>,
    store_regions: BTreeMap<StoreId, BTreeSet<RegionId>>,
    store_leaders: BTreeMap<StoreId, BTreeSet<RegionId>>,
}

impl MetaCore {
    fn unlink_region(&mut self, region: &Region) {
        self.range_index.remove(&region.start_key);
        for peer in &region.peers {
            if let Some(set) = self.store_regions.get_mut(&peer.store_id) {
                set.remove(&region.id);
            }
        }
        if let Some(leader_store) = region.leader_store_id() {
            if let Some(set) = self.store_leaders.get_mut(&leader_store) {
                set.remove(&region.id);
            }
        }
    }

    fn link_region(&mut self, region: &Region) {
        self.range_index.insert(region.start_key.clone(), region.id);
        for peer in &region.peers {
            self.store_regions
                .entry(peer.store_id)
                .or_default()
                .insert(region.id);
        }
        if let Some(leader_store) = region.leader_store_id() {
            self.store_leaders
                .entry(leader_store)
                .or_default()
                .insert(region.id);
        }
    }

    fn refresh_store_counters(&mut self, store_id: StoreId) {
        let (region_count, region_size) = self
            .store_regions
            .get(&store_id)
            .map(|set| {
                let size = set
                    .iter()
                    .filter_map(|id| self.regions.get(id))
                    .map(|r| r.approximate_size)
                    .sum();
                (set.len() as u64, size)
            })
            .unwrap_or((0, 0));
        let (leader_count, leader_size) = self
            .store_leaders
            .get(&store_id)
            .map(|set| {
                let size = set
                    .iter()
                    .filter_map(|id| self.regions.get(id))
                    .map(|r| r.approximate_size)
                    .sum();
                (set.len() as u64, size)
            })
            .unwrap_or((0, 0));
        if let Some(store) = self.stores.get_mut(&store_id) {
            store.region_count = region_count;
            store.region_size = region_size;
            store.leader_count = leader_count;
            store.leader_size = leader_size;
        }
    }

    /// Region ids whose ranges intersect `[start, end)`.
    fn overlapping_region_ids(&self, start: &[u8], end: &[u8]) -> Vec<RegionId> {
        let mut out = Vec::new();
        // The region starting at or before `start` may straddle it.
        if let Some((_, &rid)) = self
            .range_index
            .range::<[u8], _>((Unbounded, Included(start)))
            .next_back()
        {
            if let Some(region) = self.regions.get(&rid) {
                if region.overlaps(start, end) {
                    out.push(rid);
                }
            }
        }
        for (key, &rid) in self.range_index.range::<[u8], _>((Excluded(start), Unbounded)) {
            if !end.is_empty() && key.as_slice() >= end {
                break;
            }
            if let Some(region) = self.regions.get(&rid) {
                if region.overlaps(start, end) {
                    out.push(rid);
                }
            }
        }
        out
    }
}

/// The authoritative metadata map plus a monotonic peer-id allocator.
pub struct MetaStore {
    core: RwLock<MetaCore>,
    next_peer_id: AtomicU64,
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore {
    pub fn new() -> Self {
        Self {
            core: RwLock::new(MetaCore::default()),
            next_peer_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_peer_id(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn put_store(&self, store: Store) -> Result<()> {
        let mut core = self.core.write().unwrap();
        if let Some(existing) = core.stores.get(&store.id) {
            if existing.is_tombstone() {
                return Err(Error::StoreTombstoned(store.id));
            }
        }
        let id = store.id;
        core.stores.insert(id, store);
        core.refresh_store_counters(id);
        Ok(())
    }

    pub fn get_store(&self, id: StoreId) -> Option<Store> {
        self.core.read().unwrap().stores.get(&id).cloned()
    }

    pub fn stores(&self) -> Vec<Store> {
        self.core.read().unwrap().stores.values().cloned().collect()
    }

    pub fn up_stores(&self) -> Vec<Store> {
        self.core
            .read()
            .unwrap()
            .stores
            .values()
            .filter(|s| s.is_up())
            .cloned()
            .collect()
    }

    pub fn update_store_stats(&self, id: StoreId, stats: StoreStats) -> Result<()> {
        let mut core = self.core.write().unwrap();
        let store = core.stores.get_mut(&id).ok_or(Error::StoreNotFound(id))?;
        if store.is_tombstone() {
            return Err(Error::StoreTombstoned(id));
        }
        store.stats = stats;
        store.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    pub fn set_store_labels(&self, id: StoreId, labels: BTreeMap<String, String>) -> Result<()> {
        let mut core = self.core.write().unwrap();
        let store = core.stores.get_mut(&id).ok_or(Error::StoreNotFound(id))?;
        if store.is_tombstone() {
            return Err(Error::StoreTombstoned(id));
        }
        store.labels.extend(labels);
        Ok(())
    }

    pub fn set_store_weight(&self, id: StoreId, leader: f64, region: f64) -> Result<()> {
        if leader < 0.0 || region < 0.0 {
            return Err(Error::InvalidInput("weights must be non-negative".into()));
        }
        let mut core = self.core.write().unwrap();
        let store = core.stores.get_mut(&id).ok_or(Error::StoreNotFound(id))?;
        store.leader_weight = leader;
        store.region_weight = region;
        Ok(())
    }

    /// Up -> Offline; the store keeps hosting peers while they drain.
    pub fn remove_store(&self, id: StoreId) -> Result<()> {
        let mut core = self.core.write().unwrap();
        let store = core.stores.get_mut(&id).ok_or(Error::StoreNotFound(id))?;
        match store.state {
            StoreState::Tombstone => Err(Error::StoreTombstoned(id)),
            _ => {
                store.state = StoreState::Offline;
                Ok(())
            }
        }
    }

    /// Offline -> Tombstone. Refused while regions remain unless forced.
    pub fn bury_store(&self, id: StoreId, force: bool) -> Result<()> {
        let mut core = self.core.write().unwrap();
        let remaining = core
            .store_regions
            .get(&id)
            .map(|set| set.len())
            .unwrap_or(0);
        let store = core.stores.get_mut(&id).ok_or(Error::StoreNotFound(id))?;
        if store.is_up() {
            return Err(Error::InvalidInput(format!(
                "store {id} is still up; take it offline first"
            )));
        }
        if remaining > 0 && !force {
            return Err(Error::InvalidInput(format!(
                "store {id} still hosts {remaining} regions"
            )));
        }
        store.state = StoreState::Tombstone;
        Ok(())
    }

    pub fn up_store(&self, id: StoreId) -> Result<()> {
        let mut core = self.core.write().unwrap();
        let store = core.stores.get_mut(&id).ok_or(Error::StoreNotFound(id))?;
        match store.state {
            StoreState::Tombstone => Err(Error::StoreTombstoned(id)),
            _ => {
                store.state = StoreState::Up;
                store.last_heartbeat = Some(Instant::now());
                Ok(())
            }
        }
    }

    /// Ingest a region record. Rejects stale epochs; evicts regions the new
    /// range overlaps (their next heartbeat re-registers them, which is how
    /// splits and merges settle). Returns the ids of evicted regions.
    pub fn put_region(&self, region: Region) -> Result<Vec<RegionId>> {
        if region.peers.is_empty() {
            return Err(Error::RegionAbnormalPeer(region.id));
        }
        let distinct: BTreeSet<StoreId> = region.peers.iter().map(|p| p.store_id).collect();
        if distinct.len() != region.peers.len() {
            return Err(Error::RegionAbnormalPeer(region.id));
        }
        if let Some(leader) = &region.leader {
            if region.store_peer(leader.store_id).map(|p| p.id) != Some(leader.id) {
                return Err(Error::RegionAbnormalPeer(region.id));
            }
        }

        let mut core = self.core.write().unwrap();
        if let Some(existing) = core.regions.get(&region.id) {
            if region.epoch.is_older_than(&existing.epoch) {
                return Err(Error::StaleRegion {
                    region_id: region.id,
                    reported_conf_ver: region.epoch.conf_ver,
                    reported_version: region.epoch.version,
                });
            }
        }

        let mut touched: BTreeSet<StoreId> = region.peers.iter().map(|p| p.store_id).collect();
        let mut evicted = Vec::new();
        for rid in core.overlapping_region_ids(&region.start_key, &region.end_key) {
            if rid == region.id {
                continue;
            }
            if let Some(old) = core.regions.remove(&rid) {
                core.unlink_region(&old);
                touched.extend(old.peers.iter().map(|p| p.store_id));
                evicted.push(rid);
            }
        }
        if let Some(old) = core.regions.remove(&region.id) {
            core.unlink_region(&old);
            touched.extend(old.peers.iter().map(|p| p.store_id));
        }

        let max_peer = region.peers.iter().map(|p| p.id).max().unwrap_or(0);
        self.next_peer_id.fetch_max(max_peer + 1, Ordering::Relaxed);

        core.link_region(&region);
        core.regions.insert(region.id, region);
        for store_id in touched {
            core.refresh_store_counters(store_id);
        }
        Ok(evicted)
    }

    pub fn remove_region(&self, id: RegionId) -> Option<Region> {
        let mut core = self.core.write().unwrap();
        let region = core.regions.remove(&id)?;
        core.unlink_region(&region);
        for peer in &region.peers {
            core.refresh_store_counters(peer.store_id);
        }
        Some(region)
    }

    pub fn get_region(&self, id: RegionId) -> Option<Region> {
        self.core.read().unwrap().regions.get(&id).cloned()
    }

    pub fn get_region_by_key(&self, key: &[u8]) -> Option<Region> {
        let core = self.core.read().unwrap();
        let (_, &rid) = core
            .range_index
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()?;
        core.regions
            .get(&rid)
            .filter(|r| r.contains_key(key))
            .cloned()
    }

    /// Regions in key order starting at `start_key`, up to `limit`.
    pub fn scan_regions(&self, start_key: &[u8], limit: usize) -> Vec<Region> {
        let core = self.core.read().unwrap();
        core.range_index
            .range::<[u8], _>((Included(start_key), Unbounded))
            .take(limit)
            .filter_map(|(_, rid)| core.regions.get(rid).cloned())
            .collect()
    }

    pub fn region_count(&self) -> usize {
        self.core.read().unwrap().regions.len()
    }

    pub fn regions_on_store(&self, store_id: StoreId) -> Vec<Region> {
        let core = self.core.read().unwrap();
        core.store_regions
            .get(&store_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| core.regions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn leaders_on_store(&self, store_id: StoreId) -> Vec<Region> {
        let core = self.core.read().unwrap();
        core.store_leaders
            .get(&store_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| core.regions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_peer_count(&self, store_id: StoreId) -> u64 {
        self.regions_on_store(store_id)
            .iter()
            .filter(|r| r.pending_peer_on(store_id))
            .count() as u64
    }

    pub fn total_pending_peers(&self) -> u64 {
        let core = self.core.read().unwrap();
        core.regions
            .values()
            .map(|r| r.pending_peers.len() as u64)
            .sum()
    }

    pub fn total_snapshots(&self) -> u64 {
        let core = self.core.read().unwrap();
        core.stores.values().map(|s| s.stats.snapshot_count()).sum()
    }

    /// The regions immediately before and after `region` in key order, when
    /// their boundaries actually touch.
    pub fn adjacent_regions(&self, region: &Region) -> (Option<Region>, Option<Region>) {
        let core = self.core.read().unwrap();
        let prev = core
            .range_index
            .range::<[u8], _>((Unbounded, Excluded(region.start_key.as_slice())))
            .next_back()
            .and_then(|(_, rid)| core.regions.get(rid))
            .filter(|r| !r.end_key.is_empty() && r.end_key == region.start_key)
            .cloned();
        let next = if region.end_key.is_empty() {
            None
        } else {
            core.range_index
                .range::<[u8], _>((Included(region.end_key.as_slice()), Unbounded))
                .next()
                .and_then(|(_, rid)| core.regions.get(rid))
                .filter(|r| r.start_key == region.end_key)
                .cloned()
        };
        (prev, next)
    }

    fn random_pick(
        mut candidates: Vec<Region>,
        range: Option<(&[u8], &[u8])>,
        healthy_only: bool,
        rng: &mut impl Rng,
    ) -> Option<Region> {
        candidates.retain(|r| {
            if healthy_only && !r.is_healthy() {
                return false;
            }
            match range {
                Some((start, end)) => r.in_key_range(start, end),
                None => true,
            }
        });
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|r| r.id);
        let idx = rng.gen_range(0..candidates.len());
        Some(candidates.swap_remove(idx))
    }

    pub fn random_leader_region(
        &self,
        store_id: StoreId,
        range: Option<(&[u8], &[u8])>,
        healthy_only: bool,
        rng: &mut impl Rng,
    ) -> Option<Region> {
        Self::random_pick(self.leaders_on_store(store_id), range, healthy_only, rng)
    }

    /// A random region with a non-leader peer on `store_id`.
    pub fn random_follower_region(
        &self,
        store_id: StoreId,
        range: Option<(&[u8], &[u8])>,
        healthy_only: bool,
        rng: &mut impl Rng,
    ) -> Option<Region> {
        let followers = self
            .regions_on_store(store_id)
            .into_iter()
            .filter(|r| r.leader_store_id() != Some(store_id))
            .collect();
        Self::random_pick(followers, range, healthy_only, rng)
    }
}
