//! Flow statistics and scheduling event counters.
//!
//! Region byte/key rates are decayed estimates fed by heartbeat deltas. A
//! region must stay above the hot threshold for several consecutive reports
//! before the hot-region scheduler is allowed to act on it, which keeps
//! one-off bursts from triggering moves.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::heartbeat::RegionHeartbeat;
use crate::metadata::{RegionId, StoreId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Read,
    Write,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Read => "read",
            FlowKind::Write => "write",
        }
    }
}

#[derive(Clone, Debug)]
struct RegionFlow {
    bytes_rate: f64,
    keys_rate: f64,
    /// Leader store at the last report.
    leader_store: StoreId,
    /// Stores carrying this flow: every replica for writes (they all apply
    /// the log), the leader alone for reads.
    stores: Vec<StoreId>,
    hits: u32,
    last_update: Instant,
}

/// Snapshot of one hot region.
#[derive(Clone, Copy, Debug)]
pub struct HotRegion {
    pub region_id: RegionId,
    pub store_id: StoreId,
    pub bytes_rate: f64,
    pub keys_rate: f64,
}

const FLOW_TTL: Duration = Duration::from_secs(5 * 60);

pub struct FlowStats {
    threshold_bytes: u64,
    required_hits: u32,
    flows: RwLock<HashMap<(FlowKind, RegionId), RegionFlow>>,
}

impl FlowStats {
    pub fn new(threshold_bytes: u64, required_hits: u32) -> Self {
        Self {
            threshold_bytes,
            required_hits,
            flows: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, hb: &RegionHeartbeat) {
        let interval = hb.interval_secs.max(1) as f64;
        let mut flows = self.flows.write().unwrap();
        let now = Instant::now();
        flows.retain(|_, flow| now.saturating_duration_since(flow.last_update) < FLOW_TTL);
        for (kind, bytes, keys) in [
            (FlowKind::Write, hb.bytes_written, hb.keys_written),
            (FlowKind::Read, hb.bytes_read, hb.keys_read),
        ] {
            let bytes_rate = bytes as f64 / interval;
            let keys_rate = keys as f64 / interval;
            let stores = match kind {
                FlowKind::Write => hb.peers.iter().map(|p| p.store_id).collect(),
                FlowKind::Read => vec![hb.leader.store_id],
            };
            let entry = flows.entry((kind, hb.region_id)).or_insert(RegionFlow {
                bytes_rate,
                keys_rate,
                leader_store: hb.leader.store_id,
                stores: stores.clone(),
                hits: 0,
                last_update: now,
            });
            // Half-life of one report.
            entry.bytes_rate = (entry.bytes_rate + bytes_rate) / 2.0;
            entry.keys_rate = (entry.keys_rate + keys_rate) / 2.0;
            entry.leader_store = hb.leader.store_id;
            entry.stores = stores;
            entry.last_update = now;
            if entry.bytes_rate >= self.threshold_bytes as f64 {
                entry.hits = entry.hits.saturating_add(1);
            } else {
                entry.hits = 0;
            }
        }
    }

    pub fn is_hot(&self, region_id: RegionId, kind: FlowKind) -> bool {
        self.flows
            .read()
            .unwrap()
            .get(&(kind, region_id))
            .map(|f| f.hits > self.required_hits)
            .unwrap_or(false)
    }

    /// Top-k qualified hot regions, hottest first; ties break on region id.
    pub fn hot_regions(&self, kind: FlowKind, k: usize) -> Vec<HotRegion> {
        let flows = self.flows.read().unwrap();
        let mut hot: Vec<HotRegion> = flows
            .iter()
            .filter(|((flow_kind, _), flow)| *flow_kind == kind && flow.hits > self.required_hits)
            .map(|((_, region_id), flow)| HotRegion {
                region_id: *region_id,
                store_id: flow.leader_store,
                bytes_rate: flow.bytes_rate,
                keys_rate: flow.keys_rate,
            })
            .collect();
        hot.sort_by(|a, b| {
            b.bytes_rate
                .partial_cmp(&a.bytes_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.region_id.cmp(&b.region_id))
        });
        hot.truncate(k);
        hot
    }

    /// Aggregate flow byte rate carried by each store.
    pub fn store_rates(&self, kind: FlowKind) -> HashMap<StoreId, f64> {
        let flows = self.flows.read().unwrap();
        let mut out = HashMap::new();
        for ((flow_kind, _), flow) in flows.iter() {
            if *flow_kind == kind {
                for store_id in &flow.stores {
                    *out.entry(*store_id).or_insert(0.0) += flow.bytes_rate;
                }
            }
        }
        out
    }
}

/// In-process counters keyed by `(name, event)`, mirroring what a metrics
/// pipeline would export. Checkers and schedulers bump these so rejection
/// reasons stay observable without a metrics dependency.
#[derive(Default)]
pub struct EventCounter {
    inner: Mutex<HashMap<(String, String), u64>>,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str, event: &str) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .entry((name.to_string(), event.to_string()))
            .or_insert(0) += 1;
    }

    pub fn get(&self, name: &str, event: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .get(&(name.to_string(), event.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<((String, String), u64)> {
        let mut out: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort();
        out
    }
}
