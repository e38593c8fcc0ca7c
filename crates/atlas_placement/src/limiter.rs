//! Per-store token buckets bounding how fast stores absorb peer changes.
//!
//! Every admitted add-peer or remove-peer step costs one token from the
//! target store's bucket for that direction. Buckets refill continuously at
//! `rate` tokens/sec up to `rate * burst_seconds`. In auto mode the rates
//! come from a scene table keyed by cluster pressure; a manual per-store
//! override always wins over the scene.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::metadata::StoreId;

pub const DEFAULT_BURST_SECONDS: f64 = 60.0;
/// 15 peer movements per minute, the classic default.
pub const DEFAULT_RATE: f64 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreLimitKind {
    AddPeer,
    RemovePeer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitMode {
    Manual,
    Auto,
}

/// Cluster-wide pressure classification driving auto-mode rates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scene {
    Idle,
    Low,
    Normal,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneRates {
    pub add_rate: f64,
    pub remove_rate: f64,
}

fn default_scenes() -> BTreeMap<Scene, SceneRates> {
    BTreeMap::from([
        (
            Scene::Idle,
            SceneRates {
                add_rate: 1.0,
                remove_rate: 1.0,
            },
        ),
        (
            Scene::Low,
            SceneRates {
                add_rate: 0.5,
                remove_rate: 0.5,
            },
        ),
        (
            Scene::Normal,
            SceneRates {
                add_rate: DEFAULT_RATE,
                remove_rate: DEFAULT_RATE,
            },
        ),
        (
            Scene::High,
            SceneRates {
                add_rate: 0.1,
                remove_rate: 0.1,
            },
        ),
    ])
}

/// Classify cluster pressure from in-flight work totals.
pub fn classify_scene(pending_peers: u64, snapshots: u64) -> Scene {
    match pending_peers + snapshots {
        0 => Scene::Idle,
        1..=8 => Scene::Low,
        9..=32 => Scene::Normal,
        _ => Scene::High,
    }
}

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst_seconds: f64) -> Self {
        let capacity = rate * burst_seconds;
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn set_rate(&mut self, rate: f64, burst_seconds: f64) {
        let now = Instant::now();
        self.refill(now);
        self.rate = rate;
        self.capacity = rate * burst_seconds;
        self.tokens = self.tokens.min(self.capacity);
    }

    fn available(&mut self, n: f64) -> bool {
        self.refill(Instant::now());
        self.tokens >= n
    }

    fn take(&mut self, n: f64) -> bool {
        self.refill(Instant::now());
        if self.tokens < n {
            return false;
        }
        self.tokens -= n;
        true
    }
}

struct StoreLimit {
    add: TokenBucket,
    remove: TokenBucket,
    /// Set when an operator pinned this store's rates; scene changes then
    /// leave it alone.
    manual: bool,
}

impl StoreLimit {
    fn bucket(&mut self, kind: StoreLimitKind) -> &mut TokenBucket {
        match kind {
            StoreLimitKind::AddPeer => &mut self.add,
            StoreLimitKind::RemovePeer => &mut self.remove,
        }
    }
}

pub struct StoreLimiter {
    burst_seconds: f64,
    mode: RwLock<LimitMode>,
    /// Cluster-wide rate applied in manual mode; stores registering later
    /// bootstrap from this, per-store overrides still win.
    manual_rate: RwLock<f64>,
    scenes: RwLock<BTreeMap<Scene, SceneRates>>,
    current_scene: RwLock<Scene>,
    stores: RwLock<HashMap<StoreId, Arc<Mutex<StoreLimit>>>>,
}

impl Default for StoreLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BURST_SECONDS)
    }
}

impl StoreLimiter {
    pub fn new(burst_seconds: f64) -> Self {
        Self {
            burst_seconds,
            mode: RwLock::new(LimitMode::Auto),
            manual_rate: RwLock::new(DEFAULT_RATE),
            scenes: RwLock::new(default_scenes()),
            current_scene: RwLock::new(Scene::Idle),
            stores: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, store_id: StoreId) -> Arc<Mutex<StoreLimit>> {
        if let Some(limit) = self.stores.read().unwrap().get(&store_id) {
            return limit.clone();
        }
        let rates = self.effective_rates();
        let mut stores = self.stores.write().unwrap();
        stores
            .entry(store_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(StoreLimit {
                    add: TokenBucket::new(rates.add_rate, self.burst_seconds),
                    remove: TokenBucket::new(rates.remove_rate, self.burst_seconds),
                    manual: false,
                }))
            })
            .clone()
    }

    fn effective_rates(&self) -> SceneRates {
        match *self.mode.read().unwrap() {
            LimitMode::Manual => {
                let rate = *self.manual_rate.read().unwrap();
                SceneRates {
                    add_rate: rate,
                    remove_rate: rate,
                }
            }
            LimitMode::Auto => {
                let scene = *self.current_scene.read().unwrap();
                self.scenes
                    .read()
                    .unwrap()
                    .get(&scene)
                    .copied()
                    .unwrap_or(SceneRates {
                        add_rate: DEFAULT_RATE,
                        remove_rate: DEFAULT_RATE,
                    })
            }
        }
    }

    pub fn available(&self, store_id: StoreId, kind: StoreLimitKind) -> bool {
        let entry = self.entry(store_id);
        let mut limit = entry.lock().unwrap();
        limit.bucket(kind).available(1.0)
    }

    pub fn take(&self, store_id: StoreId, kind: StoreLimitKind) -> bool {
        let entry = self.entry(store_id);
        let mut limit = entry.lock().unwrap();
        limit.bucket(kind).take(1.0)
    }

    /// Pin a store's rates, overriding the scene until reset.
    pub fn set_store_rate(&self, store_id: StoreId, rate: f64) {
        let entry = self.entry(store_id);
        let mut limit = entry.lock().unwrap();
        limit.manual = true;
        limit.add.set_rate(rate, self.burst_seconds);
        limit.remove.set_rate(rate, self.burst_seconds);
    }

    /// Pin every known store and the mode to a single manual rate. Stores
    /// that register later bootstrap from this rate too.
    pub fn set_all_rates(&self, rate: f64) {
        *self.mode.write().unwrap() = LimitMode::Manual;
        *self.manual_rate.write().unwrap() = rate;
        for entry in self.stores.read().unwrap().values() {
            let mut limit = entry.lock().unwrap();
            limit.manual = true;
            limit.add.set_rate(rate, self.burst_seconds);
            limit.remove.set_rate(rate, self.burst_seconds);
        }
    }

    pub fn set_mode(&self, mode: LimitMode) {
        *self.mode.write().unwrap() = mode;
    }

    pub fn mode(&self) -> LimitMode {
        *self.mode.read().unwrap()
    }

    pub fn set_scene_rates(&self, scene: Scene, rates: SceneRates) {
        self.scenes.write().unwrap().insert(scene, rates);
    }

    pub fn scene_rates(&self) -> BTreeMap<Scene, SceneRates> {
        self.scenes.read().unwrap().clone()
    }

    pub fn current_scene(&self) -> Scene {
        *self.current_scene.read().unwrap()
    }

    /// Move auto-mode stores to the rates of `scene`. Manual overrides keep
    /// their pinned rates.
    pub fn sync_scene(&self, scene: Scene) {
        {
            let mut current = self.current_scene.write().unwrap();
            if *current == scene {
                return;
            }
            *current = scene;
        }
        if *self.mode.read().unwrap() != LimitMode::Auto {
            return;
        }
        let rates = self.effective_rates();
        for entry in self.stores.read().unwrap().values() {
            let mut limit = entry.lock().unwrap();
            if limit.manual {
                continue;
            }
            limit.add.set_rate(rates.add_rate, self.burst_seconds);
            limit.remove.set_rate(rates.remove_rate, self.burst_seconds);
        }
        tracing::info!(?scene, "store limits moved to new scene");
    }
}
