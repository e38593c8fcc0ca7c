//! The coordinator: heartbeat ingest plus the periodic control loops.
//!
//! Three background workers run while the process holds scheduling
//! leadership: the patrol loop walks regions in key order and runs the
//! checkers, the scheduler loop runs every enabled scheduler, and the sweeper
//! promotes waiting operators, expires deadlines, and keeps store limits in
//! the right scene. Losing leadership flips the shutdown watch; the loops
//! stop and in-flight operators retire as Cancel.

use std::sync::{Arc, Mutex, RwLock};

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::checker::{MergeChecker, ReplicaChecker};
use crate::config::ScheduleConfig;
use crate::controller::OperatorController;
use crate::error::{Error, Result};
use crate::heartbeat::{RegionHeartbeat, ResponseStreams, StoreHeartbeat};
use crate::limiter::{classify_scene, StoreLimiter};
use crate::metadata::MetaStore;
use crate::operator::{OpKind, OpStatus};
use crate::schedulers::Scheduler;
use crate::stats::{EventCounter, FlowStats};
use crate::view::ClusterView;

pub struct Coordinator {
    pub meta: Arc<MetaStore>,
    pub limiter: Arc<StoreLimiter>,
    pub flows: Arc<FlowStats>,
    pub counter: Arc<EventCounter>,
    pub streams: Arc<ResponseStreams>,
    pub controller: Arc<OperatorController>,
    cfg: ScheduleConfig,
    replica_checker: ReplicaChecker,
    merge_checker: MergeChecker,
    schedulers: RwLock<Vec<Arc<dyn Scheduler>>>,
    patrol_cursor: Mutex<Vec<u8>>,
    rng: Mutex<SmallRng>,
}

impl Coordinator {
    pub fn new(cfg: ScheduleConfig, seed: u64) -> Arc<Self> {
        let meta = Arc::new(MetaStore::new());
        let limiter = Arc::new(StoreLimiter::default());
        let flows = Arc::new(FlowStats::new(
            cfg.hot_region_threshold_bytes,
            cfg.hot_cache_hits,
        ));
        let counter = Arc::new(EventCounter::new());
        let streams = Arc::new(ResponseStreams::new());
        let controller = Arc::new(OperatorController::new(
            meta.clone(),
            limiter.clone(),
            streams.clone(),
            cfg.clone(),
        ));
        Arc::new(Self {
            meta,
            limiter,
            flows,
            counter: counter.clone(),
            streams,
            controller,
            cfg,
            replica_checker: ReplicaChecker::new(counter.clone()),
            merge_checker: MergeChecker::new(counter),
            schedulers: RwLock::new(Vec::new()),
            patrol_cursor: Mutex::new(Vec::new()),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        })
    }

    pub fn view(&self) -> ClusterView {
        ClusterView::new(
            self.meta.clone(),
            self.cfg.clone(),
            self.limiter.clone(),
            self.flows.clone(),
            self.counter.clone(),
        )
    }

    pub fn add_scheduler(&self, scheduler: Arc<dyn Scheduler>) -> Result<()> {
        let mut schedulers = self.schedulers.write().unwrap();
        if schedulers.iter().any(|s| s.name() == scheduler.name()) {
            return Err(Error::InvalidInput(format!(
                "scheduler {:?} already registered",
                scheduler.name()
            )));
        }
        tracing::info!(name = scheduler.name(), "scheduler added");
        schedulers.push(scheduler);
        Ok(())
    }

    pub fn remove_scheduler(&self, name: &str) -> Result<()> {
        let mut schedulers = self.schedulers.write().unwrap();
        let before = schedulers.len();
        schedulers.retain(|s| s.name() != name);
        if schedulers.len() == before {
            return Err(Error::InvalidInput(format!("scheduler {name:?} not found")));
        }
        tracing::info!(name, "scheduler removed");
        Ok(())
    }

    /// The persisted aggregate: every scheduler with its encoded config.
    pub fn scheduler_configs(&self) -> Vec<(String, String, serde_json::Value)> {
        self.schedulers
            .read()
            .unwrap()
            .iter()
            .map(|s| (s.name().to_string(), s.kind().to_string(), s.encode_config()))
            .collect()
    }

    /// Ingest a region heartbeat and drive the dispatch path. A stale epoch
    /// comes back as `Err(StaleRegion)` for the transport to answer; nothing
    /// is modified in that case.
    pub fn handle_region_heartbeat(&self, hb: RegionHeartbeat) -> Result<()> {
        self.flows.record(&hb);
        let region = hb.to_region();
        let evicted = self.meta.put_region(region.clone())?;
        for region_id in evicted {
            self.controller.handle_region_removed(region_id);
        }
        self.controller.dispatch(&region);
        Ok(())
    }

    pub fn handle_store_heartbeat(&self, hb: StoreHeartbeat) -> Result<()> {
        self.meta.update_store_stats(hb.store_id, hb.stats)?;
        self.limiter.sync_scene(classify_scene(
            self.meta.total_pending_peers(),
            self.meta.total_snapshots(),
        ));
        Ok(())
    }

    /// One patrol round: the next `patrol_batch` regions in key order, each
    /// run through the checkers until one produces an operator.
    pub fn patrol_once(&self) {
        let start = self.patrol_cursor.lock().unwrap().clone();
        let mut regions = self.meta.scan_regions(&start, self.cfg.patrol_batch);
        if regions.len() < self.cfg.patrol_batch && !start.is_empty() {
            // Wrap around so small clusters still get full coverage.
            let more = self.meta.scan_regions(b"", self.cfg.patrol_batch - regions.len());
            regions.extend(more.into_iter().filter(|r| r.start_key < start));
        }
        let next_cursor = regions
            .last()
            .map(|r| {
                if r.end_key.is_empty() {
                    Vec::new()
                } else {
                    r.end_key.clone()
                }
            })
            .unwrap_or_default();
        *self.patrol_cursor.lock().unwrap() = next_cursor;

        let view = self.view();
        for region in regions {
            if let Some(op) = self.replica_checker.check(&view, &region) {
                self.offer_logged(op.region_id(), "replica-checker", || {
                    self.controller.offer(op.clone()).map(|_| ())
                });
                continue;
            }
            if let Some((active, passive)) = self.merge_checker.check(&view, &region) {
                let region_id = active.region_id();
                self.offer_logged(region_id, "merge-checker", || {
                    self.controller.add_operators(vec![active.clone(), passive.clone()])
                });
            }
        }
    }

    /// One scheduler round: every registered scheduler that is allowed to run
    /// proposes operators, which are offered to the controller.
    pub fn run_schedulers_once(&self) {
        let schedulers: Vec<Arc<dyn Scheduler>> =
            self.schedulers.read().unwrap().iter().cloned().collect();
        let view = self.view();
        for scheduler in schedulers {
            if !scheduler.is_allowed(&view) {
                self.counter.inc(scheduler.name(), "not-allowed");
                continue;
            }
            let ops = {
                let mut rng = self.rng.lock().unwrap();
                scheduler.schedule(&view, &mut rng)
            };
            if ops.is_empty() {
                continue;
            }
            let merge_pair = ops.len() > 1 && ops.iter().all(|op| op.kind().contains(OpKind::MERGE));
            if merge_pair {
                let region_id = ops[0].region_id();
                self.offer_logged(region_id, scheduler.name(), || {
                    self.controller.add_operators(ops.clone())
                });
            } else {
                for op in ops {
                    self.offer_logged(op.region_id(), scheduler.name(), || {
                        self.controller.offer(op.clone()).map(|_| ())
                    });
                }
            }
        }
    }

    /// Rejection is routine, not an error: count it and move on.
    fn offer_logged(&self, region_id: u64, source: &str, attempt: impl Fn() -> Result<()>) {
        match attempt() {
            Ok(()) => {}
            Err(Error::OperatorRejected(reason)) => {
                self.counter.inc(source, reason.as_str());
                tracing::debug!(region_id, source, %reason, "operator not admitted");
            }
            Err(err) => {
                self.counter.inc(source, "add-error");
                tracing::debug!(region_id, source, error = %err, "operator add failed");
            }
        }
    }

    /// Start the background loops. They stop when `shutdown` flips to true
    /// or its sender drops; in-flight operators are then canceled.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let this = self.clone();
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.cfg.patrol_region_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.patrol_once(),
                    res = rx.changed() => {
                        if res.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        let this = self.clone();
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.cfg.scheduler_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.run_schedulers_once(),
                    res = rx.changed() => {
                        if res.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("scheduling stopped, canceling in-flight operators");
            this.controller.clear(OpStatus::Cancel);
        }));

        let this = self.clone();
        let mut rx = shutdown;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.controller.check_timeouts();
                        this.controller.promote_waiting();
                        this.limiter.sync_scene(classify_scene(
                            this.meta.total_pending_peers(),
                            this.meta.total_snapshots(),
                        ));
                    }
                    res = rx.changed() => {
                        if res.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }
}
