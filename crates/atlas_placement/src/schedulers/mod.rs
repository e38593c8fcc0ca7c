//! Proactive schedulers.
//!
//! Every scheduler answers four questions: who am I, may I run now (kind-
//! scoped allowance against the operator controller), what would I do (a list
//! of operators), and what is my config (a JSON blob the admin surface can
//! persist and echo back).

mod adjacent;
mod balance;
mod hot_region;
mod label;
mod random_merge;
mod scatter_range;
mod shuffle;

pub use adjacent::AdjacentRegionScheduler;
pub use balance::{BalanceLeaderScheduler, BalanceRegionScheduler};
pub use hot_region::HotRegionScheduler;
pub use label::{EvictLeaderScheduler, GrantLeaderScheduler, LabelScheduler};
pub use random_merge::RandomMergeScheduler;
pub use scatter_range::ScatterRangeScheduler;
pub use shuffle::{ShuffleHotRegionScheduler, ShuffleLeaderScheduler, ShuffleRegionScheduler};

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::SmallRng;

use crate::controller::OperatorController;
use crate::error::{Error, Result};
use crate::filter::{filter_targets, Filter, HealthFilter, RejectLeaderFilter, StateFilter};
use crate::metadata::{Region, StoreId};
use crate::operator::Operator;
use crate::stats::FlowKind;
use crate::view::ClusterView;

pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Stable type string, used for registration and admin routing.
    fn kind(&self) -> &'static str;

    fn encode_config(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn is_allowed(&self, view: &ClusterView) -> bool;

    fn schedule(&self, view: &ClusterView, rng: &mut SmallRng) -> Vec<Operator>;
}

/// Build a scheduler from its type string and positional arguments, the shape
/// the admin surface posts.
pub fn create_scheduler(
    kind: &str,
    args: &[String],
    controller: Arc<OperatorController>,
) -> Result<Box<dyn Scheduler>> {
    let parse_stores = |args: &[String]| -> Result<BTreeSet<StoreId>> {
        if args.is_empty() {
            return Err(Error::InvalidInput("at least one store id required".into()));
        }
        args.iter()
            .map(|a| {
                a.parse::<StoreId>()
                    .map_err(|_| Error::InvalidInput(format!("bad store id {a:?}")))
            })
            .collect()
    };

    match kind {
        "balance-leader" => Ok(Box::new(BalanceLeaderScheduler::new(controller))),
        "balance-region" => Ok(Box::new(BalanceRegionScheduler::new(controller))),
        "hot-read-region" => Ok(Box::new(HotRegionScheduler::new(controller, FlowKind::Read))),
        "hot-write-region" => Ok(Box::new(HotRegionScheduler::new(
            controller,
            FlowKind::Write,
        ))),
        "scatter-range" => {
            if args.len() != 3 || args[2].is_empty() {
                return Err(Error::InvalidInput(
                    "scatter-range needs start-key, end-key and a range name".into(),
                ));
            }
            Ok(Box::new(ScatterRangeScheduler::new(
                controller,
                args[0].as_bytes().to_vec(),
                args[1].as_bytes().to_vec(),
                args[2].clone(),
            )))
        }
        "label" => Ok(Box::new(LabelScheduler::new(controller))),
        "evict-leader" => Ok(Box::new(EvictLeaderScheduler::new(
            controller,
            parse_stores(args)?,
        ))),
        "grant-leader" => Ok(Box::new(GrantLeaderScheduler::new(
            controller,
            parse_stores(args)?,
        ))),
        "shuffle-leader" => Ok(Box::new(ShuffleLeaderScheduler::new(controller))),
        "shuffle-region" => {
            let roles = if args.is_empty() {
                vec!["follower".to_string()]
            } else {
                args.to_vec()
            };
            Ok(Box::new(ShuffleRegionScheduler::new(controller, roles)))
        }
        "shuffle-hot-region" => Ok(Box::new(ShuffleHotRegionScheduler::new(controller))),
        "adjacent-region" => {
            let leader_limit = args
                .first()
                .map(|a| a.parse().unwrap_or(adjacent::DEFAULT_LEADER_LIMIT))
                .unwrap_or(adjacent::DEFAULT_LEADER_LIMIT);
            let peer_limit = args
                .get(1)
                .map(|a| a.parse().unwrap_or(adjacent::DEFAULT_PEER_LIMIT))
                .unwrap_or(adjacent::DEFAULT_PEER_LIMIT);
            Ok(Box::new(AdjacentRegionScheduler::new(
                controller,
                leader_limit,
                peer_limit,
            )))
        }
        "random-merge" => Ok(Box::new(RandomMergeScheduler::new(controller))),
        other => Err(Error::InvalidInput(format!("unknown scheduler {other:?}"))),
    }
}

/// The follower store best suited to take over leadership: lowest leader
/// score among followers that are live, not pending in this region, and (when
/// asked) not labeled to reject leaders.
pub(crate) fn best_follower_target(
    view: &ClusterView,
    region: &Region,
    honor_reject_leader: bool,
) -> Option<StoreId> {
    let follower_ids: BTreeSet<StoreId> = region
        .follower_peers()
        .iter()
        .filter(|p| !region.pending_peer_on(p.store_id) && !region.down_peer_on(p.store_id))
        .map(|p| p.store_id)
        .collect();
    let candidates: Vec<_> = view
        .stores()
        .into_iter()
        .filter(|s| follower_ids.contains(&s.id))
        .collect();
    let mut filters: Vec<Box<dyn Filter>> = vec![Box::new(StateFilter), Box::new(HealthFilter)];
    if honor_reject_leader {
        filters.push(Box::new(RejectLeaderFilter));
    }
    filter_targets(&view.cfg, &candidates, &filters)
        .into_iter()
        .min_by(|a, b| {
            view.leader_score(a)
                .partial_cmp(&view.leader_score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        })
        .map(|s| s.id)
}


#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use crate::config::ScheduleConfig;
    use crate::controller::OperatorController;
    use crate::heartbeat::ResponseStreams;
    use crate::limiter::StoreLimiter;
    use crate::metadata::{MetaStore, Peer, Region, RegionEpoch, RegionId, Store, StoreId};
    use crate::stats::{EventCounter, FlowStats};
    use crate::view::ClusterView;

    pub struct TestCluster {
        pub meta: Arc<MetaStore>,
        pub limiter: Arc<StoreLimiter>,
        pub flows: Arc<FlowStats>,
        pub counter: Arc<EventCounter>,
        pub controller: Arc<OperatorController>,
        pub cfg: ScheduleConfig,
    }

    impl TestCluster {
        pub fn new(cfg: ScheduleConfig) -> Self {
            let meta = Arc::new(MetaStore::new());
            let limiter = Arc::new(StoreLimiter::default());
            let flows = Arc::new(FlowStats::new(
                cfg.hot_region_threshold_bytes,
                cfg.hot_cache_hits,
            ));
            let counter = Arc::new(EventCounter::new());
            let controller = Arc::new(OperatorController::new(
                meta.clone(),
                limiter.clone(),
                Arc::new(ResponseStreams::new()),
                cfg.clone(),
            ));
            Self {
                meta,
                limiter,
                flows,
                counter,
                controller,
                cfg,
            }
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

        pub fn add_leader_store(&self, id: StoreId, leader_count: u64) {
            let mut store = Store::new(id, format!("s{id}"));
            store.leader_count = leader_count;
            self.meta.put_store(store).unwrap();
        }

        /// Region whose peers sit on `stores`, leader on the first of them.
        /// Each region gets a synthetic one-id-wide key range so the map stays
        /// a proper partition.
        pub fn add_leader_region(&self, id: RegionId, stores: &[StoreId]) {
            let start = id.to_be_bytes().to_vec();
            let end = (id + 1).to_be_bytes().to_vec();
            self.add_leader_region_with_range(id, &start, &end, stores);
        }

        pub fn add_leader_region_with_range(
            &self,
            id: RegionId,
            start: &[u8],
            end: &[u8],
            stores: &[StoreId],
        ) {
            let peers: Vec<Peer> = stores
                .iter()
                .enumerate()
                .map(|(i, &s)| Peer::voter(id * 100 + i as u64, s))
                .collect();
            let region = Region {
                id,
                start_key: start.to_vec(),
                end_key: end.to_vec(),
                epoch: RegionEpoch::new(1, 1),
                leader: peers.first().copied(),
                peers,
                approximate_size: 10,
                approximate_keys: 100,
                ..Default::default()
            };
            self.meta.put_region(region).unwrap();
        }
    }
}
