//! Synthetic-cluster driver for the scheduling core.
//!
//! Builds a seeded cluster with a deliberately lopsided placement, then runs
//! patrol and scheduler rounds with perfect simulated stores: every step the
//! controller sends is applied to the metadata immediately, as if the store
//! executed it, and the resulting heartbeat is fed back in. Prints the
//! leader/region distribution before and after so balancing behavior is easy
//! to eyeball.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use atlas_placement::coordinator::Coordinator;
use atlas_placement::heartbeat::RegionHeartbeat;
use atlas_placement::operator::apply_step;
use atlas_placement::schedulers::{
    BalanceLeaderScheduler, BalanceRegionScheduler, RandomMergeScheduler,
};
use atlas_placement::{Peer, Region, RegionEpoch, ScheduleConfig, Store, StoreId};

#[derive(Parser, Debug)]
#[command(name = "placement-sim")]
struct Args {
    /// Number of stores in the synthetic cluster.
    #[arg(long, default_value_t = 5)]
    stores: u64,

    /// Number of regions carved out of the keyspace.
    #[arg(long, default_value_t = 64)]
    regions: u64,

    /// Voters per region.
    #[arg(long, default_value_t = 3)]
    replicas: usize,

    /// Control-loop rounds to run.
    #[arg(long, default_value_t = 200)]
    ticks: u64,

    /// Random seed shared by the cluster builder and the schedulers.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Fraction of regions whose replicas all start on the first stores.
    #[arg(long, default_value_t = 0.5)]
    imbalance: f64,

    /// Also run the random-merge scheduler.
    #[arg(long, default_value_t = false)]
    merge: bool,

    /// Pause between rounds, e.g. `250ms`; useful for watching the log.
    #[arg(long, default_value = "0ms")]
    tick_interval: humantime::Duration,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if args.replicas as u64 > args.stores {
        anyhow::bail!("need at least as many stores as replicas");
    }

    let mut cfg = ScheduleConfig::default();
    cfg.max_replicas = args.replicas;
    cfg.tolerant_size_ratio = 2.0;
    let coordinator = Coordinator::new(cfg, args.seed);

    build_cluster(&coordinator, &args).context("build synthetic cluster")?;
    coordinator.add_scheduler(Arc::new(BalanceLeaderScheduler::new(
        coordinator.controller.clone(),
    )))?;
    coordinator.add_scheduler(Arc::new(BalanceRegionScheduler::new(
        coordinator.controller.clone(),
    )))?;
    if args.merge {
        coordinator.add_scheduler(Arc::new(RandomMergeScheduler::new(
            coordinator.controller.clone(),
        )))?;
    }

    print_distribution(&coordinator, "initial");

    let pause: std::time::Duration = args.tick_interval.into();
    for tick in 0..args.ticks {
        coordinator.patrol_once();
        coordinator.run_schedulers_once();
        execute_pending_steps(&coordinator)?;
        coordinator.controller.promote_waiting();
        if tick % 50 == 0 {
            tracing::debug!(tick, running = coordinator.controller.operators().len());
        }
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
    }

    print_distribution(&coordinator, "final");

    let history = coordinator.controller.history();
    tracing::info!(finished_operators = history.len(), "run complete");
    for ((name, event), count) in coordinator.counter.snapshot() {
        tracing::info!(name, event, count, "counter");
    }
    Ok(())
}

/// Regions are one-key-wide slices of a big-endian u64 keyspace. With
/// probability `imbalance` all replicas land on the first stores, otherwise
/// they spread round-robin.
fn build_cluster(coordinator: &Arc<Coordinator>, args: &Args) -> anyhow::Result<()> {
    let mut rng = SmallRng::seed_from_u64(args.seed);
    for id in 1..=args.stores {
        let mut store = Store::new(id, format!("sim-store-{id}:20160"));
        store.stats.capacity = 512 << 30;
        store.stats.available = 384 << 30;
        coordinator.meta.put_store(store)?;
    }

    for id in 1..=args.regions {
        let skewed = rng.gen_bool(args.imbalance.clamp(0.0, 1.0));
        let members: Vec<StoreId> = if skewed {
            (1..=args.replicas as u64).collect()
        } else {
            (0..args.replicas as u64)
                .map(|i| (id + i) % args.stores + 1)
                .collect()
        };
        let peers: Vec<Peer> = members
            .iter()
            .enumerate()
            .map(|(i, &s)| Peer::voter(id * 1000 + i as u64, s))
            .collect();
        let region = Region {
            id,
            start_key: id.to_be_bytes().to_vec(),
            end_key: if id == args.regions {
                Vec::new()
            } else {
                (id + 1).to_be_bytes().to_vec()
            },
            epoch: RegionEpoch::new(1, 1),
            leader: peers.first().copied(),
            peers,
            approximate_size: 32 + rng.gen_range(0..64),
            approximate_keys: 100_000,
            ..Default::default()
        };
        coordinator.meta.put_region(region)?;
    }
    Ok(())
}

/// Play the stores' role: apply the current step of every running operator
/// and report back through the heartbeat path.
fn execute_pending_steps(coordinator: &Arc<Coordinator>) -> anyhow::Result<()> {
    for op in coordinator.controller.operators() {
        let Some(region) = coordinator.meta.get_region(op.region_id()) else {
            continue;
        };
        let Some(step) = op.current_step() else {
            continue;
        };
        let mut next = region.clone();
        apply_step(&mut next, step);
        let Some(hb) = RegionHeartbeat::from_region(&next, 10) else {
            continue;
        };
        match coordinator.handle_region_heartbeat(hb) {
            Ok(()) => {}
            Err(err) => tracing::debug!(region_id = next.id, error = %err, "sim heartbeat rejected"),
        }
    }
    Ok(())
}

fn print_distribution(coordinator: &Arc<Coordinator>, label: &str) {
    for store in coordinator.meta.stores() {
        tracing::info!(
            label,
            store_id = store.id,
            leaders = store.leader_count,
            regions = store.region_count,
            region_size = store.region_size,
            "distribution"
        );
    }
}
