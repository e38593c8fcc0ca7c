//! Placement-driver scheduling core for the atlas sharded key-value store.
//!
//! The cluster partitions its keyspace into regions, each replicated across
//! stores. This crate is the coordinator's brain: it ingests heartbeats into
//! an in-memory metadata map, reacts to unhealthy regions through checkers,
//! proactively balances load through schedulers, and drives the resulting
//! operators step by step over the heartbeat response streams, all under
//! per-store rate limits.
//!
//! The replicated log backing the coordinator, the RPC transport, and the
//! admin HTTP surface live elsewhere; this crate defines the payloads and
//! error codes those layers carry.

pub mod checker;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod heartbeat;
pub mod limiter;
pub mod metadata;
pub mod operator;
pub mod schedulers;
pub mod stats;
pub mod view;

pub use config::{ScheduleConfig, SchedulePolicy};
pub use coordinator::Coordinator;
pub use error::{Error, ErrorCode, RejectReason, Result};
pub use metadata::{
    MetaStore, Peer, PeerRole, Region, RegionEpoch, RegionId, Store, StoreId, StoreState,
};
pub use operator::{OpKind, OpPriority, OpStatus, Operator, Step, StepStatus};
