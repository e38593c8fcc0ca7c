//! Error taxonomy shared across the scheduling core.
//!
//! Every boundary (heartbeat ingest, operator admission, admin handlers)
//! reports one of these variants. Each variant maps to a stable numeric code
//! so external surfaces can translate without string matching.

use thiserror::Error;

/// Why an operator was refused at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// An operator with equal or higher priority is already running on the region.
    AlreadyExists,
    /// The new operator has lower priority than the running one.
    LowerPriority,
    /// A store-limit bucket had no tokens for an add/remove-peer step.
    NoTokens,
    /// The waiting queue is at capacity.
    WaitingFull,
    /// The global cap for the operator's kind is already reached.
    ExceedLimit,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AlreadyExists => "already-exists",
            RejectReason::LowerPriority => "lower-priority",
            RejectReason::NoTokens => "no-tokens",
            RejectReason::WaitingFull => "waiting-full",
            RejectReason::ExceedLimit => "exceed-limit",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not the scheduling leader")]
    NotLeader,
    #[error("cluster is not bootstrapped")]
    NotBootstrapped,
    #[error("region {0} not found")]
    RegionNotFound(u64),
    #[error("store {0} not found")]
    StoreNotFound(u64),
    #[error("store {0} has been tombstoned")]
    StoreTombstoned(u64),
    #[error("region {0} has an abnormal peer")]
    RegionAbnormalPeer(u64),
    #[error("regions are not adjacent")]
    RegionNotAdjacent,
    /// A heartbeat carried an older epoch than the authoritative record.
    /// This is a soft error: the sender is behind, nothing is wrong here.
    #[error("stale heartbeat for region {region_id}: reported ({reported_conf_ver}, {reported_version})")]
    StaleRegion {
        region_id: u64,
        reported_conf_ver: u64,
        reported_version: u64,
    },
    #[error("operator rejected: {0}")]
    OperatorRejected(RejectReason),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("incompatible cluster version")]
    IncompatibleVersion,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable numeric codes for external surfaces. `Internal` and
/// `StoreTombstoned` keep their historical values; the rest are assigned
/// around them and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Internal = 5,
    NotLeader = 10,
    NotBootstrapped = 11,
    RegionNotFound = 12,
    StoreNotFound = 13,
    RegionAbnormalPeer = 14,
    RegionNotAdjacent = 15,
    StaleRegion = 16,
    OperatorRejected = 17,
    InvalidInput = 18,
    IncompatibleVersion = 19,
    Timeout = 20,
    StoreTombstoned = 100,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotLeader => ErrorCode::NotLeader,
            Error::NotBootstrapped => ErrorCode::NotBootstrapped,
            Error::RegionNotFound(_) => ErrorCode::RegionNotFound,
            Error::StoreNotFound(_) => ErrorCode::StoreNotFound,
            Error::StoreTombstoned(_) => ErrorCode::StoreTombstoned,
            Error::RegionAbnormalPeer(_) => ErrorCode::RegionAbnormalPeer,
            Error::RegionNotAdjacent => ErrorCode::RegionNotAdjacent,
            Error::StaleRegion { .. } => ErrorCode::StaleRegion,
            Error::OperatorRejected(_) => ErrorCode::OperatorRejected,
            Error::InvalidInput(_) => ErrorCode::InvalidInput,
            Error::IncompatibleVersion => ErrorCode::IncompatibleVersion,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// HTTP status used by the admin surface. `StoreNotFound` reports 500
    /// while `RegionNotFound` reports 404; the asymmetry is long-standing
    /// observable behavior and is kept as-is.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotLeader => 412,
            Error::RegionNotFound(_) => 404,
            Error::StoreNotFound(_) => 500,
            Error::StoreTombstoned(_) => 410,
            Error::NotBootstrapped | Error::Internal(_) | Error::Timeout(_) => 500,
            _ => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
