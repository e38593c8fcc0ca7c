//! Operators: ordered scripts of membership and leadership changes.
//!
//! An operator is immutable after admission except for its step cursor and
//! terminal status. Step confirmation is pure over the latest region
//! snapshot; the controller polls it on every heartbeat.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::metadata::{
    MetaStore, Peer, PeerRole, Region, RegionEpoch, RegionId, StoreId,
};

/// Bitmask classifying an operator. Flags compose, e.g. a balance-leader
/// operator is `LEADER | BALANCE`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OpKind(u32);

impl OpKind {
    pub const ADMIN: OpKind = OpKind(1 << 0);
    pub const LEADER: OpKind = OpKind(1 << 1);
    pub const REGION: OpKind = OpKind(1 << 2);
    pub const REPLICA: OpKind = OpKind(1 << 3);
    pub const BALANCE: OpKind = OpKind(1 << 4);
    pub const RANGE: OpKind = OpKind(1 << 5);
    pub const HOT_REGION: OpKind = OpKind(1 << 6);
    pub const MERGE: OpKind = OpKind(1 << 7);
    pub const SPLIT: OpKind = OpKind(1 << 8);
    pub const ADJACENT: OpKind = OpKind(1 << 9);

    pub fn contains(self, other: OpKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_admin(self) -> bool {
        self.contains(OpKind::ADMIN)
    }
}

impl BitOr for OpKind {
    type Output = OpKind;
    fn bitor(self, rhs: OpKind) -> OpKind {
        OpKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpKind {
    fn bitor_assign(&mut self, rhs: OpKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OpKind, &str); 10] = [
            (OpKind::ADMIN, "admin"),
            (OpKind::LEADER, "leader"),
            (OpKind::REGION, "region"),
            (OpKind::REPLICA, "replica"),
            (OpKind::BALANCE, "balance"),
            (OpKind::RANGE, "range"),
            (OpKind::HOT_REGION, "hot-region"),
            (OpKind::MERGE, "merge"),
            (OpKind::SPLIT, "split"),
            (OpKind::ADJACENT, "adjacent"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpPriority {
    Normal,
    High,
}

/// How to pick split points when executing a SplitRegion step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitPolicy {
    Scan,
    Approximate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Done,
    Failed,
}

/// One atomic action inside an operator.
#[derive(Clone, Debug)]
pub enum Step {
    AddPeer {
        store_id: StoreId,
        peer_id: u64,
        is_learner: bool,
    },
    PromoteLearner {
        store_id: StoreId,
        peer_id: u64,
    },
    RemovePeer {
        store_id: StoreId,
    },
    TransferLeader {
        from: StoreId,
        to: StoreId,
    },
    MergeRegion {
        target: Region,
        is_passive: bool,
    },
    SplitRegion {
        policy: SplitPolicy,
        keys: Vec<Vec<u8>>,
        start_version: u64,
    },
}

impl Step {
    /// Evaluate this step against the latest region snapshot.
    pub fn confirm(&self, region: &Region) -> StepStatus {
        match self {
            Step::AddPeer {
                store_id,
                peer_id,
                is_learner,
            } => match region.store_peer(*store_id) {
                None => StepStatus::Pending,
                Some(peer) if peer.id != *peer_id => StepStatus::Failed,
                Some(peer) => {
                    if region.pending_peer_on(*store_id) {
                        StepStatus::Pending
                    } else if !*is_learner && peer.is_learner() {
                        StepStatus::Pending
                    } else {
                        StepStatus::Done
                    }
                }
            },
            Step::PromoteLearner { store_id, peer_id } => match region.store_peer(*store_id) {
                None => StepStatus::Failed,
                Some(peer) if peer.id != *peer_id => StepStatus::Failed,
                Some(peer) if peer.is_learner() => StepStatus::Pending,
                Some(_) => StepStatus::Done,
            },
            Step::RemovePeer { store_id } => {
                if region.store_peer(*store_id).is_none() {
                    StepStatus::Done
                } else if region.leader_store_id() == Some(*store_id) {
                    // Removing the leader's peer is never dispatched; the
                    // leader must move first.
                    StepStatus::Failed
                } else {
                    StepStatus::Pending
                }
            }
            Step::TransferLeader { from, to } => match region.leader_store_id() {
                Some(store) if store == *to => StepStatus::Done,
                Some(store) if store == *from => StepStatus::Pending,
                // Another election intervened.
                _ => StepStatus::Failed,
            },
            Step::MergeRegion { target, .. } => {
                if region.start_key == target.start_key && region.end_key == target.end_key {
                    StepStatus::Done
                } else {
                    StepStatus::Pending
                }
            }
            Step::SplitRegion { start_version, .. } => {
                if region.epoch.version > *start_version {
                    StepStatus::Done
                } else {
                    StepStatus::Pending
                }
            }
        }
    }

    /// Per-step completion budget. Snapshot-moving steps scale with region
    /// size over the assumed balance bandwidth.
    pub fn timeout(&self, region_size: u64, store_balance_rate: f64) -> Duration {
        match self {
            Step::AddPeer { .. } | Step::MergeRegion { .. } | Step::SplitRegion { .. } => {
                let rate = store_balance_rate.max(0.1);
                Duration::from_secs_f64((region_size as f64 / rate).max(10.0))
            }
            Step::PromoteLearner { .. } | Step::RemovePeer { .. } | Step::TransferLeader { .. } => {
                Duration::from_secs(10)
            }
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::AddPeer {
                store_id,
                is_learner: true,
                ..
            } => write!(f, "add learner on store {store_id}"),
            Step::AddPeer { store_id, .. } => write!(f, "add peer on store {store_id}"),
            Step::PromoteLearner { store_id, .. } => {
                write!(f, "promote learner on store {store_id}")
            }
            Step::RemovePeer { store_id } => write!(f, "remove peer on store {store_id}"),
            Step::TransferLeader { from, to } => {
                write!(f, "transfer leader from store {from} to store {to}")
            }
            Step::MergeRegion { target, .. } => write!(f, "merge into region {}", target.id),
            Step::SplitRegion { keys, .. } => write!(f, "split region at {} keys", keys.len()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    Created,
    Started,
    Success,
    Timeout,
    Cancel,
    Replaced,
    Expired,
}

impl OpStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OpStatus::Created | OpStatus::Started)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Created => "created",
            OpStatus::Started => "started",
            OpStatus::Success => "success",
            OpStatus::Timeout => "timeout",
            OpStatus::Cancel => "cancel",
            OpStatus::Replaced => "replaced",
            OpStatus::Expired => "expired",
        }
    }
}

/// Result of checking an operator against a region snapshot.
#[derive(Clone, Debug)]
pub enum OpProgress {
    /// Every step confirmed done.
    Finished,
    /// Execution is at this step; the store should be (re)told about it.
    Awaiting(Step),
    /// A step can no longer succeed (epoch moved under us).
    Failed,
}

#[derive(Clone)]
pub struct Operator {
    region_id: RegionId,
    desc: String,
    region_epoch: RegionEpoch,
    kind: OpKind,
    priority: OpPriority,
    steps: Vec<Step>,
    cursor: usize,
    created: Instant,
    timeout: Duration,
    status: OpStatus,
}

impl Operator {
    pub fn new(
        desc: impl Into<String>,
        region: &Region,
        kind: OpKind,
        priority: OpPriority,
        steps: Vec<Step>,
        store_balance_rate: f64,
    ) -> Self {
        let timeout = steps
            .iter()
            .map(|s| s.timeout(region.approximate_size, store_balance_rate))
            .sum();
        Self {
            region_id: region.id,
            desc: desc.into(),
            region_epoch: region.epoch,
            kind,
            priority,
            steps,
            cursor: 0,
            created: Instant::now(),
            timeout,
            status: OpStatus::Created,
        }
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn set_desc(&mut self, desc: impl Into<String>) {
        self.desc = desc.into();
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn attach_kind(&mut self, kind: OpKind) {
        self.kind |= kind;
    }

    pub fn priority(&self) -> OpPriority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: OpPriority) {
        self.priority = priority;
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn set_status(&mut self, status: OpStatus) {
        self.status = status;
    }

    pub fn region_epoch(&self) -> RegionEpoch {
        self.region_epoch
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, idx: usize) -> Option<&Step> {
        self.steps.get(idx)
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn has_expired(&self) -> bool {
        self.created.elapsed() > self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Advance the cursor over confirmed steps. The cursor never moves
    /// backwards; this is the only place it moves at all.
    pub fn check(&mut self, region: &Region) -> OpProgress {
        while let Some(step) = self.steps.get(self.cursor) {
            match step.confirm(region) {
                StepStatus::Done => self.cursor += 1,
                StepStatus::Pending => return OpProgress::Awaiting(step.clone()),
                StepStatus::Failed => return OpProgress::Failed,
            }
        }
        OpProgress::Finished
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    pub fn brief(&self) -> String {
        format!(
            "{} (region {}, kind {:?}, {} steps)",
            self.desc,
            self.region_id,
            self.kind,
            self.steps.len()
        )
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("region_id", &self.region_id)
            .field("desc", &self.desc)
            .field("kind", &self.kind)
            .field("cursor", &self.cursor)
            .field("status", &self.status)
            .finish()
    }
}

/// Completed-operator record kept in the controller's history ring.
#[derive(Clone, Debug)]
pub struct OperatorRecord {
    pub region_id: RegionId,
    pub desc: String,
    pub kind: OpKind,
    pub status: OpStatus,
    pub duration: Duration,
    pub finished_at: Instant,
}

fn check_target_store(meta: &MetaStore, region: &Region, store_id: StoreId) -> Result<()> {
    let store = meta
        .get_store(store_id)
        .ok_or(Error::StoreNotFound(store_id))?;
    if store.is_tombstone() {
        return Err(Error::StoreTombstoned(store_id));
    }
    if region.store_peer(store_id).is_some() {
        return Err(Error::RegionAbnormalPeer(region.id));
    }
    Ok(())
}

/// Add a voter replica on `store_id`.
pub fn create_add_peer(
    meta: &MetaStore,
    desc: &str,
    region: &Region,
    store_id: StoreId,
    kind: OpKind,
    rate: f64,
) -> Result<Operator> {
    check_target_store(meta, region, store_id)?;
    let peer_id = meta.allocate_peer_id();
    let steps = vec![Step::AddPeer {
        store_id,
        peer_id,
        is_learner: false,
    }];
    Ok(Operator::new(
        desc,
        region,
        kind | OpKind::REGION,
        OpPriority::Normal,
        steps,
        rate,
    ))
}

/// Remove the replica on `store_id`, transferring leadership away first when
/// needed.
pub fn create_remove_peer(
    _meta: &MetaStore,
    desc: &str,
    region: &Region,
    store_id: StoreId,
    kind: OpKind,
    rate: f64,
) -> Result<Operator> {
    if region.store_peer(store_id).is_none() {
        return Err(Error::RegionAbnormalPeer(region.id));
    }
    let mut steps = Vec::new();
    if region.leader_store_id() == Some(store_id) {
        let to = region
            .voters()
            .map(|p| p.store_id)
            .filter(|s| *s != store_id)
            .min()
            .ok_or(Error::RegionAbnormalPeer(region.id))?;
        steps.push(Step::TransferLeader { from: store_id, to });
    }
    steps.push(Step::RemovePeer { store_id });
    Ok(Operator::new(
        desc,
        region,
        kind | OpKind::REGION,
        OpPriority::Normal,
        steps,
        rate,
    ))
}

/// Move the replica on `from` to `to`: add learner, promote, shift the leader
/// off `from` if it lives there, then remove.
pub fn create_move_peer(
    meta: &MetaStore,
    desc: &str,
    region: &Region,
    from: StoreId,
    to: StoreId,
    kind: OpKind,
    rate: f64,
) -> Result<Operator> {
    if region.store_peer(from).is_none() {
        return Err(Error::RegionAbnormalPeer(region.id));
    }
    check_target_store(meta, region, to)?;
    let peer_id = meta.allocate_peer_id();
    let mut steps = vec![
        Step::AddPeer {
            store_id: to,
            peer_id,
            is_learner: true,
        },
        Step::PromoteLearner {
            store_id: to,
            peer_id,
        },
    ];
    if region.leader_store_id() == Some(from) {
        steps.push(Step::TransferLeader { from, to });
    }
    steps.push(Step::RemovePeer { store_id: from });
    Ok(Operator::new(
        desc,
        region,
        kind | OpKind::REGION,
        OpPriority::Normal,
        steps,
        rate,
    ))
}

pub fn create_transfer_leader(
    desc: &str,
    region: &Region,
    to: StoreId,
    kind: OpKind,
    rate: f64,
) -> Result<Operator> {
    let from = region
        .leader_store_id()
        .ok_or(Error::RegionAbnormalPeer(region.id))?;
    if from == to {
        return Err(Error::InvalidInput(format!(
            "region {} leader is already on store {to}",
            region.id
        )));
    }
    let target = region
        .store_peer(to)
        .ok_or(Error::RegionAbnormalPeer(region.id))?;
    if target.is_learner() {
        return Err(Error::RegionAbnormalPeer(region.id));
    }
    Ok(Operator::new(
        desc,
        region,
        kind | OpKind::LEADER,
        OpPriority::Normal,
        vec![Step::TransferLeader { from, to }],
        rate,
    ))
}

pub fn create_promote_learner(
    desc: &str,
    region: &Region,
    store_id: StoreId,
    kind: OpKind,
    rate: f64,
) -> Result<Operator> {
    let peer = region
        .store_peer(store_id)
        .ok_or(Error::RegionAbnormalPeer(region.id))?;
    if peer.role != PeerRole::Learner {
        return Err(Error::RegionAbnormalPeer(region.id));
    }
    let peer_id = peer.id;
    Ok(Operator::new(
        desc,
        region,
        kind | OpKind::REGION,
        OpPriority::Normal,
        vec![Step::PromoteLearner { store_id, peer_id }],
        rate,
    ))
}

/// Merge `source` into its adjacent `target`. Returns the active operator for
/// the source and the passive one for the target; they must be admitted
/// atomically.
pub fn create_merge_operators(
    desc: &str,
    source: &Region,
    target: &Region,
    kind: OpKind,
    rate: f64,
) -> Result<(Operator, Operator)> {
    let forward = !source.end_key.is_empty() && source.end_key == target.start_key;
    let backward = !target.end_key.is_empty() && target.end_key == source.start_key;
    if !forward && !backward {
        return Err(Error::RegionNotAdjacent);
    }
    let merged = Region {
        start_key: if forward {
            source.start_key.clone()
        } else {
            target.start_key.clone()
        },
        end_key: if forward {
            target.end_key.clone()
        } else {
            source.end_key.clone()
        },
        ..target.clone()
    };
    let active = Operator::new(
        desc,
        source,
        kind | OpKind::MERGE,
        OpPriority::Normal,
        vec![Step::MergeRegion {
            target: merged.clone(),
            is_passive: false,
        }],
        rate,
    );
    let passive = Operator::new(
        desc,
        target,
        kind | OpKind::MERGE,
        OpPriority::Normal,
        vec![Step::MergeRegion {
            target: merged,
            is_passive: true,
        }],
        rate,
    );
    Ok((active, passive))
}

pub fn create_split(
    desc: &str,
    region: &Region,
    policy: SplitPolicy,
    keys: Vec<Vec<u8>>,
    rate: f64,
) -> Operator {
    let step = Step::SplitRegion {
        policy,
        keys,
        start_version: region.epoch.version,
    };
    Operator::new(
        desc,
        region,
        OpKind::SPLIT | OpKind::ADMIN,
        OpPriority::Normal,
        vec![step],
        rate,
    )
}

/// Apply a step's end state to a region descriptor, advancing the epoch the
/// way a compliant store would. Used by the simulator and tests to emulate
/// step execution.
pub fn apply_step(region: &mut Region, step: &Step) {
    match step {
        Step::AddPeer {
            store_id,
            peer_id,
            is_learner,
        } => {
            if region.store_peer(*store_id).is_none() {
                region.peers.push(Peer {
                    id: *peer_id,
                    store_id: *store_id,
                    role: if *is_learner {
                        PeerRole::Learner
                    } else {
                        PeerRole::Voter
                    },
                });
                region.epoch.conf_ver += 1;
            }
        }
        Step::PromoteLearner { store_id, .. } => {
            if let Some(peer) = region.peers.iter_mut().find(|p| p.store_id == *store_id) {
                if peer.role == PeerRole::Learner {
                    peer.role = PeerRole::Voter;
                    region.epoch.conf_ver += 1;
                }
            }
        }
        Step::RemovePeer { store_id } => {
            let before = region.peers.len();
            region.peers.retain(|p| p.store_id != *store_id);
            if region.peers.len() != before {
                region.epoch.conf_ver += 1;
            }
            if region.leader_store_id() == Some(*store_id) {
                let new_leader = region.voters().next().copied();
                region.leader = new_leader;
            }
        }
        Step::TransferLeader { to, .. } => {
            region.leader = region.store_peer(*to).copied();
        }
        Step::MergeRegion { target, .. } => {
            region.start_key = target.start_key.clone();
            region.end_key = target.end_key.clone();
            region.epoch.version += 1;
        }
        Step::SplitRegion { .. } => {
            region.epoch.version += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Store;

    fn region(id: RegionId, stores: &[StoreId]) -> Region {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, &s)| Peer::voter(id * 100 + i as u64, s))
            .collect();
        Region {
            id,
            start_key: Vec::new(),
            end_key: Vec::new(),
            epoch: RegionEpoch::new(1, 1),
            leader: peers.first().copied(),
            peers,
            approximate_size: 64,
            ..Default::default()
        }
    }

    fn meta_with_stores(ids: &[StoreId]) -> MetaStore {
        let meta = MetaStore::new();
        for &id in ids {
            meta.put_store(Store::new(id, format!("s{id}"))).unwrap();
        }
        meta
    }

    #[test]
    fn kind_flags_compose() {
        let kind = OpKind::LEADER | OpKind::ADMIN;
        assert!(kind.contains(OpKind::LEADER));
        assert!(kind.contains(OpKind::ADMIN));
        assert!(!kind.contains(OpKind::REGION));
        assert_eq!(format!("{kind:?}"), "admin|leader");
    }

    #[test]
    fn move_peer_walks_every_step() {
        let meta = meta_with_stores(&[1, 2, 3, 4]);
        let mut r = region(1, &[1, 2, 3]);
        let mut op =
            create_move_peer(&meta, "balance-region", &r, 1, 4, OpKind::BALANCE, 15.0).unwrap();
        assert_eq!(op.len(), 4); // leader on store 1 forces a transfer

        // Nothing happened yet: the first step is awaited.
        let step = match op.check(&r) {
            OpProgress::Awaiting(step) => step,
            other => panic!("unexpected progress: {other:?}"),
        };
        apply_step(&mut r, &step);
        // Learner added; promote is next.
        let step = match op.check(&r) {
            OpProgress::Awaiting(step) => step,
            other => panic!("unexpected progress: {other:?}"),
        };
        assert!(matches!(step, Step::PromoteLearner { store_id: 4, .. }));
        apply_step(&mut r, &step);
        let step = match op.check(&r) {
            OpProgress::Awaiting(step) => step,
            other => panic!("unexpected progress: {other:?}"),
        };
        assert!(matches!(step, Step::TransferLeader { from: 1, to: 4 }));
        apply_step(&mut r, &step);
        let step = match op.check(&r) {
            OpProgress::Awaiting(step) => step,
            other => panic!("unexpected progress: {other:?}"),
        };
        assert!(matches!(step, Step::RemovePeer { store_id: 1 }));
        apply_step(&mut r, &step);
        assert!(matches!(op.check(&r), OpProgress::Finished));
        assert_eq!(r.store_ids().into_iter().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn finished_end_state_confirms_mid_script() {
        let meta = meta_with_stores(&[1, 2, 3, 4]);
        let r = region(1, &[1, 2, 3]);
        let mut op =
            create_move_peer(&meta, "balance-region", &r, 1, 4, OpKind::BALANCE, 15.0).unwrap();

        // A heartbeat already showing the end state completes the whole script.
        let mut done = r.clone();
        for i in 0..op.len() {
            let step = op.step(i).unwrap().clone();
            apply_step(&mut done, &step);
        }
        assert!(matches!(op.check(&done), OpProgress::Finished));
    }

    #[test]
    fn unexpected_leader_move_fails_the_step() {
        let r = region(1, &[1, 2, 3]);
        let mut op = create_transfer_leader("evict-leader", &r, 2, OpKind::LEADER, 15.0).unwrap();
        let mut elsewhere = r.clone();
        elsewhere.leader = elsewhere.store_peer(3).copied();
        assert!(matches!(op.check(&elsewhere), OpProgress::Failed));
    }

    #[test]
    fn add_peer_rejects_duplicate_and_tombstone_targets() {
        let meta = meta_with_stores(&[1, 2]);
        let r = region(1, &[1]);
        assert!(matches!(
            create_add_peer(&meta, "make-up-replica", &r, 1, OpKind::REPLICA, 15.0),
            Err(Error::RegionAbnormalPeer(1))
        ));
        assert!(matches!(
            create_add_peer(&meta, "make-up-replica", &r, 9, OpKind::REPLICA, 15.0),
            Err(Error::StoreNotFound(9))
        ));
        meta.remove_store(2).unwrap();
        meta.bury_store(2, true).unwrap();
        assert!(matches!(
            create_add_peer(&meta, "make-up-replica", &r, 2, OpKind::REPLICA, 15.0),
            Err(Error::StoreTombstoned(2))
        ));
    }

    #[test]
    fn remove_leader_peer_transfers_first() {
        let meta = meta_with_stores(&[1, 2, 3]);
        let r = region(1, &[1, 2, 3]);
        let op =
            create_remove_peer(&meta, "remove-extra-replica", &r, 1, OpKind::REPLICA, 15.0)
                .unwrap();
        assert_eq!(op.len(), 2);
        assert!(matches!(
            op.step(0),
            Some(Step::TransferLeader { from: 1, to: 2 })
        ));
    }

    #[test]
    fn merge_requires_adjacency() {
        let mut left = region(1, &[1, 2, 3]);
        left.end_key = b"b".to_vec();
        let mut right = region(2, &[1, 2, 3]);
        right.start_key = b"c".to_vec();
        assert!(matches!(
            create_merge_operators("random-merge", &left, &right, OpKind::ADMIN, 15.0),
            Err(Error::RegionNotAdjacent)
        ));

        right.start_key = b"b".to_vec();
        let (active, passive) =
            create_merge_operators("random-merge", &left, &right, OpKind::ADMIN, 15.0).unwrap();
        assert!(active.kind().contains(OpKind::MERGE));
        assert_eq!(active.region_id(), 1);
        assert_eq!(passive.region_id(), 2);
    }

    #[test]
    fn split_confirms_on_version_bump() {
        let r = region(1, &[1, 2, 3]);
        let mut op = create_split(
            "admin-split-region",
            &r,
            SplitPolicy::Approximate,
            vec![b"m".to_vec()],
            15.0,
        );
        assert!(op.kind().is_admin());
        let step = match op.check(&r) {
            OpProgress::Awaiting(step) => step,
            other => panic!("unexpected progress: {other:?}"),
        };
        let mut split = r.clone();
        apply_step(&mut split, &step);
        assert_eq!(split.epoch.version, r.epoch.version + 1);
        assert!(matches!(op.check(&split), OpProgress::Finished));
    }

    #[test]
    fn timeout_scales_with_region_size() {
        let meta = meta_with_stores(&[1, 2]);
        let mut r = region(1, &[1]);
        r.approximate_size = 1500;
        let op = create_add_peer(&meta, "make-up-replica", &r, 2, OpKind::REPLICA, 15.0).unwrap();
        assert_eq!(op.timeout(), Duration::from_secs(100));

        // Small regions bottom out at the 10s floor.
        r.approximate_size = 30;
        let op = create_add_peer(&meta, "make-up-replica", &r, 2, OpKind::REPLICA, 15.0).unwrap();
        assert_eq!(op.timeout(), Duration::from_secs(10));
    }
}
