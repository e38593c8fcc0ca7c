//! The operator controller: admission, dispatch, progression, retirement.
//!
//! One mutex guards the running table, the waiting queue, and the history
//! ring together; every other structure the controller touches (metadata,
//! limiter, streams) has its own lock and is always taken after the
//! controller's, never the other way around.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::ScheduleConfig;
use crate::error::{Error, RejectReason, Result};
use crate::heartbeat::{RegionHeartbeatResponse, ResponseStreams};
use crate::limiter::{StoreLimitKind, StoreLimiter};
use crate::metadata::{MetaStore, Region, RegionId};
use crate::operator::{OpKind, OpProgress, OpStatus, Operator, OperatorRecord, Step};

struct RunningOp {
    op: Operator,
    last_send: Option<Instant>,
    /// Cursor position of the last command sent; a fresh step is always sent
    /// regardless of the resend throttle.
    sent_cursor: Option<usize>,
}

struct WaitingOp {
    op: Operator,
    enqueued: Instant,
}

#[derive(Default)]
struct ControllerCore {
    running: HashMap<RegionId, RunningOp>,
    waiting: VecDeque<WaitingOp>,
    history: VecDeque<OperatorRecord>,
}

pub struct OperatorController {
    meta: Arc<MetaStore>,
    limiter: Arc<StoreLimiter>,
    streams: Arc<ResponseStreams>,
    cfg: ScheduleConfig,
    core: Mutex<ControllerCore>,
}

impl OperatorController {
    pub fn new(
        meta: Arc<MetaStore>,
        limiter: Arc<StoreLimiter>,
        streams: Arc<ResponseStreams>,
        cfg: ScheduleConfig,
    ) -> Self {
        Self {
            meta,
            limiter,
            streams,
            cfg,
            core: Mutex::new(ControllerCore::default()),
        }
    }

    /// Running operators carrying the given kind flag.
    pub fn operator_count(&self, kind: OpKind) -> usize {
        self.core
            .lock()
            .unwrap()
            .running
            .values()
            .filter(|r| r.op.kind().contains(kind))
            .count()
    }

    pub fn running_operator(&self, region_id: RegionId) -> Option<Operator> {
        self.core
            .lock()
            .unwrap()
            .running
            .get(&region_id)
            .map(|r| r.op.clone())
    }

    pub fn operators(&self) -> Vec<Operator> {
        let core = self.core.lock().unwrap();
        let mut ops: Vec<Operator> = core.running.values().map(|r| r.op.clone()).collect();
        ops.sort_by_key(|op| op.region_id());
        ops
    }

    pub fn waiting_len(&self) -> usize {
        self.core.lock().unwrap().waiting.len()
    }

    /// Admit an operator. Fails loudly; callers that want queue-on-no-tokens
    /// behavior use [`offer`](Self::offer).
    pub fn add_operator(&self, op: Operator) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        self.try_admit(&mut core, op)
    }

    /// Admit a set atomically: every operator is validated before any is
    /// inserted. A token shortage after validation unwinds the inserted ones.
    pub fn add_operators(&self, ops: Vec<Operator>) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        for op in &ops {
            self.validate(&core, op)?;
        }
        let mut admitted: Vec<RegionId> = Vec::new();
        for op in ops {
            let region_id = op.region_id();
            match self.try_admit(&mut core, op) {
                Ok(()) => admitted.push(region_id),
                Err(err) => {
                    // Tokens taken for the earlier members are not returned;
                    // they refill within one burst window.
                    for id in admitted {
                        core.running.remove(&id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Admit now, or park in the waiting queue when only tokens are missing.
    /// Returns true when the operator started running immediately.
    pub fn offer(&self, op: Operator) -> Result<bool> {
        let mut core = self.core.lock().unwrap();
        match self.try_admit(&mut core, op.clone()) {
            Ok(()) => Ok(true),
            Err(Error::OperatorRejected(RejectReason::NoTokens)) => {
                if core.waiting.len() >= self.cfg.waiting_capacity {
                    return Err(Error::OperatorRejected(RejectReason::WaitingFull));
                }
                core.waiting.push_back(WaitingOp {
                    op,
                    enqueued: Instant::now(),
                });
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn validate(&self, core: &ControllerCore, op: &Operator) -> Result<()> {
        let region_id = op.region_id();
        if self.meta.get_region(region_id).is_none() {
            return Err(Error::RegionNotFound(region_id));
        }
        if let Some(running) = core.running.get(&region_id) {
            if running.op.priority() > op.priority() {
                return Err(Error::OperatorRejected(RejectReason::LowerPriority));
            }
            if running.op.priority() == op.priority() {
                return Err(Error::OperatorRejected(RejectReason::AlreadyExists));
            }
        }
        if !op.kind().is_admin() && self.kind_cap_reached(core, op.kind()) {
            return Err(Error::OperatorRejected(RejectReason::ExceedLimit));
        }
        Ok(())
    }

    fn kind_cap_reached(&self, core: &ControllerCore, kind: OpKind) -> bool {
        let (flag, cap) = if kind.contains(OpKind::MERGE) {
            (OpKind::MERGE, self.cfg.merge_schedule_limit)
        } else if kind.contains(OpKind::HOT_REGION) {
            (OpKind::HOT_REGION, self.cfg.hot_region_schedule_limit)
        } else if kind.contains(OpKind::RANGE) {
            (OpKind::RANGE, self.cfg.range_schedule_limit)
        } else if kind.contains(OpKind::REGION) {
            (OpKind::REGION, self.cfg.region_schedule_limit)
        } else if kind.contains(OpKind::LEADER) {
            (OpKind::LEADER, self.cfg.leader_schedule_limit)
        } else {
            return false;
        };
        let running = core
            .running
            .values()
            .filter(|r| r.op.kind().contains(flag))
            .count();
        running >= cap
    }

    fn step_tokens(op: &Operator) -> Vec<(u64, StoreLimitKind)> {
        let mut needed = Vec::new();
        for i in 0..op.len() {
            match op.step(i) {
                Some(Step::AddPeer { store_id, .. }) => {
                    needed.push((*store_id, StoreLimitKind::AddPeer))
                }
                Some(Step::RemovePeer { store_id }) => {
                    needed.push((*store_id, StoreLimitKind::RemovePeer))
                }
                _ => {}
            }
        }
        needed
    }

    fn try_admit(&self, core: &mut ControllerCore, mut op: Operator) -> Result<()> {
        self.validate(core, &op)?;
        let region_id = op.region_id();
        let region = self
            .meta
            .get_region(region_id)
            .ok_or(Error::RegionNotFound(region_id))?;

        // An operator whose end state already holds is a success, not a task.
        match op.check(&region) {
            OpProgress::Finished => {
                op.set_status(OpStatus::Success);
                Self::record(&self.cfg, core, &op, OpStatus::Success);
                return Ok(());
            }
            OpProgress::Failed => {
                Self::record(&self.cfg, core, &op, OpStatus::Cancel);
                return Err(Error::InvalidInput(format!(
                    "operator on region {region_id} can no longer make progress"
                )));
            }
            OpProgress::Awaiting(_) => {}
        }

        if !op.kind().is_admin() {
            let needed = Self::step_tokens(&op);
            for (store_id, kind) in &needed {
                if !self.limiter.available(*store_id, *kind) {
                    return Err(Error::OperatorRejected(RejectReason::NoTokens));
                }
            }
            for (store_id, kind) in &needed {
                self.limiter.take(*store_id, *kind);
            }
        }

        if let Some(previous) = core.running.remove(&region_id) {
            let mut prev = previous.op;
            prev.set_status(OpStatus::Replaced);
            tracing::info!(region_id, desc = prev.desc(), "operator replaced by higher priority");
            Self::record(&self.cfg, core, &prev, OpStatus::Replaced);
        }

        op.set_status(OpStatus::Started);
        tracing::info!(region_id, brief = %op.brief(), "operator started");
        let mut running = RunningOp {
            op,
            last_send: None,
            sent_cursor: None,
        };
        self.send_current(&mut running, &region);
        core.running.insert(region_id, running);
        Ok(())
    }

    fn send_current(&self, running: &mut RunningOp, region: &Region) {
        let Some(step) = running.op.current_step() else {
            return;
        };
        let Some(leader_store) = region.leader_store_id() else {
            return;
        };
        let response = RegionHeartbeatResponse {
            region_id: region.id,
            epoch: region.epoch,
            step: step.clone(),
        };
        running.last_send = Some(Instant::now());
        running.sent_cursor = Some(running.op.cursor());
        self.streams.push(leader_store, response);
    }

    /// Heartbeat-path progression for one region.
    pub fn dispatch(&self, region: &Region) {
        let mut core = self.core.lock().unwrap();
        let Some(mut running) = core.running.remove(&region.id) else {
            return;
        };
        if running.op.has_expired() {
            running.op.set_status(OpStatus::Timeout);
            tracing::warn!(region_id = region.id, desc = running.op.desc(), "operator timed out");
            Self::record(&self.cfg, &mut core, &running.op, OpStatus::Timeout);
            return;
        }
        match running.op.check(region) {
            OpProgress::Finished => {
                running.op.set_status(OpStatus::Success);
                tracing::info!(region_id = region.id, desc = running.op.desc(), "operator finished");
                Self::record(&self.cfg, &mut core, &running.op, OpStatus::Success);
            }
            OpProgress::Failed => {
                running.op.set_status(OpStatus::Cancel);
                tracing::warn!(
                    region_id = region.id,
                    desc = running.op.desc(),
                    "operator step failed, canceling"
                );
                Self::record(&self.cfg, &mut core, &running.op, OpStatus::Cancel);
            }
            OpProgress::Awaiting(_) => {
                let advanced = running.sent_cursor != Some(running.op.cursor());
                let resend_due = running
                    .last_send
                    .map(|at| at.elapsed() >= self.cfg.operator_resend_interval)
                    .unwrap_or(true);
                if advanced || resend_due {
                    self.send_current(&mut running, region);
                }
                core.running.insert(region.id, running);
            }
        }
    }

    /// Forcibly retire the running operator on a region, e.g. from the admin
    /// surface.
    pub fn remove_operator(&self, region_id: RegionId, status: OpStatus) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let Some(mut running) = core.running.remove(&region_id) else {
            return Err(Error::RegionNotFound(region_id));
        };
        running.op.set_status(status);
        tracing::info!(region_id, desc = running.op.desc(), ?status, "operator removed");
        Self::record(&self.cfg, &mut core, &running.op, status);
        Ok(())
    }

    /// The region vanished from the map (merge or delete observed). A merge
    /// operator reaching this point did its job.
    pub fn handle_region_removed(&self, region_id: RegionId) {
        let mut core = self.core.lock().unwrap();
        let Some(mut running) = core.running.remove(&region_id) else {
            return;
        };
        let status = if running.op.kind().contains(OpKind::MERGE) {
            OpStatus::Success
        } else {
            OpStatus::Cancel
        };
        running.op.set_status(status);
        Self::record(&self.cfg, &mut core, &running.op, status);
    }

    /// Retire running operators that blew their deadline. Called from the
    /// sweeper so stalled regions without heartbeats still time out.
    pub fn check_timeouts(&self) {
        let mut core = self.core.lock().unwrap();
        let expired: Vec<RegionId> = core
            .running
            .iter()
            .filter(|(_, r)| r.op.has_expired())
            .map(|(id, _)| *id)
            .collect();
        for region_id in expired {
            if let Some(mut running) = core.running.remove(&region_id) {
                running.op.set_status(OpStatus::Timeout);
                tracing::warn!(region_id, desc = running.op.desc(), "operator timed out");
                Self::record(&self.cfg, &mut core, &running.op, OpStatus::Timeout);
            }
        }
    }

    /// Park an operator until tokens free up.
    pub fn enqueue_waiting(&self, op: Operator) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.waiting.len() >= self.cfg.waiting_capacity {
            return Err(Error::OperatorRejected(RejectReason::WaitingFull));
        }
        core.waiting.push_back(WaitingOp {
            op,
            enqueued: Instant::now(),
        });
        Ok(())
    }

    /// Promote waiting operators as tokens refill: high priority first, then
    /// arrival order. Entries past their TTL are dropped as Expired. Fairness
    /// is best-effort; the TTL bounds starvation.
    pub fn promote_waiting(&self) {
        let mut core = self.core.lock().unwrap();
        let mut entries: Vec<WaitingOp> = core.waiting.drain(..).collect();
        entries.sort_by(|a, b| {
            b.op.priority()
                .cmp(&a.op.priority())
                .then(a.enqueued.cmp(&b.enqueued))
        });
        for entry in entries {
            if entry.enqueued.elapsed() > self.cfg.operator_wait_ttl {
                let mut op = entry.op;
                op.set_status(OpStatus::Expired);
                tracing::debug!(region_id = op.region_id(), desc = op.desc(), "waiting operator expired");
                Self::record(&self.cfg, &mut core, &op, OpStatus::Expired);
                continue;
            }
            let region_id = entry.op.region_id();
            let desc = entry.op.desc().to_string();
            match self.try_admit(&mut core, entry.op.clone()) {
                Ok(()) => {}
                Err(Error::OperatorRejected(RejectReason::NoTokens))
                | Err(Error::OperatorRejected(RejectReason::ExceedLimit)) => {
                    core.waiting.push_back(entry);
                }
                Err(err) => {
                    tracing::debug!(region_id, desc, error = %err, "dropping waiting operator");
                    let mut op = entry.op;
                    op.set_status(OpStatus::Cancel);
                    Self::record(&self.cfg, &mut core, &op, OpStatus::Cancel);
                }
            }
        }
    }

    /// Retire everything in flight, e.g. on losing coordinator leadership.
    pub fn clear(&self, status: OpStatus) {
        let mut core = self.core.lock().unwrap();
        let running: Vec<RunningOp> = core.running.drain().map(|(_, r)| r).collect();
        for mut r in running {
            r.op.set_status(status);
            Self::record(&self.cfg, &mut core, &r.op, status);
        }
        let waiting: Vec<WaitingOp> = core.waiting.drain(..).collect();
        for mut w in waiting {
            w.op.set_status(status);
            Self::record(&self.cfg, &mut core, &w.op, status);
        }
    }

    pub fn history(&self) -> Vec<OperatorRecord> {
        let mut core = self.core.lock().unwrap();
        Self::prune_history(&self.cfg, &mut core);
        core.history.iter().cloned().collect()
    }

    fn record(cfg: &ScheduleConfig, core: &mut ControllerCore, op: &Operator, status: OpStatus) {
        core.history.push_back(OperatorRecord {
            region_id: op.region_id(),
            desc: op.desc().to_string(),
            kind: op.kind(),
            status,
            duration: op.elapsed(),
            finished_at: Instant::now(),
        });
        Self::prune_history(cfg, core);
    }

    fn prune_history(cfg: &ScheduleConfig, core: &mut ControllerCore) {
        let retention = cfg.history_retention;
        while let Some(front) = core.history.front() {
            if front.finished_at.elapsed() > retention {
                core.history.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::metadata::{Peer, Region, RegionEpoch, Store};
    use crate::operator::{
        apply_step, create_move_peer, create_transfer_leader, OpPriority,
    };
    use tokio::sync::mpsc;

    fn region(id: RegionId, stores: &[u64]) -> Region {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, &s)| Peer::voter(id * 100 + i as u64, s))
            .collect();
        Region {
            id,
            start_key: id.to_be_bytes().to_vec(),
            end_key: (id + 1).to_be_bytes().to_vec(),
            epoch: RegionEpoch::new(1, 1),
            leader: peers.first().copied(),
            peers,
            approximate_size: 10,
            ..Default::default()
        }
    }

    fn setup(cfg: ScheduleConfig) -> (Arc<MetaStore>, Arc<StoreLimiter>, OperatorController) {
        let meta = Arc::new(MetaStore::new());
        for id in 1..=4 {
            meta.put_store(Store::new(id, format!("s{id}"))).unwrap();
        }
        meta.put_region(region(1, &[1, 2, 3])).unwrap();
        let limiter = Arc::new(StoreLimiter::default());
        let controller = OperatorController::new(
            meta.clone(),
            limiter.clone(),
            Arc::new(ResponseStreams::new()),
            cfg,
        );
        (meta, limiter, controller)
    }

    #[test]
    fn one_operator_per_region_and_priority_replaces() {
        let (meta, _limiter, controller) = setup(ScheduleConfig::default());
        let r = meta.get_region(1).unwrap();

        let op = create_transfer_leader("balance-leader", &r, 2, OpKind::BALANCE, 15.0).unwrap();
        controller.add_operator(op).unwrap();

        // Same priority on the same region: rejected.
        let dup = create_transfer_leader("balance-leader", &r, 3, OpKind::BALANCE, 15.0).unwrap();
        assert!(matches!(
            controller.add_operator(dup),
            Err(Error::OperatorRejected(RejectReason::AlreadyExists))
        ));

        // Higher priority replaces the running one.
        let mut urgent =
            create_move_peer(&meta, "replace-down-replica", &r, 3, 4, OpKind::REPLICA, 15.0)
                .unwrap();
        urgent.set_priority(OpPriority::High);
        controller.add_operator(urgent).unwrap();
        assert_eq!(
            controller.running_operator(1).unwrap().desc(),
            "replace-down-replica"
        );
        let history = controller.history();
        assert!(history
            .iter()
            .any(|rec| rec.desc == "balance-leader" && rec.status == OpStatus::Replaced));

        // And a lower-priority newcomer bounces off the high one.
        let low = create_transfer_leader("balance-leader", &r, 2, OpKind::BALANCE, 15.0).unwrap();
        assert!(matches!(
            controller.add_operator(low),
            Err(Error::OperatorRejected(RejectReason::LowerPriority))
        ));
    }

    #[test]
    fn already_satisfied_operator_succeeds_without_running() {
        let (meta, _limiter, controller) = setup(ScheduleConfig::default());
        let r = meta.get_region(1).unwrap();
        // Leadership is already on store 1; asking for store 1 via a
        // transfer from a stale snapshot is invalid input, so build the op
        // against a snapshot whose leader is elsewhere.
        let mut stale = r.clone();
        stale.leader = stale.store_peer(2).copied();
        let op = create_transfer_leader("grant-leader", &stale, 1, OpKind::LEADER, 15.0).unwrap();

        controller.add_operator(op).unwrap();
        assert!(controller.running_operator(1).is_none());
        let history = controller.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OpStatus::Success);
    }

    #[test]
    fn no_tokens_rejects_and_waiting_queue_promotes() {
        let (meta, limiter, controller) = setup(ScheduleConfig::default());
        limiter.set_store_rate(4, 0.0);
        let r = meta.get_region(1).unwrap();
        let op = create_move_peer(&meta, "balance-region", &r, 3, 4, OpKind::BALANCE, 15.0).unwrap();

        let err = controller.add_operator(op.clone()).unwrap_err();
        assert!(matches!(
            err,
            Error::OperatorRejected(RejectReason::NoTokens)
        ));

        controller.enqueue_waiting(op).unwrap();
        assert_eq!(controller.waiting_len(), 1);
        controller.promote_waiting();
        assert_eq!(controller.waiting_len(), 1, "still no tokens");

        limiter.set_store_rate(4, 1.0);
        controller.promote_waiting();
        assert_eq!(controller.waiting_len(), 0);
        assert_eq!(
            controller.running_operator(1).unwrap().desc(),
            "balance-region"
        );
    }

    #[test]
    fn kind_cap_gates_admission() {
        let mut cfg = ScheduleConfig::default();
        cfg.leader_schedule_limit = 1;
        let (meta, _limiter, controller) = setup(cfg);
        meta.put_region(region(2, &[1, 2, 3])).unwrap();
        let r1 = meta.get_region(1).unwrap();
        let r2 = meta.get_region(2).unwrap();

        controller
            .add_operator(
                create_transfer_leader("balance-leader", &r1, 2, OpKind::BALANCE, 15.0).unwrap(),
            )
            .unwrap();
        assert!(matches!(
            controller.add_operator(
                create_transfer_leader("balance-leader", &r2, 2, OpKind::BALANCE, 15.0).unwrap()
            ),
            Err(Error::OperatorRejected(RejectReason::ExceedLimit))
        ));
        assert_eq!(controller.operator_count(OpKind::LEADER), 1);
    }

    #[test]
    fn dispatch_walks_steps_and_throttles_resends() {
        let mut cfg = ScheduleConfig::default();
        cfg.operator_resend_interval = Duration::from_secs(3600);
        let (meta, _limiter, controller) = setup(cfg);
        let streams = controller.streams.clone();
        let (tx, mut rx) = mpsc::channel(16);
        streams.bind(1, tx);

        let mut r = meta.get_region(1).unwrap();
        let op = create_move_peer(&meta, "balance-region", &r, 3, 4, OpKind::BALANCE, 15.0).unwrap();
        controller.add_operator(op).unwrap();

        // Admission pushed the first step to the leader's stream.
        let first = rx.try_recv().unwrap();
        assert!(matches!(first.step, Step::AddPeer { store_id: 4, .. }));

        // A heartbeat with no progress inside the resend window stays quiet.
        controller.dispatch(&r);
        assert!(rx.try_recv().is_err());

        // Progress: the store applied the step; dispatch sends the next one.
        apply_step(&mut r, &first.step);
        meta.put_region(r.clone()).unwrap();
        controller.dispatch(&r);
        let second = rx.try_recv().unwrap();
        assert!(matches!(second.step, Step::PromoteLearner { store_id: 4, .. }));

        // Walk the remaining steps to completion.
        let mut next = second;
        loop {
            apply_step(&mut r, &next.step);
            meta.put_region(r.clone()).unwrap();
            controller.dispatch(&r);
            match rx.try_recv() {
                Ok(resp) => next = resp,
                Err(_) => break,
            }
        }
        assert!(controller.running_operator(1).is_none());
        assert!(controller
            .history()
            .iter()
            .any(|rec| rec.status == OpStatus::Success));
    }

    #[test]
    fn remove_operator_retires_with_the_given_status() {
        let (meta, _limiter, controller) = setup(ScheduleConfig::default());
        let r = meta.get_region(1).unwrap();
        controller
            .add_operator(
                create_transfer_leader("balance-leader", &r, 2, OpKind::BALANCE, 15.0).unwrap(),
            )
            .unwrap();
        assert!(matches!(
            controller.remove_operator(9, OpStatus::Cancel),
            Err(Error::RegionNotFound(9))
        ));
        controller.remove_operator(1, OpStatus::Cancel).unwrap();
        assert!(controller.running_operator(1).is_none());
        assert_eq!(controller.history()[0].status, OpStatus::Cancel);
    }

    #[test]
    fn clear_cancels_everything_in_flight() {
        let (meta, limiter, controller) = setup(ScheduleConfig::default());
        let r = meta.get_region(1).unwrap();
        controller
            .add_operator(
                create_transfer_leader("balance-leader", &r, 2, OpKind::BALANCE, 15.0).unwrap(),
            )
            .unwrap();
        limiter.set_store_rate(4, 0.0);
        let parked =
            create_move_peer(&meta, "balance-region", &r, 3, 4, OpKind::BALANCE, 15.0).unwrap();
        controller.enqueue_waiting(parked).unwrap();

        controller.clear(OpStatus::Cancel);
        assert!(controller.running_operator(1).is_none());
        assert_eq!(controller.waiting_len(), 0);
        let history = controller.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|rec| rec.status == OpStatus::Cancel));
    }
}
