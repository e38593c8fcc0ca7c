//! Heartbeat message types and per-store response streams.
//!
//! The RPC transport itself lives elsewhere; this module defines the payloads
//! it carries and the push side of the bidirectional region-heartbeat stream.
//! Responses for one store always flow through a single bounded channel, so
//! they arrive in admission order.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::metadata::{
    Peer, PeerDownStats, Region, RegionEpoch, RegionId, StoreId, StoreStats,
};
use crate::operator::Step;

/// Inbound region heartbeat, reported by the region's leader store.
#[derive(Clone, Debug)]
pub struct RegionHeartbeat {
    pub region_id: RegionId,
    pub epoch: RegionEpoch,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub peers: Vec<Peer>,
    pub leader: Peer,
    pub down_peers: Vec<PeerDownStats>,
    pub pending_peers: Vec<Peer>,
    pub approximate_size: u64,
    pub approximate_keys: u64,
    pub bytes_written: u64,
    pub keys_written: u64,
    pub bytes_read: u64,
    pub keys_read: u64,
    /// Seconds covered by the flow counters above.
    pub interval_secs: u64,
}

impl RegionHeartbeat {
    pub fn to_region(&self) -> Region {
        Region {
            id: self.region_id,
            start_key: self.start_key.clone(),
            end_key: self.end_key.clone(),
            epoch: self.epoch,
            peers: self.peers.clone(),
            leader: Some(self.leader),
            down_peers: self.down_peers.clone(),
            pending_peers: self.pending_peers.clone(),
            approximate_size: self.approximate_size,
            approximate_keys: self.approximate_keys,
            written_bytes: self.bytes_written,
            written_keys: self.keys_written,
            read_bytes: self.bytes_read,
            read_keys: self.keys_read,
        }
    }

    /// A minimal heartbeat carrying just the region descriptor, as used by
    /// tests and the simulator.
    pub fn from_region(region: &Region, interval_secs: u64) -> Option<Self> {
        let leader = region.leader?;
        Some(Self {
            region_id: region.id,
            epoch: region.epoch,
            start_key: region.start_key.clone(),
            end_key: region.end_key.clone(),
            peers: region.peers.clone(),
            leader,
            down_peers: region.down_peers.clone(),
            pending_peers: region.pending_peers.clone(),
            approximate_size: region.approximate_size,
            approximate_keys: region.approximate_keys,
            bytes_written: region.written_bytes,
            keys_written: region.written_keys,
            bytes_read: region.read_bytes,
            keys_read: region.read_keys,
            interval_secs,
        })
    }
}

/// Inbound unary store heartbeat.
#[derive(Clone, Debug)]
pub struct StoreHeartbeat {
    pub store_id: StoreId,
    pub stats: StoreStats,
}

/// Outbound response: the next operator step for a region.
#[derive(Clone, Debug)]
pub struct RegionHeartbeatResponse {
    pub region_id: RegionId,
    pub epoch: RegionEpoch,
    pub step: Step,
}

/// Registry of per-store response senders. Binding a store replaces its
/// previous sender, so at most one stream is live per store; a push into a
/// full or closed channel tears the binding down and the store must rebind
/// on reconnect.
#[derive(Default)]
pub struct ResponseStreams {
    senders: Mutex<HashMap<StoreId, mpsc::Sender<RegionHeartbeatResponse>>>,
}

impl ResponseStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, store_id: StoreId, sender: mpsc::Sender<RegionHeartbeatResponse>) {
        let mut senders = self.senders.lock().unwrap();
        if senders.insert(store_id, sender).is_some() {
            tracing::debug!(store_id, "replaced heartbeat response stream");
        }
    }

    pub fn unbind(&self, store_id: StoreId) {
        self.senders.lock().unwrap().remove(&store_id);
    }

    pub fn is_bound(&self, store_id: StoreId) -> bool {
        self.senders.lock().unwrap().contains_key(&store_id)
    }

    /// Push a response onto the store's stream. Returns false when no stream
    /// is bound or the stream was torn down by this push.
    pub fn push(&self, store_id: StoreId, response: RegionHeartbeatResponse) -> bool {
        let mut senders = self.senders.lock().unwrap();
        let Some(sender) = senders.get(&store_id) else {
            return false;
        };
        match sender.try_send(response) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(store_id, error = %err, "heartbeat stream stalled, tearing down");
                senders.remove(&store_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RegionEpoch;

    fn response(region_id: RegionId) -> RegionHeartbeatResponse {
        RegionHeartbeatResponse {
            region_id,
            epoch: RegionEpoch::default(),
            step: Step::RemovePeer { store_id: 9 },
        }
    }

    #[test]
    fn push_preserves_order_per_store() {
        let streams = ResponseStreams::new();
        let (tx, mut rx) = mpsc::channel(8);
        streams.bind(1, tx);
        assert!(streams.push(1, response(10)));
        assert!(streams.push(1, response(11)));
        assert_eq!(rx.try_recv().unwrap().region_id, 10);
        assert_eq!(rx.try_recv().unwrap().region_id, 11);
    }

    #[test]
    fn full_channel_tears_down_the_binding() {
        let streams = ResponseStreams::new();
        let (tx, _rx) = mpsc::channel(1);
        streams.bind(1, tx);
        assert!(streams.push(1, response(10)));
        assert!(!streams.push(1, response(11)));
        assert!(!streams.is_bound(1));
    }

    #[test]
    fn rebinding_replaces_the_sender() {
        let streams = ResponseStreams::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        streams.bind(1, tx1);
        streams.bind(1, tx2);
        assert!(streams.push(1, response(10)));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().region_id, 10);
    }
}
