//! Connection identifiers and the shared connection table.
//!
//! The table is read by sender threads (to find a connection's outbound
//! queue) and written by the event loop (accept/close). Each outbound queue
//! has its own lock so enqueueing never contends with the table for long.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

/// Opaque identifier of one accepted client connection.
///
/// Identifiers are unique within one multiplexer run and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// FIFO of encoded frames waiting to be written to one connection.
pub(crate) type OutboundQueue = Arc<Mutex<VecDeque<Bytes>>>;

#[derive(Debug)]
struct Entry {
    addr: SocketAddr,
    outbound: OutboundQueue,
}

/// Live connections, indexed by id and by remote IP.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    by_id: HashMap<ConnectionId, Entry>,
    /// Accept order is kept so `send_to_ip` is deterministic.
    by_ip: HashMap<IpAddr, Vec<ConnectionId>>,
}

impl ConnectionTable {
    pub(crate) fn insert(&mut self, id: ConnectionId, addr: SocketAddr) -> OutboundQueue {
        let outbound = OutboundQueue::default();
        self.by_id.insert(
            id,
            Entry {
                addr,
                outbound: Arc::clone(&outbound),
            },
        );
        self.by_ip.entry(addr.ip()).or_default().push(id);
        outbound
    }

    /// Remove a connection from both indexes.
    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<SocketAddr> {
        let entry = self.by_id.remove(&id)?;
        let ip = entry.addr.ip();
        if let Some(ids) = self.by_ip.get_mut(&ip) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_ip.remove(&ip);
            }
        }
        Some(entry.addr)
    }

    pub(crate) fn outbound(&self, id: ConnectionId) -> Option<OutboundQueue> {
        self.by_id.get(&id).map(|entry| Arc::clone(&entry.outbound))
    }

    pub(crate) fn outbound_for_ip(&self, ip: IpAddr) -> Vec<(ConnectionId, OutboundQueue)> {
        self.by_ip
            .get(&ip)
            .into_iter()
            .flatten()
            .filter_map(|id| self.outbound(*id).map(|queue| (*id, queue)))
            .collect()
    }

    pub(crate) fn addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.by_id.get(&id).map(|entry| entry.addr)
    }

    pub(crate) fn ids_for_ip(&self, ip: IpAddr) -> Vec<ConnectionId> {
        self.by_ip.get(&ip).cloned().unwrap_or_default()
    }

    /// All connections, sorted by id.
    pub(crate) fn snapshot(&self) -> Vec<(ConnectionId, SocketAddr)> {
        let mut all: Vec<_> = self
            .by_id
            .iter()
            .map(|(id, entry)| (*id, entry.addr))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = ConnectionTable::default();
        let queue = table.insert(ConnectionId(1), addr("10.0.0.1:5000"));

        queue.lock().unwrap().push_back(Bytes::from_static(b"x"));

        let found = table.outbound(ConnectionId(1)).unwrap();
        assert_eq!(found.lock().unwrap().len(), 1);
        assert_eq!(table.addr(ConnectionId(1)), Some(addr("10.0.0.1:5000")));
        assert!(table.outbound(ConnectionId(2)).is_none());
    }

    #[test]
    fn test_ip_index_keeps_accept_order() {
        let mut table = ConnectionTable::default();
        table.insert(ConnectionId(3), addr("10.0.0.1:5000"));
        table.insert(ConnectionId(4), addr("10.0.0.2:5000"));
        table.insert(ConnectionId(5), addr("10.0.0.1:5001"));

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(table.ids_for_ip(ip), vec![ConnectionId(3), ConnectionId(5)]);
        assert_eq!(table.outbound_for_ip(ip).len(), 2);
    }

    #[test]
    fn test_remove_purges_both_indexes() {
        let mut table = ConnectionTable::default();
        table.insert(ConnectionId(1), addr("10.0.0.1:5000"));
        table.insert(ConnectionId(2), addr("10.0.0.1:5001"));

        assert_eq!(table.remove(ConnectionId(1)), Some(addr("10.0.0.1:5000")));
        assert_eq!(table.remove(ConnectionId(1)), None);

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(table.ids_for_ip(ip), vec![ConnectionId(2)]);

        table.remove(ConnectionId(2));
        assert!(table.ids_for_ip(ip).is_empty());
        assert!(table.by_ip.is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_snapshot_sorted() {
        let mut table = ConnectionTable::default();
        table.insert(ConnectionId(9), addr("10.0.0.1:1"));
        table.insert(ConnectionId(2), addr("10.0.0.2:1"));

        let ids: Vec<_> = table.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![ConnectionId(2), ConnectionId(9)]);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionId(42).to_string(), "#42");
    }
}
