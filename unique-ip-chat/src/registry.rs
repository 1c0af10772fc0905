//! Admission bookkeeping for the server.
//!
//! The set of admitted source addresses and the live connections live in one
//! [`Registry`] behind one lock, so no observer can see an address admitted
//! without its connection or the other way round.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use tokio::sync::Mutex;

pub type ConnectionId = u64;

pub type SharedRegistry<W> = Arc<Mutex<Registry<W>>>;

/// A live, admitted connection. The handler task owns the read side; the
/// registry owns the write side so broadcasts can reach it.
pub struct Connection<W> {
    id: ConnectionId,
    peer: SocketAddr,
    writer: W,
    closed: bool,
}

impl<W> Connection<W> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn addr(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Set once a write to this connection has failed. Broadcasts skip it
    /// until its handler notices and evicts it.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }
}

impl<W> fmt::Debug for Connection<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    /// The source address already holds a live connection.
    Duplicate(IpAddr),
    /// The server is shutting down.
    Closed,
}

impl AdmitError {
    /// Human-readable reason, sent to the peer inside the rejection frame.
    pub fn reason(&self) -> String {
        match self {
            Self::Duplicate(addr) => format!("IP {addr} is already connected"),
            Self::Closed => "server is shutting down".to_string(),
        }
    }
}

/// A refused admission. The writer is handed back so the caller can tell the
/// peer why before closing it.
pub struct Rejected<W> {
    pub error: AdmitError,
    pub writer: W,
}

impl<W> fmt::Debug for Rejected<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

pub struct Registry<W> {
    open: bool,
    admitted: HashSet<IpAddr>,
    connections: BTreeMap<ConnectionId, Connection<W>>,
}

impl<W> Registry<W> {
    pub fn new() -> Self {
        Self {
            open: true,
            admitted: HashSet::new(),
            connections: BTreeMap::new(),
        }
    }

    pub fn shared() -> SharedRegistry<W> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Admits `peer` unless its address is already present or the registry
    /// has been closed. Address and connection are recorded together.
    pub fn admit(
        &mut self,
        id: ConnectionId,
        peer: SocketAddr,
        writer: W,
    ) -> Result<(), Rejected<W>> {
        let addr = peer.ip();
        let error = if !self.open {
            Some(AdmitError::Closed)
        } else if self.admitted.contains(&addr) {
            Some(AdmitError::Duplicate(addr))
        } else {
            None
        };
        if let Some(error) = error {
            return Err(Rejected { error, writer });
        }

        debug_assert!(!self.connections.contains_key(&id), "connection id reused");
        self.admitted.insert(addr);
        self.connections.insert(
            id,
            Connection {
                id,
                peer,
                writer,
                closed: false,
            },
        );
        Ok(())
    }

    /// Removes the connection `id` and releases its address. Returns `None`
    /// when the entry is already gone, so teardown happens at most once.
    pub fn evict(&mut self, id: ConnectionId) -> Option<Connection<W>> {
        let connection = self.connections.remove(&id)?;
        self.admitted.remove(&connection.addr());
        Some(connection)
    }

    /// Refuses all further admissions and hands back every live connection.
    pub fn close(&mut self) -> Vec<Connection<W>> {
        self.open = false;
        self.admitted.clear();
        std::mem::take(&mut self.connections).into_values().collect()
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.admitted.contains(addr)
    }

    /// Admitted addresses in ascending order.
    pub fn admitted(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<_> = self.admitted.iter().copied().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Live connections in admission order.
    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection<W>> {
        self.connections.values_mut()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.admitted.len() == self.connections.len()
            && self
                .connections
                .values()
                .all(|connection| self.admitted.contains(&connection.addr()))
    }
}

impl<W> Default for Registry<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, last], port))
    }

    #[test]
    fn duplicate_address_is_rejected_with_writer_returned() {
        let mut registry = Registry::new();
        registry
            .admit(1, peer(2, 40000), "first")
            .expect("first admission should pass");

        let rejected = registry
            .admit(2, peer(2, 40001), "second")
            .expect_err("same address on another port must be rejected");

        assert_eq!(
            rejected.error,
            AdmitError::Duplicate(IpAddr::from([127, 0, 0, 2]))
        );
        assert_eq!(rejected.writer, "second");
        assert_eq!(rejected.error.reason(), "IP 127.0.0.2 is already connected");
        assert_eq!(registry.len(), 1);
        assert!(registry.is_consistent());
    }

    #[test]
    fn eviction_releases_address_once() {
        let mut registry = Registry::new();
        registry.admit(1, peer(2, 40000), ()).expect("admit a");
        registry.admit(2, peer(3, 40000), ()).expect("admit b");

        let evicted = registry.evict(1).expect("first eviction finds the entry");
        assert_eq!(evicted.addr(), IpAddr::from([127, 0, 0, 2]));
        assert!(registry.evict(1).is_none());
        assert!(!registry.contains(&IpAddr::from([127, 0, 0, 2])));
        assert!(registry.is_consistent());

        registry
            .admit(3, peer(2, 40002), ())
            .expect("address is reusable after eviction");
        assert_eq!(
            registry.admitted(),
            vec![IpAddr::from([127, 0, 0, 2]), IpAddr::from([127, 0, 0, 3])]
        );
    }

    #[test]
    fn close_drains_everything_and_refuses_new_peers() {
        let mut registry = Registry::new();
        registry.admit(1, peer(2, 40000), ()).expect("admit a");
        registry.admit(2, peer(3, 40000), ()).expect("admit b");

        let drained = registry.close();
        let ids: Vec<_> = drained.iter().map(Connection::id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(registry.is_empty());
        assert!(registry.admitted().is_empty());
        assert!(registry.evict(1).is_none());

        let rejected = registry
            .admit(3, peer(4, 40000), ())
            .expect_err("closed registry admits nobody");
        assert_eq!(rejected.error, AdmitError::Closed);
        assert!(registry.is_consistent());
    }
}
