//! PeerDB (§4.6): disjoint peer sets keyed by `(host, port)`, with
//! unverified→verified promotion on a successful session and terminal
//! blacklisting on protocol violation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

pub type PeerAddr = (String, u16);

/// Normalizes the host half of a `PeerAddr` so the same peer is never
/// tracked twice under different textual spellings (§3.3: the uniqueness
/// key is `(normalized_host, port)`, with IPv4-mapped IPv6 normalized to
/// IPv4). Hosts that aren't literal IP addresses (e.g. DNS names) pass
/// through unchanged.
fn normalize(addr: PeerAddr) -> PeerAddr {
    let (host, port) = addr;
    match host.parse::<IpAddr>() {
        Ok(ip) => (ip.to_canonical().to_string(), port),
        Err(_) => (host, port),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSetKind {
    Unverified,
    Verified,
    Blacklisted,
}

struct Inner {
    unverified: HashMap<PeerAddr, ()>,
    verified: HashMap<PeerAddr, ()>,
    blacklisted: HashMap<PeerAddr, ()>,
}

/// Guarded peer-address registry shared across the `NetworkManager` and its
/// sessions (§5: "PeerDB is similarly guarded").
pub struct PeerDb {
    inner: Mutex<Inner>,
    new_peer_tx: broadcast::Sender<PeerAddr>,
}

impl PeerDb {
    pub fn new() -> Self {
        let (new_peer_tx, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                unverified: HashMap::new(),
                verified: HashMap::new(),
                blacklisted: HashMap::new(),
            }),
            new_peer_tx,
        }
    }

    pub fn subscribe_new_peer(&self) -> broadcast::Receiver<PeerAddr> {
        self.new_peer_tx.subscribe()
    }

    /// Registers a candidate address. A peer already known in any set is a
    /// no-op. A genuinely new peer enters `unverified` and `newPeer` fires.
    pub fn add_candidate(&self, addr: PeerAddr) {
        let addr = normalize(addr);
        let mut inner = self.inner.lock().unwrap();
        if inner.unverified.contains_key(&addr)
            || inner.verified.contains_key(&addr)
            || inner.blacklisted.contains_key(&addr)
        {
            return;
        }
        inner.unverified.insert(addr.clone(), ());
        let _ = self.new_peer_tx.send(addr);
    }

    pub fn mark_verified(&self, addr: PeerAddr) {
        let addr = normalize(addr);
        let mut inner = self.inner.lock().unwrap();
        if inner.blacklisted.contains_key(&addr) {
            return;
        }
        inner.unverified.remove(&addr);
        inner.verified.insert(addr, ());
    }

    pub fn blacklist(&self, addr: PeerAddr) {
        let addr = normalize(addr);
        debug!(host = %addr.0, port = addr.1, "blacklisting peer");
        let mut inner = self.inner.lock().unwrap();
        inner.unverified.remove(&addr);
        inner.verified.remove(&addr);
        inner.blacklisted.insert(addr, ());
    }

    pub fn is_blacklisted(&self, addr: &PeerAddr) -> bool {
        let addr = normalize(addr.clone());
        self.inner.lock().unwrap().blacklisted.contains_key(&addr)
    }

    pub fn set(&self, kind: PeerSetKind) -> Vec<PeerAddr> {
        let inner = self.inner.lock().unwrap();
        match kind {
            PeerSetKind::Unverified => inner.unverified.keys().cloned().collect(),
            PeerSetKind::Verified => inner.verified.keys().cloned().collect(),
            PeerSetKind::Blacklisted => inner.blacklisted.keys().cloned().collect(),
        }
    }
}

impl Default for PeerDb {
    fn default() -> Self {
        Self::new()
    }
}
