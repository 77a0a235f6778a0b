//! NetworkManager (§4.5): accepts and dials peer connections, enforces the
//! connection-count ceiling, and wires each session to the shared store and
//! PeerDB.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};

use super::message::Message;
use super::peerdb::{PeerAddr, PeerDb, PeerSetKind};
use super::session::{CloseReason, PeerSession, SessionHandle};
use crate::config::PEER_ID_SIZE;
use crate::store::BlockStore;

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Online,
    Shutdown,
    PeerBlacklisted(PeerAddr),
}

/// Exponential dial backoff per candidate: a peer that just failed isn't
/// retried again until `backoff` has elapsed, doubling on each further
/// failure up to `MAX_BACKOFF`.
struct RetryInfo {
    attempts: u32,
    retry_after: Instant,
}

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub struct NetworkManager {
    settings: Arc<crate::config::Settings>,
    store: Arc<BlockStore>,
    peerdb: Arc<PeerDb>,
    local_peer_id: [u8; PEER_ID_SIZE],
    sessions: Mutex<Vec<SessionHandle>>,
    retry: Mutex<HashMap<PeerAddr, RetryInfo>>,
    events_tx: broadcast::Sender<NetworkEvent>,
    went_online: AtomicBool,
}

impl NetworkManager {
    pub fn new(settings: Arc<crate::config::Settings>, store: Arc<BlockStore>, peerdb: Arc<PeerDb>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let mut local_peer_id = [0u8; PEER_ID_SIZE];
        rand::thread_rng().fill(&mut local_peer_id);
        Self {
            settings,
            store,
            peerdb,
            local_peer_id,
            sessions: Mutex::new(Vec::new()),
            retry: Mutex::new(HashMap::new()),
            events_tx,
            went_online: AtomicBool::new(false),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events_tx.subscribe()
    }

    pub fn local_peer_id(&self) -> [u8; PEER_ID_SIZE] {
        self.local_peer_id
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn mark_online(&self) {
        if !self.went_online.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(NetworkEvent::Online);
        }
    }

    /// Accepts inbound connections on `settings.listen_port` until the
    /// listener task is aborted by the caller (see `shutdown()`'s doc note).
    /// A light client (`settings.listen == false`) never calls this.
    pub async fn listen(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.settings.listen_port)).await?;
        info!(port = self.settings.listen_port, "listening for inbound peers");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let addr: PeerAddr = (peer_addr.ip().to_string(), peer_addr.port());
            if self.peerdb.is_blacklisted(&addr) {
                continue;
            }
            self.peerdb.add_candidate(addr.clone());
            self.spawn_session(stream, addr, true).await;
        }
    }

    /// Dials `host:port` with the configured handshake timeout. On success
    /// the address is marked verified in `PeerDB` and a session is spawned.
    pub async fn dial(self: &Arc<Self>, host: &str, port: u16) -> Result<(), crate::error::TransportError> {
        use crate::error::{TransportError, TransportErrorKind};
        let addr: PeerAddr = (host.to_string(), port);
        if self.peerdb.is_blacklisted(&addr) {
            return Err(TransportError::new(TransportErrorKind::Closed));
        }
        let connect = TcpStream::connect((host, port));
        let stream = tokio::time::timeout(self.settings.handshake_timeout(), connect)
            .await
            .map_err(|_| TransportError::new(TransportErrorKind::HandshakeTimeout))?
            .map_err(|_| TransportError::new(TransportErrorKind::Closed))?;
        self.peerdb.mark_verified(addr.clone());
        self.retry.lock().await.remove(&addr);
        self.spawn_session(stream, addr, false).await;
        Ok(())
    }

    /// Records a failed dial attempt, doubling that candidate's backoff.
    async fn record_dial_failure(&self, addr: &PeerAddr) {
        let mut retry = self.retry.lock().await;
        let attempts = retry.get(addr).map_or(0, |r| r.attempts) + 1;
        let backoff = (BASE_BACKOFF * 2u32.saturating_pow(attempts - 1)).min(MAX_BACKOFF);
        retry.insert(addr.clone(), RetryInfo { attempts, retry_after: Instant::now() + backoff });
    }

    /// First unverified candidate whose backoff window (if any) has passed.
    async fn next_dial_candidate(&self) -> Option<PeerAddr> {
        let candidates = self.peerdb.set(super::peerdb::PeerSetKind::Unverified);
        let retry = self.retry.lock().await;
        let now = Instant::now();
        candidates
            .into_iter()
            .find(|addr| retry.get(addr).is_none_or(|r| r.retry_after <= now))
    }

    async fn spawn_session(self: &Arc<Self>, stream: TcpStream, addr: PeerAddr, inbound: bool) {
        let added_rx = self.store.subscribe_added();
        let store = Arc::clone(&self.store);
        let peerdb = Arc::clone(&self.peerdb);
        let local_peer_id = self.local_peer_id;
        let light = !self.settings.listen;
        let hash_request_interval = self.settings.hash_request_interval();
        let session = PeerSession::new(stream, local_peer_id, store, peerdb, light, hash_request_interval);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let handle = SessionHandle {
            addr: addr.clone(),
            inbound,
            shutdown_tx,
            outbound_tx,
            stats: session.shared_stats(),
        };
        self.sessions.lock().await.push(handle);
        self.mark_online();

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let (_, reason) = session.run(added_rx, shutdown_rx, outbound_rx).await;
            manager.on_session_closed(&addr, reason).await;
        });
    }

    /// Live per-peer statistics snapshot, queryable from outside the
    /// sessions' own tasks (§4.4 Statistics).
    pub async fn peer_stats(&self) -> Vec<(PeerAddr, super::stats::SessionStats)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|h| (h.addr.clone(), h.stats.snapshot()))
            .collect()
    }

    async fn on_session_closed(&self, addr: &PeerAddr, reason: Option<CloseReason>) {
        if matches!(reason, Some(CloseReason::SelfConnection)) {
            self.peerdb.blacklist(addr.clone());
            let _ = self.events_tx.send(NetworkEvent::PeerBlacklisted(addr.clone()));
        }
        self.sessions.lock().await.retain(|h| &h.addr != addr);
    }

    /// Periodically tops up connections from PeerDB's unverified set while
    /// below `max_connections`, with a small randomized delay between
    /// dial attempts to avoid load spikes (§4.5).
    pub async fn maintain_connections(self: Arc<Self>) {
        loop {
            let below_limit = self.connection_count().await < self.settings.max_connections;
            if below_limit {
                if let Some((host, port)) = self.next_dial_candidate().await {
                    if self.dial(&host, port).await.is_err() {
                        warn!(%host, port, "dial attempt failed");
                        self.record_dial_failure(&(host, port)).await;
                    }
                }
            }
            let jitter_ms = rand::thread_rng().gen_range(500..=2500);
            tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
        }
    }

    /// Periodically pushes a `NodeBroadcast` of known peers to every
    /// connected session (§4.6: "PeerDB periodically announces known peers
    /// to connected sessions").
    pub async fn announce_peers(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.announcement_interval());
        ticker.tick().await; // first tick fires immediately; consume it
        loop {
            ticker.tick().await;
            let addrs: Vec<String> = self
                .peerdb
                .set(PeerSetKind::Verified)
                .into_iter()
                .chain(self.peerdb.set(PeerSetKind::Unverified))
                .map(|(host, port)| format!("{host}:{port}"))
                .collect();
            if addrs.is_empty() {
                continue;
            }
            let sessions = self.sessions.lock().await;
            for handle in sessions.iter() {
                handle.send(Message::NodeBroadcast { addrs: addrs.clone() }).await;
            }
        }
    }

    /// Terminates every tracked session and emits `shutdown`. The listener
    /// itself is an external task the caller owns (from `listen()`) and
    /// should abort alongside this call.
    pub async fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.sessions.lock().await);
        for handle in &handles {
            handle.shutdown().await;
        }
        let _ = self.events_tx.send(NetworkEvent::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn test_store() -> (tempfile::TempDir, Arc<BlockStore>) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = BlockStore::open(&db, Arc::new(Settings::default())).unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn accept_and_dial_both_register_a_session() {
        let (_dir_a, store_a) = test_store();
        let (_dir_b, store_b) = test_store();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let bound_port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings_a = Arc::new(Settings { listen_port: bound_port, ..Settings::default() });
        let manager_a = Arc::new(NetworkManager::new(settings_a, store_a, Arc::new(PeerDb::new())));
        let listen_manager = Arc::clone(&manager_a);
        tokio::spawn(async move {
            let _ = listen_manager.listen().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let settings_b = Arc::new(Settings::default());
        let manager_b = Arc::new(NetworkManager::new(settings_b, store_b, Arc::new(PeerDb::new())));
        manager_b.dial("127.0.0.1", bound_port).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(manager_a.connection_count().await, 1);
        assert_eq!(manager_b.connection_count().await, 1);

        let stats = manager_a.peer_stats().await;
        assert_eq!(stats.len(), 1);
        assert!(stats[0].1.tx.total_packets >= 1, "the Hello handshake should have been recorded");
    }

    #[tokio::test]
    async fn failed_dial_backs_off_and_skips_candidate_on_next_pick() {
        let (_dir, store) = test_store();
        let manager = Arc::new(NetworkManager::new(Arc::new(Settings::default()), store, Arc::new(PeerDb::new())));
        let addr: PeerAddr = ("127.0.0.1".to_string(), 1); // nothing listens on port 1
        manager.peerdb.add_candidate(addr.clone());

        assert_eq!(manager.next_dial_candidate().await, Some(addr.clone()));
        assert!(manager.dial(&addr.0, addr.1).await.is_err());
        manager.record_dial_failure(&addr).await;

        assert_eq!(manager.next_dial_candidate().await, None, "backed-off candidate must not be picked again immediately");
    }

    #[tokio::test]
    async fn announce_peers_pushes_node_broadcast_to_connected_sessions() {
        let (_dir_a, store_a) = test_store();
        let (_dir_b, store_b) = test_store();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let bound_port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings_a = Arc::new(Settings {
            listen_port: bound_port,
            announcement_interval_secs: 1,
            ..Settings::default()
        });
        let manager_a = Arc::new(NetworkManager::new(settings_a, store_a, Arc::new(PeerDb::new())));
        manager_a.peerdb.add_candidate(("203.0.113.7".to_string(), 9000));
        let listen_manager = Arc::clone(&manager_a);
        tokio::spawn(async move {
            let _ = listen_manager.listen().await;
        });
        tokio::spawn(Arc::clone(&manager_a).announce_peers());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let settings_b = Arc::new(Settings::default());
        let manager_b = Arc::new(NetworkManager::new(settings_b, store_b, Arc::new(PeerDb::new())));
        manager_b.dial("127.0.0.1", bound_port).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(
            manager_b.peerdb.set(super::super::peerdb::PeerSetKind::Unverified).contains(&("203.0.113.7".to_string(), 9000)),
            "dialer should have learned the listener's announced peer"
        );
    }

    #[tokio::test]
    async fn shutdown_emits_event_and_clears_sessions() {
        let (_dir, store) = test_store();
        let manager = NetworkManager::new(Arc::new(Settings::default()), store, Arc::new(PeerDb::new()));
        let mut events = manager.subscribe_events();
        manager.shutdown().await;
        assert!(matches!(events.try_recv().unwrap(), NetworkEvent::Shutdown));
        assert_eq!(manager.connection_count().await, 0);
    }
}
