//! Per-session tx/rx statistics keyed by message class (§4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::message::MessageClass;

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassCounters {
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Direction {
    pub total_packets: u64,
    pub total_bytes: u64,
    per_class: HashMap<u8, ClassCounters>,
}

impl Direction {
    fn record(&mut self, class: MessageClass, bytes: u64) {
        self.total_packets += 1;
        self.total_bytes += bytes;
        let entry = self.per_class.entry(class.code()).or_default();
        entry.count += 1;
        entry.bytes += bytes;
    }

    pub fn per_class(&self, class: MessageClass) -> ClassCounters {
        self.per_class.get(&class.code()).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub tx: Direction,
    pub rx: Direction,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, class: MessageClass, bytes: u64) {
        self.tx.record(class, bytes);
    }

    pub fn record_received(&mut self, class: MessageClass, bytes: u64) {
        self.rx.record(class, bytes);
    }
}

/// A queryable handle onto a running session's statistics: the session
/// writes through this while it runs, and `NetworkManager` keeps a clone
/// so callers outside the session task (e.g. an operator status surface)
/// can read a live snapshot without synchronizing with the session loop.
#[derive(Clone, Default)]
pub struct SharedSessionStats(Arc<Mutex<SessionStats>>);

impl SharedSessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, class: MessageClass, bytes: u64) {
        self.0.lock().unwrap().record_sent(class, bytes);
    }

    pub fn record_received(&self, class: MessageClass, bytes: u64) {
        self.0.lock().unwrap().record_received(class, bytes);
    }

    pub fn snapshot(&self) -> SessionStats {
        self.0.lock().unwrap().clone()
    }
}
