//! BlockStore (§4.3): a content-addressed map keyed by block identity, with
//! deduplication, change notification, mutable-block conflict resolution
//! and lifetime-based eviction. Persisted in `sled` (teacher's own storage
//! dependency) so a node's holdings survive a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::block::{self, lifetime_days, BLOCK_SIZE};
use crate::config::Settings;
use crate::error::BlockError;

/// Backlog depth for the `added` notification channel. Sessions that lag
/// behind this many insertions miss events and must resync from a fresh
/// `all_identities()` snapshot — acceptable under §5's no-guaranteed-
/// delivery model.
pub const ADDED_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// First successful insertion under this identity; `added` was emitted.
    Inserted([u8; 32]),
    /// The buffer was already present, or a mutable block lost its
    /// conflict-resolution tie-break.
    Duplicate([u8; 32]),
    /// A mutable block (§4.3) replaced an older version under the same
    /// identity. No `added` event fires — the identity isn't new.
    Replaced([u8; 32]),
}

#[derive(Clone, Copy)]
struct Meta {
    date: u64,
    difficulty: u32,
}

pub struct BlockStore {
    settings: Arc<Settings>,
    tree: sled::Tree,
    meta: RwLock<HashMap<[u8; 32], Meta>>,
    write_lock: Mutex<()>,
    added_tx: broadcast::Sender<[u8; 32]>,
    identities_cache: RwLock<Option<Arc<Vec<[u8; 32]>>>>,
}

impl BlockStore {
    /// Opens (or creates) the `blocks` tree in `db` and rebuilds the
    /// in-memory metadata index from whatever was persisted.
    pub fn open(db: &sled::Db, settings: Arc<Settings>) -> sled::Result<Self> {
        let tree = db.open_tree("blocks")?;
        let mut meta = HashMap::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            // Difficulty 0 skips the PoW re-check: entries were already
            // admitted once, and a later config change must not evict them
            // just because the buffer is being re-parsed.
            if let Ok(parsed) = block::decode(&value, 0) {
                if let Ok(identity) = key.as_ref().try_into() {
                    meta.insert(
                        identity,
                        Meta {
                            date: parsed.date,
                            difficulty: crate::crypto::trailing_zero_bits(&crate::crypto::hash(&value)),
                        },
                    );
                }
            } else {
                warn!("dropping unparseable persisted block during store open");
            }
        }
        let (added_tx, _) = broadcast::channel(ADDED_CHANNEL_CAPACITY);
        Ok(Self {
            settings,
            tree,
            meta: RwLock::new(meta),
            write_lock: Mutex::new(()),
            added_tx,
            identities_cache: RwLock::new(None),
        })
    }

    pub fn subscribe_added(&self) -> broadcast::Receiver<[u8; 32]> {
        self.added_tx.subscribe()
    }

    /// `add` (§4.3): decodes and validates `buf`, then admits it under its
    /// identity. Codec/integrity failures propagate as `Err`; the store is
    /// left unchanged in that case.
    pub fn add(&self, buf: &[u8]) -> Result<AddOutcome, BlockError> {
        let parsed = block::decode(buf, self.settings.required_difficulty)?;
        let identity = parsed.identity();
        let key = identity.bytes();
        let digest = crate::crypto::hash(buf);
        let difficulty = crate::crypto::trailing_zero_bits(&digest);

        let _guard = self.write_lock.lock().unwrap();

        let existing_meta = { self.meta.read().unwrap().get(&key).copied() };
        match existing_meta {
            None => {
                self.persist(&key, buf, parsed.date, difficulty);
                self.invalidate_cache();
                let _ = self.added_tx.send(key);
                trace!(identity = %hex::encode(key), "block inserted");
                Ok(AddOutcome::Inserted(key))
            }
            Some(existing) => {
                if !parsed.is_mutable() {
                    // Immutable identity already present: by construction
                    // the buffer is byte-identical (identity is its hash).
                    Ok(AddOutcome::Duplicate(key))
                } else {
                    let existing_buf = self
                        .tree
                        .get(key)
                        .ok()
                        .flatten()
                        .expect("meta entry implies a persisted buffer");
                    let existing_digest = crate::crypto::hash(existing_buf.as_ref());
                    let new_wins = match parsed.date.cmp(&existing.date) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => digest > existing_digest,
                    };
                    if new_wins {
                        self.persist(&key, buf, parsed.date, difficulty);
                        self.invalidate_cache();
                        debug!(identity = %hex::encode(key), "mutable block replaced");
                        Ok(AddOutcome::Replaced(key))
                    } else {
                        debug!(identity = %hex::encode(key), "mutable block conflict lost, dropping");
                        Ok(AddOutcome::Duplicate(key))
                    }
                }
            }
        }
    }

    fn persist(&self, key: &[u8; 32], buf: &[u8], date: u64, difficulty: u32) {
        self.tree.insert(key, buf).expect("sled insert failed");
        self.meta.write().unwrap().insert(*key, Meta { date, difficulty });
    }

    pub fn get(&self, identity: &[u8; 32]) -> Option<[u8; BLOCK_SIZE]> {
        let raw = self.tree.get(identity).ok().flatten()?;
        raw.as_ref().try_into().ok()
    }

    pub fn get_decoded(&self, identity: &[u8; 32]) -> Option<block::ParsedBlock> {
        let raw = self.get(identity)?;
        block::decode(&raw, 0).ok()
    }

    pub fn has(&self, identity: &[u8; 32]) -> bool {
        self.meta.read().unwrap().contains_key(identity)
    }

    /// Lazy, cached snapshot of every identity currently admitted;
    /// invalidated on every successful insertion (§4.3).
    pub fn all_identities(&self) -> Arc<Vec<[u8; 32]>> {
        if let Some(cached) = self.identities_cache.read().unwrap().clone() {
            return cached;
        }
        let snapshot = Arc::new(self.meta.read().unwrap().keys().copied().collect::<Vec<_>>());
        *self.identities_cache.write().unwrap() = Some(snapshot.clone());
        snapshot
    }

    fn invalidate_cache(&self) {
        *self.identities_cache.write().unwrap() = None;
    }

    /// Removes `identity` outright. Not exposed to peers; only the
    /// eviction sweep calls this.
    fn delete(&self, identity: &[u8; 32]) {
        let _guard = self.write_lock.lock().unwrap();
        self.tree.remove(identity).ok();
        self.meta.write().unwrap().remove(identity);
        self.invalidate_cache();
    }

    /// Scans every entry and deletes those whose lifetime (derived from
    /// their mined difficulty) has elapsed relative to `now_unix_secs`.
    /// Readers never observe a partially-written buffer: `delete` only
    /// removes, it never mutates a stored value in place.
    pub fn evict_expired(&self, now_unix_secs: u64) -> usize {
        let expired: Vec<[u8; 32]> = {
            let meta = self.meta.read().unwrap();
            meta.iter()
                .filter_map(|(identity, m)| {
                    let lifetime_secs = (lifetime_days(&self.settings, m.difficulty) * 86_400.0).max(0.0);
                    let age_secs = now_unix_secs.saturating_sub(m.date) as f64;
                    (age_secs > lifetime_secs).then_some(*identity)
                })
                .collect()
        };
        for identity in &expired {
            self.delete(identity);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{encode, locate_nonce_offset, mine_blocking, Field, FieldType};
    use crate::config::REQUIRED_DIFFICULTY;

    fn test_store() -> (tempfile::TempDir, BlockStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = BlockStore::open(&db, Arc::new(Settings::default())).unwrap();
        (dir, store)
    }

    fn mined_immutable(payload: &[u8], date: u64) -> [u8; BLOCK_SIZE] {
        let buf = encode(date, &[Field::new(FieldType::Payload, payload.to_vec())]).unwrap();
        let offset = locate_nonce_offset(&buf).unwrap();
        mine_blocking(buf, offset, REQUIRED_DIFFICULTY)
    }

    #[test]
    fn add_then_has_then_get_round_trips() {
        let (_dir, store) = test_store();
        let buf = mined_immutable(b"hello", 10);
        let outcome = store.add(&buf).unwrap();
        let identity = match outcome {
            AddOutcome::Inserted(id) => id,
            _ => panic!("expected insertion"),
        };
        assert!(store.has(&identity));
        assert_eq!(store.get(&identity).unwrap(), buf);
    }

    #[test]
    fn duplicate_insert_is_a_silent_no_op() {
        let (_dir, store) = test_store();
        let buf = mined_immutable(b"same", 10);
        assert!(matches!(store.add(&buf).unwrap(), AddOutcome::Inserted(_)));
        assert!(matches!(store.add(&buf).unwrap(), AddOutcome::Duplicate(_)));
    }

    #[test]
    fn all_identities_reflects_every_insertion_p3() {
        let (_dir, store) = test_store();
        let mut expected = std::collections::HashSet::new();
        for i in 0..10u64 {
            let buf = mined_immutable(format!("block-{i}").as_bytes(), i);
            if let AddOutcome::Inserted(id) = store.add(&buf).unwrap() {
                expected.insert(id);
            }
        }
        let actual: std::collections::HashSet<_> = store.all_identities().iter().copied().collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn invalid_block_is_rejected_and_store_unchanged() {
        let (_dir, store) = test_store();
        let err = store.add(&[0u8; BLOCK_SIZE]);
        assert!(err.is_err());
        assert_eq!(store.all_identities().len(), 0);
    }

    #[test]
    fn mutable_conflict_prefers_greater_date_scenario_6() {
        use crate::block::{locate_signature, mine_and_sign_blocking, SpecialVariant, SIGNATURE_FIELD_LEN};
        use crate::crypto::Keypair;

        let (_dir, store) = test_store();
        let keypair = Keypair::generate();

        let build = |date: u64, payload: &[u8]| {
            let fields = vec![
                Field::new(FieldType::SpecialBlock, vec![SpecialVariant::Mutable.to_byte()]),
                Field::new(FieldType::PublicKey, keypair.public_key().to_vec()),
                Field::new(FieldType::Payload, payload.to_vec()),
                Field::new(FieldType::Signature, vec![0u8; SIGNATURE_FIELD_LEN]),
            ];
            let buf = encode(date, &fields).unwrap();
            let nonce_offset = locate_nonce_offset(&buf).unwrap();
            let (sig_header, sig_value) = locate_signature(&buf).unwrap();
            mine_and_sign_blocking(buf, nonce_offset, sig_header, sig_value, REQUIRED_DIFFICULTY, &keypair)
        };

        let older = build(100, b"first version");
        let newer = build(200, b"second version");

        store.add(&older).unwrap();
        store.add(&newer).unwrap();

        let identity = crate::block::Identity::Mutable(keypair.public_key()).bytes();
        let stored = store.get_decoded(&identity).unwrap();
        assert_eq!(stored.field(FieldType::Payload).unwrap().value, b"second version");

        // A stale, older-dated resubmission must not overwrite the winner.
        store.add(&older).unwrap();
        let still_stored = store.get_decoded(&identity).unwrap();
        assert_eq!(still_stored.field(FieldType::Payload).unwrap().value, b"second version");
    }

    #[test]
    fn eviction_removes_blocks_past_their_lifetime() {
        let (_dir, store) = test_store();
        let buf = mined_immutable(b"old news", 0);
        let AddOutcome::Inserted(identity) = store.add(&buf).unwrap() else {
            panic!("expected insertion");
        };
        let far_future = u64::MAX / 2;
        let evicted = store.evict_expired(far_future);
        assert_eq!(evicted, 1);
        assert!(!store.has(&identity));
    }

    #[test]
    fn added_notification_fires_once_per_new_identity() {
        let (_dir, store) = test_store();
        let mut rx = store.subscribe_added();
        let buf = mined_immutable(b"notify me", 1);
        let AddOutcome::Inserted(identity) = store.add(&buf).unwrap() else {
            panic!("expected insertion");
        };
        let received = rx.try_recv().unwrap();
        assert_eq!(received, identity);
        store.add(&buf).unwrap(); // duplicate, no second notification
        assert!(rx.try_recv().is_err());
    }
}
