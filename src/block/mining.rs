//! Hashcash nonce search (§4.2 Mining). A pure function of
//! `(buffer, nonce_offset, difficulty)`: given ownership of the buffer it
//! returns the mutated buffer once a valid nonce is found, yielding control
//! after every batch so the caller can interleave other work or cancel.

use crate::config::MINING_YIELD_BATCH;
use crate::crypto::{self, Keypair};

use super::codec::BLOCK_SIZE;
use super::types::FINGERPRINT_LEN;

/// Cooperative mining state. `step` advances at most one batch and reports
/// whether a solution was found, without ever blocking or looping
/// internally — callers (sync or async) own the loop and the yield point.
pub struct MiningSession {
    buf: [u8; BLOCK_SIZE],
    nonce_offset: usize,
    difficulty: u32,
    nonce: u32,
}

pub enum MiningStep {
    Found(Box<[u8; BLOCK_SIZE]>),
    Pending,
}

impl MiningSession {
    pub fn new(buf: [u8; BLOCK_SIZE], nonce_offset: usize, difficulty: u32) -> Self {
        Self {
            buf,
            nonce_offset,
            difficulty,
            nonce: 0,
        }
    }

    /// Tries up to `MINING_YIELD_BATCH` nonces, returning `Found` as soon as
    /// one satisfies the difficulty target.
    pub fn step(&mut self) -> MiningStep {
        for _ in 0..MINING_YIELD_BATCH {
            self.buf[self.nonce_offset..self.nonce_offset + 4]
                .copy_from_slice(&self.nonce.to_be_bytes());
            let digest = crypto::hash(&self.buf);
            if crypto::trailing_zero_bits(&digest) >= self.difficulty {
                return MiningStep::Found(Box::new(self.buf));
            }
            self.nonce = self.nonce.wrapping_add(1);
        }
        MiningStep::Pending
    }
}

/// Blocking convenience wrapper for tests and offline tooling: runs batches
/// until a solution is found. Production call sites (the store, the CLI)
/// should drive `MiningSession::step` directly so they can yield between
/// batches and honor cancellation.
pub fn mine_blocking(buf: [u8; BLOCK_SIZE], nonce_offset: usize, difficulty: u32) -> [u8; BLOCK_SIZE] {
    let mut session = MiningSession::new(buf, nonce_offset, difficulty);
    loop {
        if let MiningStep::Found(out) = session.step() {
            return *out;
        }
    }
}

/// Async wrapper: mines on the current task, yielding to the runtime
/// between batches so mining never starves other sessions (§5).
pub async fn mine_async(buf: [u8; BLOCK_SIZE], nonce_offset: usize, difficulty: u32) -> [u8; BLOCK_SIZE] {
    let mut session = MiningSession::new(buf, nonce_offset, difficulty);
    loop {
        match session.step() {
            MiningStep::Found(out) => return *out,
            MiningStep::Pending => tokio::task::yield_now().await,
        }
    }
}

/// Mutable-block mining: the `SIGNATURE` field's value depends on the final
/// nonce (it covers every byte up to and including the signature's own
/// header byte, and the nonce field precedes it), so nonce search and
/// signing must proceed together — each candidate nonce is signed before
/// its full-buffer digest is checked against the difficulty target.
pub fn mine_and_sign_blocking(
    mut buf: [u8; BLOCK_SIZE],
    nonce_offset: usize,
    sig_header_offset: usize,
    sig_value_offset: usize,
    difficulty: u32,
    keypair: &Keypair,
) -> [u8; BLOCK_SIZE] {
    let fingerprint = crypto::hash(&keypair.public_key());
    let mut nonce: u32 = 0;
    loop {
        for _ in 0..MINING_YIELD_BATCH {
            buf[nonce_offset..nonce_offset + 4].copy_from_slice(&nonce.to_be_bytes());
            let signature = keypair.sign(&buf[..=sig_header_offset]);
            buf[sig_value_offset..sig_value_offset + FINGERPRINT_LEN]
                .copy_from_slice(&fingerprint[..FINGERPRINT_LEN]);
            buf[sig_value_offset + FINGERPRINT_LEN..sig_value_offset + FINGERPRINT_LEN + 64]
                .copy_from_slice(&signature);

            let digest = crypto::hash(&buf);
            if crypto::trailing_zero_bits(&digest) >= difficulty {
                return buf;
            }
            nonce = nonce.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::codec::{encode, locate_nonce_offset};
    use crate::block::types::Field;
    use crate::config::REQUIRED_DIFFICULTY;
    use crate::crypto::trailing_zero_bits;

    #[test]
    fn mined_buffer_satisfies_difficulty_p2() {
        let buf = encode(0, &[]).unwrap();
        let offset = locate_nonce_offset(&buf).unwrap();
        let mined = mine_blocking(buf, offset, REQUIRED_DIFFICULTY);
        let digest = crypto::hash(&mined);
        assert!(trailing_zero_bits(&digest) >= REQUIRED_DIFFICULTY);
    }

    #[tokio::test]
    async fn async_mining_matches_blocking() {
        let buf = encode(0, &[Field::new(crate::block::types::FieldType::Payload, vec![1, 2, 3])]).unwrap();
        let offset = locate_nonce_offset(&buf).unwrap();
        let mined = mine_async(buf, offset, 8).await;
        assert!(trailing_zero_bits(&crypto::hash(&mined)) >= 8);
    }
}
