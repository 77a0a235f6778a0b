//! HashEngine (spec §4.1): hashing, proof-of-work scoring, signatures, key
//! agreement and key derivation. Every component here is a pure function
//! over explicit inputs — no module-level keys or RNGs are held globally,
//! per spec §9's "no module-level state" redesign note.

use argon2::{Algorithm, Argon2, Params, Version};
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha3::{Digest, Sha3_256};
use thiserror::Error;

pub const HASH_SIZE: usize = 32;
pub type Hash = [u8; HASH_SIZE];

pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
pub const ED25519_SIGNATURE_SIZE: usize = 64;
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("key derivation failed")]
    Kdf,
}

/// SHA3-256 of `data` (§4.1 `hash`).
pub fn hash(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

/// Counts trailing zero bits of `digest`, scanning bytes from the last
/// toward the first and, within the first non-zero byte encountered,
/// counting from its least-significant bit (§3.1, §6.1). An all-zero
/// input of `N` bytes yields `8*N`.
pub fn trailing_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0u32;
    for &byte in digest.iter().rev() {
        if byte == 0 {
            bits += 8;
            continue;
        }
        bits += byte.trailing_zeros();
        return bits;
    }
    bits
}

/// Ed25519 keypair, held as an opaque owner of the secret scalar.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key(&self) -> [u8; ED25519_PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; ED25519_SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Ed25519 `sign` (§4.1): signs `message` with the 32-byte secret seed.
pub fn sign(secret: &[u8; 32], message: &[u8]) -> [u8; ED25519_SIGNATURE_SIZE] {
    Keypair::from_bytes(secret).sign(message)
}

/// Ed25519 `verify` (§4.1): returns `Ok(())` iff `signature` over `message`
/// is valid under `pubkey`.
pub fn verify(pubkey: &[u8; 32], signature: &[u8; 64], message: &[u8]) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    vk.verify(message, &sig)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Generates a fresh X25519 ephemeral keypair for a `KEY_DISTRIBUTION` field.
pub fn generate_x25519_keypair() -> (x25519_dalek::EphemeralSecret, [u8; X25519_PUBLIC_KEY_SIZE]) {
    let secret = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    (secret, public.to_bytes())
}

/// X25519 key agreement (§4.1): consumes our ephemeral secret and the
/// peer's public key to derive the shared secret carried by `SHARED_KEY`.
pub fn x25519_agree(
    our_secret: x25519_dalek::EphemeralSecret,
    their_public: &[u8; X25519_PUBLIC_KEY_SIZE],
) -> [u8; 32] {
    let their_public = x25519_dalek::PublicKey::from(*their_public);
    *our_secret.diffie_hellman(&their_public).as_bytes()
}

/// BLAKE2-style subkey derivation (§4.1 `kdf`), matching the scheme
/// libsodium's `crypto_kdf` pairs with X25519/XSalsa: a 32-byte master key,
/// a 64-bit subkey index, and a 16-byte ASCII context are all folded into
/// BLAKE2b's input.
pub fn kdf(master_key: &[u8; 32], index: u64, context: &[u8; 16]) -> Result<[u8; 32], CryptoError> {
    let mut hasher = Blake2bVar::new(32).map_err(|_| CryptoError::Kdf)?;
    hasher.update(context);
    hasher.update(&index.to_le_bytes());
    hasher.update(master_key);
    let mut out = [0u8; 32];
    hasher
        .finalize_variable(&mut out)
        .map_err(|_| CryptoError::Kdf)?;
    Ok(out)
}

/// Argon2id key derivation (§4.1 `argon2id`): fixed algorithm identifier,
/// caller-supplied cost parameters.
pub fn argon2id(password: &[u8], salt: &[u8], ops: u32, mem_kib: u32) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(mem_kib, ops, 1, Some(32)).map_err(|_| CryptoError::Kdf)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|_| CryptoError::Kdf)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_zero_bits_matches_vectors() {
        let mut digest = [0u8; 32];
        digest[31] = 0x01;
        assert_eq!(trailing_zero_bits(&digest), 0);
        digest[31] = 0x02;
        assert_eq!(trailing_zero_bits(&digest), 1);
        digest[31] = 0x04;
        assert_eq!(trailing_zero_bits(&digest), 2);
        digest[31] = 0x08;
        assert_eq!(trailing_zero_bits(&digest), 3);
        digest[31] = 0x10;
        assert_eq!(trailing_zero_bits(&digest), 4);
        digest[31] = 0x20;
        assert_eq!(trailing_zero_bits(&digest), 5);
    }

    #[test]
    fn trailing_zero_bits_all_zero_is_8n() {
        let digest = [0u8; 32];
        assert_eq!(trailing_zero_bits(&digest), 256);
        let small = [0u8; 4];
        assert_eq!(trailing_zero_bits(&small), 32);
    }

    #[test]
    fn trailing_zero_bits_scans_past_trailing_zero_bytes() {
        let mut digest = [0u8; 32];
        digest[30] = 0x04; // last byte (index 31) is zero, next is 0x04
        assert_eq!(trailing_zero_bits(&digest), 8 + 2);
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let kp = Keypair::generate();
        let msg = b"cube identity";
        let sig = kp.sign(msg);
        assert!(verify(&kp.public_key(), &sig, msg).is_ok());
        assert!(verify(&kp.public_key(), &sig, b"tampered").is_err());
    }

    #[test]
    fn x25519_agreement_is_symmetric() {
        let (secret_a, public_a) = generate_x25519_keypair();
        let (secret_b, public_b) = generate_x25519_keypair();
        let shared_a = x25519_agree(secret_a, &public_b);
        let shared_b = x25519_agree(secret_b, &public_a);
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn kdf_is_deterministic_and_context_separated() {
        let master = [7u8; 32];
        let a = kdf(&master, 1, b"cube_field_enc__").unwrap();
        let b = kdf(&master, 1, b"cube_field_enc__").unwrap();
        let c = kdf(&master, 2, b"cube_field_enc__").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn argon2id_derives_stable_seed() {
        let seed1 = argon2id(b"password", b"saltsaltsaltsalt", 2, 19 * 1024).unwrap();
        let seed2 = argon2id(b"password", b"saltsaltsaltsalt", 2, 19 * 1024).unwrap();
        assert_eq!(seed1, seed2);
    }
}
