//! The block/cube subsystem (§3.1, §4.2): wire layout, proof-of-work
//! mining, and the lifetime function used by the store.

pub mod codec;
pub mod lifetime;
pub mod mining;
pub mod types;

pub use codec::{decode, encode, locate_nonce_offset, locate_signature, BLOCK_SIZE};
pub use lifetime::lifetime_days;
pub use mining::{mine_and_sign_blocking, mine_async, mine_blocking, MiningSession, MiningStep};
pub use types::{Field, FieldType, Identity, LocatedField, ParsedBlock, SpecialVariant, SIGNATURE_FIELD_LEN};
