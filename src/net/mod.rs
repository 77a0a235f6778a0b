//! P2P networking layer (§4.4-§4.6, §6): gossip of content-addressed blocks
//! over a custom binary frame on top of plain TCP.

pub mod inventory;
pub mod manager;
pub mod message;
pub mod peerdb;
pub mod rate_limit;
pub mod session;
pub mod stats;

pub use inventory::Inventory;
pub use manager::{NetworkEvent, NetworkManager};
pub use message::{Message, MessageClass};
pub use peerdb::{PeerAddr, PeerDb, PeerSetKind};
pub use rate_limit::TokenBucket;
pub use session::{PeerSession, SessionHandle, SessionState};
pub use stats::SessionStats;
