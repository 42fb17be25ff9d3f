pub mod choker;
pub mod conn;
pub mod handshake;
pub mod list;

use rand::Rng;

pub use peer_proto::{Extensions, InfoHash, PeerId};

pub const CLIENT_VERSION: &str = "eb 0.1";

/// Azureus-style peer id: client tag plus random tail.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0; 20];
    id[..8].copy_from_slice(b"-EB0010-");
    rand::thread_rng().fill(&mut id[8..]);
    id
}
