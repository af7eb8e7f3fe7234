mod client;
mod peer;
mod request;
mod response;

pub use client::TrackerClient;
pub use peer::Peer;
pub use request::{TrackerEvent, TrackerRequest};
pub use response::TrackerResponse;

use rand::Rng;

/// Client identification prefix, Azureus-style
const PEER_ID_PREFIX: &[u8; 8] = b"-BF0001-";

/// Generate a random peer ID
/// Format: -BF0001-<12 random alphanumerics>
pub fn generate_peer_id() -> [u8; 20] {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = ALPHABET[rng.gen_range(0..ALPHABET.len())];
    }

    peer_id
}
