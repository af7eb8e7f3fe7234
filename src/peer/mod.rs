mod bitfield;
mod connection;
mod message;
mod protocol;
mod session;

pub use bitfield::Bitfield;
pub use connection::{PeerConnection, SessionTimeouts};
pub use message::{BlockRequest, PeerMessage, MAX_FRAME_LEN};
pub use protocol::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use session::{
    ConnectionState, SessionCommand, SessionContext, SessionEvent, SessionHandle,
};
