//! P2P Networking
//!
//! Uses libp2p to carry the session directory, join handshakes and channel
//! frames between devices on the local network.

mod behaviour;
mod session_code;
mod transport;
mod wire;

pub use behaviour::{NetworkConfig, NetworkError, NetworkHandle, NetworkManager};
pub use session_code::SessionCode;
pub use transport::P2pTransport;
