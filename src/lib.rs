//! WebSocket (RFC 6455) engine on tokio: frame codec, connection state
//! machine, client and server opening handshakes, and a listening server that
//! tracks its live connections.

pub mod config;
pub mod error;
pub mod net;

pub use config::Config;
pub use error::{Error, HandshakeError, Result};
pub use net::connection::{Message, State, WebSocket};
pub use net::extension::Extension;
pub use net::framing::{Frame, Opcode, Role};
pub use net::http::{Headers, RequestHead};
pub use net::registry::Server;
pub use net::transport::Transport;
pub use net::ws_client::{connect, ClientHandshake};
pub use net::ws_server::{EarlyResponse, ServerHandshake};
