pub mod connection;
pub mod extension;
pub mod framing;
pub mod handshake;
pub mod http;
pub mod registry;
pub mod tcp_opt;
pub mod transport;
pub mod ws_client;
pub mod ws_server;
