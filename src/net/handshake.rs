//! Pieces shared by both sides of the opening handshake.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::digest;

use crate::error::{HandshakeError, Result};
use crate::net::extension::parse_tokens;
use crate::net::framing::random_bytes;
use crate::net::http::Headers;

/// Concatenated with the client key before hashing (RFC 6455 section 1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const CONNECTION: &str = "Connection";
pub const UPGRADE: &str = "Upgrade";
pub const HOST: &str = "Host";
pub const ORIGIN: &str = "Origin";
pub const AUTHORIZATION: &str = "Authorization";
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
pub const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
pub const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// `base64(SHA-1(key + GUID))`.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(client_key.as_bytes());
    ctx.update(WS_GUID.as_bytes());
    BASE64.encode(ctx.finish())
}

/// Fresh base64 encoded 16 byte nonce for `Sec-WebSocket-Key`.
pub fn generate_key() -> Result<String> {
    Ok(BASE64.encode(random_bytes::<16>()?))
}

/// A key is valid when it base64-decodes to exactly 16 bytes.
pub fn is_valid_key(key: &str) -> bool {
    matches!(BASE64.decode(key), Ok(raw) if raw.len() == 16)
}

pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
}

/// Checks `Connection` lists `upgrade` and `Upgrade` is exactly `websocket`.
pub(crate) fn check_upgrade_headers(headers: &Headers) -> std::result::Result<(), HandshakeError> {
    let connections: Vec<&str> = headers.get_all(CONNECTION).flat_map(parse_tokens).collect();
    if !connections.iter().any(|c| c.eq_ignore_ascii_case("upgrade")) {
        return Err(HandshakeError::InvalidUpgrade(format!(
            "no upgrade in Connection header, got {connections:?}"
        )));
    }

    let upgrades: Vec<&str> = headers.get_all(UPGRADE).flat_map(parse_tokens).collect();
    if upgrades.len() != 1 || !upgrades[0].eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::InvalidUpgrade(format!(
            "expected websocket in Upgrade header, got {upgrades:?}"
        )));
    }
    Ok(())
}

/// The single value of a header that must not repeat.
pub(crate) fn single_header<'a>(
    headers: &'a Headers,
    name: &'static str,
) -> std::result::Result<&'a str, HandshakeError> {
    let mut values = headers.get_all(name);
    let first = values.next().ok_or(HandshakeError::MissingHeader(name))?;
    if values.next().is_some() {
        return Err(HandshakeError::InvalidHeader { name, value: "multiple values".to_string() });
    }
    Ok(first)
}
