use std::sync::Arc;

use log::debug;

use crate::config::Config;
use crate::error::{HandshakeError, Result};
use crate::net::connection::WebSocket;
use crate::net::extension::{build_extensions, parse_extensions, parse_tokens, Extension, ExtensionParam};
use crate::net::framing::Role;
use crate::net::handshake::{
    basic_auth, check_upgrade_headers, compute_accept_key, generate_key, single_header, AUTHORIZATION,
    CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use crate::net::http::{self, Headers, ResponseHead};
use crate::net::tcp_opt;
use crate::net::transport::Transport;

/// Opening handshake for the initiating side.
///
/// ```no_run
/// # async fn run() -> ws_engine::Result<()> {
/// let ws = ws_engine::ClientHandshake::new("localhost", 9001).path("/chat").connect().await?;
/// ws.send("hello").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    host: String,
    port: u16,
    path: String,
    secure: bool,
    origin: Option<String>,
    extensions: Vec<Arc<dyn Extension>>,
    subprotocols: Vec<String>,
    extra_headers: Headers,
    credentials: Option<(String, String)>,
    config: Config,
}

impl ClientHandshake {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".to_string(),
            secure: false,
            origin: None,
            extensions: Vec::new(),
            subprotocols: Vec::new(),
            extra_headers: Headers::new(),
            credentials: None,
            config: Config::default(),
        }
    }

    /// Request target, including any query string.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Marks the transport as TLS wrapped, which only changes the default port in `Host`.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Offers an extension. Offers go out in the order they were added.
    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.append(name, value);
        self
    }

    /// Sends `Authorization: Basic` with these credentials.
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    fn host_header(&self) -> String {
        let host = if self.host.contains(':') { format!("[{}]", self.host) } else { self.host.clone() };
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            let mut port = itoa::Buffer::new();
            format!("{host}:{}", port.format(self.port))
        }
    }

    pub(crate) fn request_headers(&self, key: &str) -> Headers {
        let mut headers = Headers::new();
        headers.append(HOST, self.host_header());
        headers.append(UPGRADE, "websocket");
        headers.append(CONNECTION, "Upgrade");
        headers.append(SEC_WEBSOCKET_KEY, key);
        headers.append(SEC_WEBSOCKET_VERSION, "13");

        if let Some((user, password)) = &self.credentials {
            headers.append(AUTHORIZATION, basic_auth(user, password));
        }
        if let Some(origin) = &self.origin {
            headers.append(ORIGIN, origin.as_str());
        }
        if !self.extensions.is_empty() {
            let offers: Vec<(String, Vec<ExtensionParam>)> =
                self.extensions.iter().map(|e| (e.name().to_string(), e.params())).collect();
            headers.append(
                SEC_WEBSOCKET_EXTENSIONS,
                build_extensions(offers.iter().map(|(name, params)| (name.as_str(), params.as_slice()))),
            );
        }
        if !self.subprotocols.is_empty() {
            headers.append(SEC_WEBSOCKET_PROTOCOL, self.subprotocols.join(", "));
        }
        for (name, value) in self.extra_headers.iter() {
            headers.append(name, value);
        }
        headers
    }

    /// Opens a TCP connection to `host:port` and runs the handshake over it.
    pub async fn connect(&self) -> Result<WebSocket> {
        let stream = tcp_opt::connect((self.host.as_str(), self.port)).await?;
        self.handshake(stream).await
    }

    /// Runs the handshake over an already connected transport.
    pub async fn handshake<T: Transport>(&self, mut transport: T) -> Result<WebSocket> {
        let key = generate_key()?;
        let headers = self.request_headers(&key);
        debug!("client handshake: GET {} ({} headers)", self.path, headers.len());
        http::write_request(&mut transport, &self.path, &headers).await?;

        let (response, leftover) = http::read_response_head(&mut transport).await?;
        debug!("client handshake: {} {}", response.status, response.reason);
        let (extensions, subprotocol) = self.check_response(&response, &key)?;

        Ok(WebSocket::open(transport, Role::Client, self.config.clone(), leftover, extensions, subprotocol))
    }

    /// Validates the server's answer and returns the negotiated extensions
    /// and subprotocol.
    pub(crate) fn check_response(
        &self,
        response: &ResponseHead,
        key: &str,
    ) -> std::result::Result<(Vec<Arc<dyn Extension>>, Option<String>), HandshakeError> {
        if response.version != 1 {
            return Err(HandshakeError::Http(format!("unsupported HTTP version 1.{}", response.version)));
        }
        if response.status != 101 {
            return Err(HandshakeError::InvalidStatus(response.status));
        }
        let headers = &response.headers;
        check_upgrade_headers(headers)?;

        let accept = single_header(headers, SEC_WEBSOCKET_ACCEPT)?;
        let expected = compute_accept_key(key);
        if accept != expected {
            return Err(HandshakeError::InvalidAccept { expected, actual: accept.to_string() });
        }

        let extensions = self.accepted_extensions(headers)?;
        let subprotocol = self.accepted_subprotocol(headers)?;
        Ok((extensions, subprotocol))
    }

    fn accepted_extensions(&self, headers: &Headers) -> std::result::Result<Vec<Arc<dyn Extension>>, HandshakeError> {
        let selected: Vec<(String, Vec<ExtensionParam>)> =
            headers.get_all(SEC_WEBSOCKET_EXTENSIONS).flat_map(parse_extensions).collect();
        if selected.is_empty() {
            return Ok(Vec::new());
        }
        if self.extensions.is_empty() {
            return Err(HandshakeError::UnsupportedExtension(format!(
                "no extensions offered, server selected {}",
                selected.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }

        let mut accepted: Vec<Arc<dyn Extension>> = Vec::new();
        for (name, params) in selected {
            let found = self
                .extensions
                .iter()
                .find(|ext| ext.name() == name && ext.are_valid_params(&params, &accepted))
                .cloned();
            match found {
                Some(ext) => accepted.push(ext),
                None => return Err(HandshakeError::UnsupportedExtension(name)),
            }
        }
        Ok(accepted)
    }

    fn accepted_subprotocol(&self, headers: &Headers) -> std::result::Result<Option<String>, HandshakeError> {
        let selected: Vec<&str> = headers.get_all(SEC_WEBSOCKET_PROTOCOL).flat_map(parse_tokens).collect();
        match selected.as_slice() {
            [] => Ok(None),
            [one] if self.subprotocols.iter().any(|s| s == one) => Ok(Some(one.to_string())),
            [one] => Err(HandshakeError::UnsupportedSubprotocol(one.to_string())),
            many => Err(HandshakeError::UnsupportedSubprotocol(format!("multiple subprotocols: {}", many.join(", ")))),
        }
    }
}

/// Connects to `ws://host:port{path}` with default settings.
pub async fn connect(host: &str, port: u16, path: &str) -> Result<WebSocket> {
    ClientHandshake::new(host, port).path(path).connect().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::error::Error;
    use crate::net::connection::Message;
    use crate::net::extension::testing::Invert;
    use crate::net::framing::{self, Frame};

    fn response(key: &str, extra: &[(&str, &str)]) -> ResponseHead {
        let mut headers: Headers =
            [("Upgrade", "websocket"), ("Connection", "Upgrade")].into_iter().collect();
        headers.append(SEC_WEBSOCKET_ACCEPT, compute_accept_key(key));
        for (name, value) in extra {
            headers.append(*name, *value);
        }
        ResponseHead { version: 1, status: 101, reason: "Switching Protocols".to_string(), headers }
    }

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn test_request_headers() {
        let client = ClientHandshake::new("example.com", 80)
            .origin("http://example.com")
            .subprotocols(["chat", "superchat"])
            .credentials("user", "pass")
            .header("X-Trace", "1");
        let headers = client.request_headers(KEY);

        assert_eq!(headers.get("Host"), Some("example.com"));
        assert_eq!(headers.get("Upgrade"), Some("websocket"));
        assert_eq!(headers.get("Connection"), Some("Upgrade"));
        assert_eq!(headers.get("Sec-WebSocket-Key"), Some(KEY));
        assert_eq!(headers.get("Sec-WebSocket-Version"), Some("13"));
        assert_eq!(headers.get("Origin"), Some("http://example.com"));
        assert_eq!(headers.get("Sec-WebSocket-Protocol"), Some("chat, superchat"));
        assert_eq!(headers.get("Authorization"), Some("Basic dXNlcjpwYXNz"));
        assert_eq!(headers.get("X-Trace"), Some("1"));
        assert!(!headers.contains("Sec-WebSocket-Extensions"));
    }

    #[test]
    fn test_host_header_port() {
        assert_eq!(ClientHandshake::new("h", 8080).host_header(), "h:8080");
        assert_eq!(ClientHandshake::new("h", 443).secure(true).host_header(), "h");
        assert_eq!(ClientHandshake::new("h", 80).secure(true).host_header(), "h:80");
        assert_eq!(ClientHandshake::new("::1", 9000).host_header(), "[::1]:9000");
    }

    #[test]
    fn test_accepts_valid_response() {
        let client = ClientHandshake::new("h", 80).subprotocols(["chat"]);
        let (extensions, subprotocol) =
            client.check_response(&response(KEY, &[("Sec-WebSocket-Protocol", "chat")]), KEY).unwrap();
        assert!(extensions.is_empty());
        assert_eq!(subprotocol.as_deref(), Some("chat"));
    }

    #[test]
    fn test_rejects_bad_status_and_accept() {
        let client = ClientHandshake::new("h", 80);

        let mut not_upgraded = response(KEY, &[]);
        not_upgraded.status = 200;
        assert!(matches!(client.check_response(&not_upgraded, KEY), Err(HandshakeError::InvalidStatus(200))));

        let wrong_key = response("AAAAAAAAAAAAAAAAAAAAAA==", &[]);
        assert!(matches!(client.check_response(&wrong_key, KEY), Err(HandshakeError::InvalidAccept { .. })));

        let mut old = response(KEY, &[]);
        old.version = 0;
        assert!(matches!(client.check_response(&old, KEY), Err(HandshakeError::Http(_))));

        let twice = response(KEY, &[("Sec-WebSocket-Accept", "again")]);
        assert!(matches!(client.check_response(&twice, KEY), Err(HandshakeError::InvalidHeader { .. })));
    }

    #[test]
    fn test_rejects_unoffered_selections() {
        let client = ClientHandshake::new("h", 80).subprotocols(["chat"]);
        let unknown = response(KEY, &[("Sec-WebSocket-Protocol", "other")]);
        assert!(matches!(client.check_response(&unknown, KEY), Err(HandshakeError::UnsupportedSubprotocol(_))));

        let many = response(KEY, &[("Sec-WebSocket-Protocol", "chat, chat")]);
        assert!(matches!(client.check_response(&many, KEY), Err(HandshakeError::UnsupportedSubprotocol(_))));

        let ext = response(KEY, &[("Sec-WebSocket-Extensions", "x-invert")]);
        assert!(matches!(client.check_response(&ext, KEY), Err(HandshakeError::UnsupportedExtension(_))));
    }

    #[test]
    fn test_accepts_offered_extension() {
        let client = ClientHandshake::new("h", 80).extension(Arc::new(Invert { name: "x-invert" }));
        assert_eq!(
            client.request_headers(KEY).get("Sec-WebSocket-Extensions"),
            Some("x-invert; mode=all")
        );

        let ok = response(KEY, &[("Sec-WebSocket-Extensions", "x-invert; mode=all")]);
        let (extensions, _) = client.check_response(&ok, KEY).unwrap();
        assert_eq!(extensions.len(), 1);

        let bad_params = response(KEY, &[("Sec-WebSocket-Extensions", "x-invert; level=9")]);
        assert!(matches!(client.check_response(&bad_params, KEY), Err(HandshakeError::UnsupportedExtension(_))));
    }

    #[tokio::test]
    async fn test_handshake_hands_leftover_bytes_to_connection() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(async move {
            let (request, _) = http::read_request_head(&mut remote).await.unwrap();
            let key = request.headers.get("Sec-WebSocket-Key").unwrap().to_string();

            let mut out = Vec::new();
            let headers: Headers = [
                ("Upgrade", "websocket".to_string()),
                ("Connection", "Upgrade".to_string()),
                ("Sec-WebSocket-Accept", compute_accept_key(&key)),
            ]
            .into_iter()
            .collect();
            http::write_response(&mut out, 101, &headers, b"").await.unwrap();
            // First frame arrives in the same write as the 101 head.
            let mut frame = BytesMut::new();
            framing::encode(&Frame::text(&b"welcome"[..]), Role::Server, &mut frame).unwrap();
            out.extend_from_slice(&frame);
            remote.write_all(&out).await.unwrap();
            remote
        });

        let ws = ClientHandshake::new("localhost", 9001).handshake(local).await.unwrap();
        assert_eq!(ws.role(), Role::Client);
        let message = tokio::time::timeout(Duration::from_secs(5), ws.receive()).await.unwrap().unwrap();
        assert_eq!(message, Message::from("welcome"));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_handshake_rejection_is_reported() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let _ = http::read_request_head(&mut remote).await;
            let headers: Headers = [("Content-Type", "text/plain")].into_iter().collect();
            let _ = http::write_response(&mut remote, 403, &headers, b"Forbidden\n").await;
        });

        let err = ClientHandshake::new("localhost", 9001).handshake(local).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(HandshakeError::InvalidStatus(403))));
    }
}
