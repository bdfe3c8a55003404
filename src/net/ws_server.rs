//! Opening handshake for the accepting side.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::error::{Error, HandshakeError};
use crate::net::connection::WebSocket;
use crate::net::extension::{build_extensions, match_offers, parse_extensions, parse_tokens, Extension};
use crate::net::framing::Role;
use crate::net::handshake::{
    check_upgrade_headers, compute_accept_key, is_valid_key, single_header, CONNECTION, ORIGIN,
    SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use crate::net::http::{self, Headers, RequestHead};
use crate::net::transport::Transport;

/// Picks a subprotocol given the client's offers and the server's list.
pub type SubprotocolSelector = Arc<dyn Fn(&[String], &[String]) -> Option<String> + Send + Sync>;

/// Inspects a request before validation; a response aborts the handshake with it.
pub type RequestProcessor = Arc<dyn Fn(&RequestHead) -> Option<EarlyResponse> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl EarlyResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let headers = [("Content-Type", "text/plain")].into_iter().collect();
        Self { status, headers, body: body.into() }
    }
}

/// Outcome of a successful negotiation.
pub(crate) struct Negotiated {
    pub headers: Headers,
    pub extensions: Vec<Arc<dyn Extension>>,
    pub subprotocol: Option<String>,
}

#[derive(Clone, Default)]
pub struct ServerHandshake {
    origins: Option<Vec<String>>,
    extensions: Vec<Arc<dyn Extension>>,
    subprotocols: Vec<String>,
    select_subprotocol: Option<SubprotocolSelector>,
    process_request: Option<RequestProcessor>,
    extra_headers: Headers,
    config: Config,
}

impl fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("origins", &self.origins)
            .field("extensions", &self.extensions)
            .field("subprotocols", &self.subprotocols)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServerHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept requests whose `Origin` is in this list. Requests without
    /// an `Origin` header are refused once a list is set.
    pub fn origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.origins = Some(origins.into_iter().map(Into::into).collect());
        self
    }

    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Supported subprotocols in order of preference.
    pub fn subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn select_subprotocol<F>(mut self, select: F) -> Self
    where
        F: Fn(&[String], &[String]) -> Option<String> + Send + Sync + 'static,
    {
        self.select_subprotocol = Some(Arc::new(select));
        self
    }

    pub fn process_request<F>(mut self, process: F) -> Self
    where
        F: Fn(&RequestHead) -> Option<EarlyResponse> + Send + Sync + 'static,
    {
        self.process_request = Some(Arc::new(process));
        self
    }

    /// Header added to every `101 Switching Protocols` response.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.append(name, value);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    /// Validates `request` and computes the `101` response for it.
    pub(crate) fn negotiate(&self, request: &RequestHead) -> Result<Negotiated, HandshakeError> {
        if let Some(process) = &self.process_request {
            if let Some(EarlyResponse { status, headers, body }) = process(request) {
                return Err(HandshakeError::Abort { status, headers, body });
            }
        }
        if request.method != "GET" {
            return Err(HandshakeError::Http(format!("unsupported method {}", request.method)));
        }
        if request.version != 1 {
            return Err(HandshakeError::Http(format!("unsupported HTTP version 1.{}", request.version)));
        }

        let headers = &request.headers;
        check_upgrade_headers(headers)?;

        let key = single_header(headers, SEC_WEBSOCKET_KEY)?;
        if !is_valid_key(key) {
            return Err(HandshakeError::InvalidKey(key.to_string()));
        }
        let version = single_header(headers, SEC_WEBSOCKET_VERSION)?;
        if version != "13" {
            return Err(HandshakeError::InvalidVersion(version.to_string()));
        }
        self.check_origin(headers)?;

        let (extensions, extensions_header) = self.negotiate_extensions(headers);
        let subprotocol = self.negotiate_subprotocol(headers);

        let mut response = Headers::new();
        response.append(UPGRADE, "websocket");
        response.append(CONNECTION, "Upgrade");
        response.append(SEC_WEBSOCKET_ACCEPT, compute_accept_key(key));
        if let Some(value) = extensions_header {
            response.append(SEC_WEBSOCKET_EXTENSIONS, value);
        }
        if let Some(subprotocol) = &subprotocol {
            response.append(SEC_WEBSOCKET_PROTOCOL, subprotocol.as_str());
        }
        for (name, value) in self.extra_headers.iter() {
            response.append(name, value);
        }

        Ok(Negotiated { headers: response, extensions, subprotocol })
    }

    fn check_origin(&self, headers: &Headers) -> Result<(), HandshakeError> {
        let Some(allowed) = &self.origins else {
            return Ok(());
        };
        let origin = match single_header(headers, ORIGIN) {
            Ok(origin) => origin,
            Err(HandshakeError::MissingHeader(_)) => return Err(HandshakeError::InvalidOrigin(None)),
            Err(e) => return Err(e),
        };
        if allowed.iter().any(|o| o == origin) {
            Ok(())
        } else {
            Err(HandshakeError::InvalidOrigin(Some(origin.to_string())))
        }
    }

    fn negotiate_extensions(&self, headers: &Headers) -> (Vec<Arc<dyn Extension>>, Option<String>) {
        if self.extensions.is_empty() {
            return (Vec::new(), None);
        }
        let offers: Vec<_> = headers.get_all(SEC_WEBSOCKET_EXTENSIONS).flat_map(parse_extensions).collect();
        let (accepted, declined) = match_offers(offers, &self.extensions);
        for (name, _) in &declined {
            debug!("declined extension offer {name}");
        }
        if accepted.is_empty() {
            return (Vec::new(), None);
        }
        let header = build_extensions(accepted.iter().map(|(ext, params)| (ext.name(), params.as_slice())));
        (accepted.into_iter().map(|(ext, _)| ext).collect(), Some(header))
    }

    fn negotiate_subprotocol(&self, headers: &Headers) -> Option<String> {
        let offered: Vec<String> =
            headers.get_all(SEC_WEBSOCKET_PROTOCOL).flat_map(parse_tokens).map(str::to_string).collect();
        if offered.is_empty() {
            return None;
        }
        match &self.select_subprotocol {
            Some(select) => select(&offered, &self.subprotocols),
            None => default_subprotocol(&offered, &self.subprotocols),
        }
    }

    /// Runs the handshake on a freshly accepted transport. Failures are
    /// answered with an HTTP error response and reported as `None`.
    pub async fn accept<T: Transport>(&self, transport: T) -> Option<WebSocket> {
        self.accept_when(transport, || true).await
    }

    /// Like `accept`; requests that arrive while `serving()` is false are
    /// answered with 503.
    pub(crate) async fn accept_when<T, F>(&self, mut transport: T, serving: F) -> Option<WebSocket>
    where
        T: Transport,
        F: Fn() -> bool,
    {
        let peer = transport.peer_addr();
        let (request, leftover) = match http::read_request_head(&mut transport).await {
            Ok(read) => read,
            Err(Error::Handshake(err)) => {
                warn!("invalid request from {peer:?}: {err}");
                reject(&mut transport, &err).await;
                return None;
            }
            Err(err) => {
                debug!("connection from {peer:?} ended before the handshake: {err}");
                return None;
            }
        };
        debug!("server handshake: {} {} from {peer:?}", request.method, request.path);

        let negotiated = if !serving() {
            Err(HandshakeError::Abort {
                status: 503,
                headers: [("Content-Type", "text/plain")].into_iter().collect(),
                body: b"Server is shutting down.\n".to_vec(),
            })
        } else {
            match catch_unwind(AssertUnwindSafe(|| self.negotiate(&request))) {
                Ok(negotiated) => negotiated,
                Err(_) => {
                    error!("handshake handler panicked for {peer:?}");
                    send_response(&mut transport, 500, &error_headers(), INTERNAL_ERROR_BODY).await;
                    return None;
                }
            }
        };

        match negotiated {
            Ok(Negotiated { headers, extensions, subprotocol }) => {
                if let Err(err) = http::write_response(&mut transport, 101, &headers, b"").await {
                    debug!("failed to send 101 to {peer:?}: {err}");
                    return None;
                }
                Some(WebSocket::open(transport, Role::Server, self.config.clone(), leftover, extensions, subprotocol))
            }
            Err(err) => {
                warn!("rejected handshake from {peer:?}: {err}");
                reject(&mut transport, &err).await;
                None
            }
        }
    }
}

const INTERNAL_ERROR_BODY: &[u8] =
    b"Failed to open a WebSocket connection.\nSee server log for more information.\n";

/// Intersection of both lists minimizing the sum of positions; ties go to the
/// client's earlier offer.
pub fn default_subprotocol(offered: &[String], available: &[String]) -> Option<String> {
    offered
        .iter()
        .enumerate()
        .filter_map(|(ci, p)| available.iter().position(|s| s == p).map(|si| (ci + si, p)))
        .min_by_key(|(score, _)| *score)
        .map(|(_, p)| p.clone())
}

fn error_headers() -> Headers {
    [("Content-Type", "text/plain"), ("Connection", "close")].into_iter().collect()
}

/// Status, headers and plain text body answering a failed handshake.
pub(crate) fn error_response(err: &HandshakeError) -> (u16, Headers, Vec<u8>) {
    if let HandshakeError::Abort { status, headers, body } = err {
        let mut headers = headers.clone();
        headers.set_default("Connection", "close");
        return (*status, headers, body.clone());
    }

    let status = err.status();
    let mut headers = error_headers();
    let mut body = format!("Failed to open a WebSocket connection: {err}.\n");
    if status == 426 {
        headers.append(UPGRADE, "websocket");
        body.push_str("\nYou cannot access a WebSocket server directly with a browser. You need a WebSocket client.\n");
    }
    (status, headers, body.into_bytes())
}

async fn reject<T: Transport>(transport: &mut T, err: &HandshakeError) {
    let (status, headers, body) = error_response(err);
    send_response(transport, status, &headers, &body).await;
}

async fn send_response<T: Transport>(transport: &mut T, status: u16, headers: &Headers, body: &[u8]) {
    if let Err(err) = http::write_response(transport, status, headers, body).await {
        debug!("failed to send {status} response: {err}");
        return;
    }
    let _ = transport.shutdown().await;
}
