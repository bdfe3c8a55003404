//! Just enough HTTP/1.1 for the opening handshake: read one request or
//! response head, write one request or response.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, HandshakeError, Result};

const MAX_HEAD_SIZE: usize = 8192;
const MAX_HEADERS: usize = 64;

/// Ordered header multimap with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every value stored under `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.0.push((name, value.into()));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Headers(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor HTTP version: 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Reads until the blank line that ends a head. Returns the head length;
/// anything after it in `buf` belongs to the next protocol.
async fn read_head<R: AsyncRead + Unpin>(io: &mut R, buf: &mut BytesMut) -> Result<usize> {
    let mut searched = 0;
    loop {
        if let Some(pos) = buf[searched..].windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(searched + pos + 4);
        }
        searched = buf.len().saturating_sub(3);
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HandshakeError::Http(format!("head exceeds {MAX_HEAD_SIZE} bytes")).into());
        }
        if io.read_buf(buf).await? == 0 {
            return Err(Error::Transport(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<Headers> {
    let mut headers = Headers::new();
    for header in parsed {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| HandshakeError::Http(format!("non UTF-8 value for {}", header.name)))?;
        headers.append(header.name, value.trim());
    }
    Ok(headers)
}

fn parse_error(e: httparse::Error) -> Error {
    HandshakeError::Http(e.to_string()).into()
}

/// Reads one request head. The returned buffer holds the bytes read past it.
pub async fn read_request_head<R: AsyncRead + Unpin>(io: &mut R) -> Result<(RequestHead, BytesMut)> {
    let mut buf = BytesMut::with_capacity(1024);
    let head_len = read_head(io, &mut buf).await?;

    let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut parsed);
    if request.parse(&buf[..head_len]).map_err(parse_error)?.is_partial() {
        return Err(HandshakeError::Http("incomplete request head".into()).into());
    }

    let head = RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        path: request.path.unwrap_or_default().to_string(),
        version: request.version.unwrap_or_default(),
        headers: collect_headers(request.headers)?,
    };
    let leftover = buf.split_off(head_len);
    Ok((head, leftover))
}

/// Reads one response head. The returned buffer holds the bytes read past it.
pub async fn read_response_head<R: AsyncRead + Unpin>(io: &mut R) -> Result<(ResponseHead, BytesMut)> {
    let mut buf = BytesMut::with_capacity(1024);
    let head_len = read_head(io, &mut buf).await?;

    let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut parsed);
    if response.parse(&buf[..head_len]).map_err(parse_error)?.is_partial() {
        return Err(HandshakeError::Http("incomplete response head".into()).into());
    }

    let head = ResponseHead {
        version: response.version.unwrap_or_default(),
        status: response.code.unwrap_or_default(),
        reason: response.reason.unwrap_or_default().to_string(),
        headers: collect_headers(response.headers)?,
    };
    let leftover = buf.split_off(head_len);
    Ok((head, leftover))
}

fn push_headers(out: &mut Vec<u8>, headers: &Headers) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

pub async fn write_request<W: AsyncWrite + Unpin>(io: &mut W, path: &str, headers: &Headers) -> Result<()> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"GET ");
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    push_headers(&mut out, headers);

    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Writes a response. A non-empty body gets a `Content-Length` unless one is set.
pub async fn write_response<W: AsyncWrite + Unpin>(
    io: &mut W,
    status: u16,
    headers: &Headers,
    body: &[u8],
) -> Result<()> {
    let mut status_buf = itoa::Buffer::new();
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status_buf.format(status).as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason_phrase(status).as_bytes());
    out.extend_from_slice(b"\r\n");

    if !body.is_empty() && !headers.contains("Content-Length") {
        let mut headers = headers.clone();
        let mut len_buf = itoa::Buffer::new();
        headers.insert("Content-Length", len_buf.format(body.len()));
        push_headers(&mut out, &headers);
    } else {
        push_headers(&mut out, headers);
    }
    out.extend_from_slice(body);

    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}
