//! Extension contract and the header grammar used to negotiate extensions.
//!
//! The engine never transforms payloads itself. A negotiated extension gets
//! every outbound frame in negotiation order and every inbound frame in
//! reverse order.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::net::framing::Frame;

/// One `key` or `key=value` parameter of an extension offer.
pub type ExtensionParam = (String, Option<String>);

pub trait Extension: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Parameters sent when this extension is offered by a client.
    fn params(&self) -> Vec<ExtensionParam> {
        Vec::new()
    }

    /// Whether the peer's parameters are acceptable given the extensions already accepted.
    fn are_valid_params(&self, params: &[ExtensionParam], accepted: &[Arc<dyn Extension>]) -> bool;

    /// RSV bits this extension may set on the wire.
    fn reserved_bits(&self) -> u8 {
        0
    }

    fn encode(&self, frame: Frame) -> Result<Frame>;

    fn decode(&self, frame: Frame, max_size: usize) -> Result<Frame>;
}

/// Parses a `Sec-WebSocket-Extensions` value such as
/// `permessage-deflate; client_max_window_bits, x-webkit; level="3"`.
pub fn parse_extensions(value: &str) -> Vec<(String, Vec<ExtensionParam>)> {
    let mut result = Vec::new();
    for item in value.split(',') {
        let mut parts = item.split(';').map(str::trim);
        let name = match parts.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => continue,
        };
        let params = parts
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((key, value)) => (key.trim().to_string(), Some(value.trim().trim_matches('"').to_string())),
                None => (p.to_string(), None),
            })
            .collect();
        result.push((name, params));
    }
    result
}

pub fn build_extensions<'a, I>(extensions: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [ExtensionParam])>,
{
    let mut out = String::new();
    for (name, params) in extensions {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(name);
        for (key, value) in params {
            out.push_str("; ");
            out.push_str(key);
            if let Some(value) = value {
                out.push('=');
                out.push_str(value);
            }
        }
    }
    out
}

/// Splits a comma separated header value (`Connection`, `Upgrade`,
/// `Sec-WebSocket-Protocol`) into its non-empty tokens.
pub fn parse_tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// Picks the first extension from `available` matching each offer in order.
/// Offers nothing matches come back in the second list.
pub(crate) fn match_offers(
    offers: Vec<(String, Vec<ExtensionParam>)>,
    available: &[Arc<dyn Extension>],
) -> (Vec<(Arc<dyn Extension>, Vec<ExtensionParam>)>, Vec<(String, Vec<ExtensionParam>)>) {
    let mut accepted: Vec<(Arc<dyn Extension>, Vec<ExtensionParam>)> = Vec::new();
    let mut unmatched = Vec::new();
    for (name, params) in offers {
        let accepted_so_far: Vec<Arc<dyn Extension>> = accepted.iter().map(|(e, _)| e.clone()).collect();
        let found = available
            .iter()
            .find(|ext| ext.name() == name && ext.are_valid_params(&params, &accepted_so_far));
        match found {
            Some(ext) => accepted.push((ext.clone(), params)),
            None => unmatched.push((name, params)),
        }
    }
    (accepted, unmatched)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Flips every payload byte and marks frames with RSV1, standing in for a
    /// real payload transform.
    #[derive(Debug)]
    pub struct Invert {
        pub name: &'static str,
    }

    impl Extension for Invert {
        fn name(&self) -> &str {
            self.name
        }

        fn params(&self) -> Vec<ExtensionParam> {
            vec![("mode".to_string(), Some("all".to_string()))]
        }

        fn are_valid_params(&self, params: &[ExtensionParam], accepted: &[Arc<dyn Extension>]) -> bool {
            accepted.iter().all(|e| e.name() != self.name)
                && params.iter().all(|(k, _)| k == "mode")
        }

        fn reserved_bits(&self) -> u8 {
            crate::net::framing::RSV1
        }

        fn encode(&self, mut frame: Frame) -> Result<Frame> {
            if !frame.opcode.is_control() {
                frame.payload = frame.payload.iter().map(|b| !b).collect::<Vec<u8>>().into();
                frame.rsv |= crate::net::framing::RSV1;
            }
            Ok(frame)
        }

        fn decode(&self, mut frame: Frame, _max_size: usize) -> Result<Frame> {
            if frame.rsv & crate::net::framing::RSV1 != 0 {
                frame.payload = frame.payload.iter().map(|b| !b).collect::<Vec<u8>>().into();
                frame.rsv &= !crate::net::framing::RSV1;
            }
            Ok(frame)
        }
    }
}
