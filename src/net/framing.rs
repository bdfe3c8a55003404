//! RFC 6455 frame codec.
//!
//! Stateless with respect to the connection: `encode` serializes one frame for
//! the local role and `Decoder::decode` pulls one frame off a read buffer,
//! returning `Ok(None)` until the buffer holds the whole frame.

use arrayvec::ArrayVec;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Error, Result};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

pub const RSV1: u8 = 0x40;
pub const RSV2: u8 = 0x20;
pub const RSV3: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiator. Masks every frame it sends.
    Client,
    /// Acceptor. Never masks.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(Error::protocol(format!("unknown opcode 0x{other:X}"))),
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// RSV1..RSV3 in their header bit positions. Only extensions set these.
    pub rsv: u8,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self { fin, rsv: 0, opcode, payload: payload.into() }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Binary, payload)
    }

    /// Validates the invariants every frame must hold once extensions are done with it.
    pub fn check(&self) -> Result<()> {
        self.check_reserved(0)
    }

    /// Like `check`, but lets through the RSV bits in `allowed`.
    pub fn check_reserved(&self, allowed: u8) -> Result<()> {
        if self.rsv & !allowed != 0 {
            return Err(Error::protocol("reserved bits must be 0"));
        }
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::protocol("fragmented control frame"));
            }
            if self.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(Error::protocol(format!(
                    "control frame payload too long: {} bytes",
                    self.payload.len()
                )));
            }
        }
        Ok(())
    }
}

/// XORs `payload` with the repeating 4 byte key. Applying it twice is a no-op.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i & 3];
    }
}

pub(crate) fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    SystemRandom::new().fill(&mut buf)?;
    Ok(buf)
}

/// Serializes `frame` as sent by `role` into `dst`.
pub fn encode(frame: &Frame, role: Role, dst: &mut BytesMut) -> Result<()> {
    let payload_len = frame.payload.len();
    let mut header: ArrayVec<u8, 14> = ArrayVec::new();

    // 1. FIN | RSV | opcode
    let fin = if frame.fin { 0x80 } else { 0x00 };
    header.push(fin | (frame.rsv & (RSV1 | RSV2 | RSV3)) | frame.opcode as u8);

    // 2. MASK | length, with the 16/64 bit extended forms
    let mask_bit = if role == Role::Client { 0x80 } else { 0x00 };
    if payload_len <= 125 {
        header.push(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        header.push(mask_bit | 126);
        header
            .try_extend_from_slice(&(payload_len as u16).to_be_bytes())
            .map_err(|e| Error::Internal(e.to_string()))?;
    } else {
        header.push(mask_bit | 127);
        header
            .try_extend_from_slice(&(payload_len as u64).to_be_bytes())
            .map_err(|e| Error::Internal(e.to_string()))?;
    }

    dst.reserve(header.len() + 4 + payload_len);

    // 3. Mask key and masked payload for clients, raw payload for servers
    if role == Role::Client {
        let mask_key = random_bytes::<4>()?;
        header
            .try_extend_from_slice(&mask_key)
            .map_err(|e| Error::Internal(e.to_string()))?;
        dst.put_slice(&header);
        let start = dst.len();
        dst.put_slice(&frame.payload);
        apply_mask(&mut dst[start..], mask_key);
    } else {
        dst.put_slice(&header);
        dst.put_slice(&frame.payload);
    }
    Ok(())
}

/// Frame decoder for one endpoint. `role` is the local role, which fixes
/// whether inbound frames must be masked.
#[derive(Debug, Clone)]
pub struct Decoder {
    role: Role,
    reserved_mask: u8,
}

impl Decoder {
    pub fn new(role: Role) -> Self {
        Self { role, reserved_mask: 0 }
    }

    /// Reserved bits a negotiated extension is allowed to set.
    pub fn with_reserved_bits(mut self, mask: u8) -> Self {
        self.reserved_mask = mask & (RSV1 | RSV2 | RSV3);
        self
    }

    /// Decodes one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not hold a complete frame yet; nothing
    /// is consumed in that case. `max_size` caps the declared payload length of
    /// data frames and is checked as soon as the length is known; control frames
    /// are capped at 125 bytes regardless.
    pub fn decode(&self, src: &mut BytesMut, max_size: usize) -> Result<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first_byte = src[0];
        let second_byte = src[1];

        let fin = (first_byte & 0x80) != 0;
        let rsv = first_byte & (RSV1 | RSV2 | RSV3);
        if rsv & !self.reserved_mask != 0 {
            return Err(Error::protocol("reserved bits set without a negotiated extension"));
        }
        let opcode = Opcode::from_u8(first_byte & 0x0F)?;

        let masked = (second_byte & 0x80) != 0;
        match (self.role, masked) {
            (Role::Client, true) => return Err(Error::protocol("server sent a masked frame")),
            (Role::Server, false) => return Err(Error::protocol("client sent an unmasked frame")),
            _ => {}
        }

        let length_byte = second_byte & 0x7F;
        if opcode.is_control() {
            if !fin {
                return Err(Error::protocol("fragmented control frame"));
            }
            if length_byte as usize > MAX_CONTROL_PAYLOAD {
                return Err(Error::protocol("control frame payload too long"));
            }
        }

        let (payload_len, mut header_len) = match length_byte {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([src[2], src[3]]) as u64, 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(len_bytes);
                if len >> 63 != 0 {
                    return Err(Error::protocol("most significant bit of 64 bit length set"));
                }
                (len, 10)
            }
            n => (n as u64, 2),
        };

        if !opcode.is_control() && payload_len > max_size as u64 {
            return Err(Error::PayloadTooLarge { size: payload_len, max: max_size });
        }

        let mask_key = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [src[header_len], src[header_len + 1], src[header_len + 2], src[header_len + 3]];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        let total_len = header_len + payload_len as usize;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(total_len);
        payload.advance(header_len);
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame { fin, rsv, opcode, payload: payload.freeze() }))
    }
}
