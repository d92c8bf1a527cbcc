//! WebSocket frame headers (RFC 6455, section 5.2).

use std::io;

use crate::error::{Result, TransportError};

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xa;

const FLAG_FIN: u8 = 0x80;
const FLAG_MASKED: u8 = 0x80;

pub const CLOSURE_NORMAL: u16 = 1000;
pub const CLOSURE_SHUTDOWN: u16 = 1001;
pub const CLOSURE_PROTOCOL_ERROR: u16 = 1002;

/// Longest possible header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn is_control(&self) -> bool {
        self.opcode & 0x8 != 0
    }

    /// Appends the encoded header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let first = (if self.fin { FLAG_FIN } else { 0 }) | (self.opcode & 0x0f);
        out.push(first);

        let masked = if self.mask.is_some() { FLAG_MASKED } else { 0 };
        match self.payload_len {
            len @ 0..=125 => out.push(masked | len as u8),
            len @ 126..=0xffff => {
                out.push(masked | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(masked | 127);
                out.extend_from_slice(&len.to_be_bytes());
            }
        }

        if let Some(mask) = self.mask {
            out.extend_from_slice(&mask);
        }
    }

    /// Decodes a header from the start of `data`. `Ok(None)` when more
    /// bytes are needed; otherwise the header and its encoded length.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 2 {
            return Ok(None);
        }

        let first = data[0];
        if first & 0x70 != 0 {
            return Err(TransportError::protocol("reserved bits set in frame header"));
        }
        let fin = first & FLAG_FIN != 0;
        let opcode = first & 0x0f;

        let second = data[1];
        let masked = second & FLAG_MASKED != 0;
        let (payload_len, mut offset) = match second & 0x7f {
            126 => {
                if data.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([data[2], data[3]]) as u64, 4)
            }
            127 => {
                if data.len() < 10 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data[2..10]);
                let len = u64::from_be_bytes(bytes);
                if len >> 63 != 0 {
                    return Err(TransportError::protocol("frame length has its high bit set"));
                }
                (len, 10)
            }
            len => (len as u64, 2),
        };

        let mask = if masked {
            if data.len() < offset + 4 {
                return Ok(None);
            }
            let mut mask = [0u8; 4];
            mask.copy_from_slice(&data[offset..offset + 4]);
            offset += 4;
            Some(mask)
        } else {
            None
        };

        let header = Self {
            fin,
            opcode,
            mask,
            payload_len,
        };
        if header.is_control() && (!fin || payload_len > 125) {
            return Err(TransportError::protocol("invalid control frame"));
        }
        Ok(Some((header, offset)))
    }
}

/// XORs `data` with `mask`, `offset` being the position of `data[0]` in
/// the frame payload.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: u64) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[((offset + i as u64) % 4) as usize];
    }
}

/// Encodes a complete frame, masking the payload when `mask` is set.
pub fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_HEADER_LEN + payload.len());
    FrameHeader {
        fin: true,
        opcode,
        mask,
        payload_len: payload.len() as u64,
    }
    .encode(&mut out);
    let start = out.len();
    out.extend_from_slice(payload);
    if let Some(mask) = mask {
        apply_mask(&mut out[start..], mask, 0);
    }
    out
}

/// Bytes from the OS random source, for frame masks and handshake keys.
///
/// # Errors
/// Returns [`TransportError::Socket`] if the OS source is unavailable.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    getrandom::fill(&mut out).map_err(|error| TransportError::Socket {
        source: io::Error::other(error.to_string()),
    })?;
    Ok(out)
}
