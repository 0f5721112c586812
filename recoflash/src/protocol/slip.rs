//! SLIP byte-stuffing framing over the raw serial stream.
//!
//! Packets are delimited by `END` bytes; `END` and `ESC` occurring inside a
//! packet are escaped as two-byte sequences. The decoder is an incremental
//! accumulator: feed it bytes as they arrive and it yields whole frames.

/// Frame delimiter.
const END: u8 = 0xC0;
/// Escape introducer.
const ESC: u8 = 0xDB;
/// Escaped `END`.
const ESC_END: u8 = 0xDC;
/// Escaped `ESC`.
const ESC_ESC: u8 = 0xDD;

/// Encode one packet as a SLIP frame, including both delimiters.
///
/// The leading delimiter flushes any line noise the receiver may have
/// accumulated.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 2);
    framed.push(END);
    for &byte in payload {
        match byte {
            END => framed.extend_from_slice(&[ESC, ESC_END]),
            ESC => framed.extend_from_slice(&[ESC, ESC_ESC]),
            _ => framed.push(byte),
        }
    }
    framed.push(END);
    framed
}

/// Incremental SLIP decoder.
///
/// Bytes outside a frame are discarded; empty frames (back-to-back `END`
/// bytes) are not emitted.
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: Vec<u8>,
    in_frame: bool,
    in_escape: bool,
}

impl Decoder {
    /// Create a decoder waiting for the start of a frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a complete frame when the closing delimiter
    /// arrives.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match byte {
            END => {
                if self.in_frame && !self.buffer.is_empty() {
                    self.in_frame = false;
                    self.in_escape = false;
                    return Some(std::mem::take(&mut self.buffer));
                }
                self.in_frame = true;
                self.buffer.clear();
            }
            ESC if self.in_frame => {
                self.in_escape = true;
            }
            ESC_END if self.in_frame && self.in_escape => {
                self.buffer.push(END);
                self.in_escape = false;
            }
            ESC_ESC if self.in_frame && self.in_escape => {
                self.buffer.push(ESC);
                self.in_escape = false;
            }
            _ if self.in_frame => {
                if self.in_escape {
                    // Invalid escape; keep the literal bytes.
                    self.buffer.push(ESC);
                    self.in_escape = false;
                }
                self.buffer.push(byte);
            }
            _ => {
                // Noise between frames.
            }
        }
        None
    }
}
