//! Scripted serial port for exercising the transaction engine in tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;
use crate::protocol::packet::AckReason;
use crate::protocol::slip;

/// One scripted reaction to a written request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Answer with the SLIP-framed encoding of these raw packet bytes.
    Frame(Vec<u8>),
    /// Answer with these bytes exactly as given.
    Raw(Vec<u8>),
    /// Stay silent for this request.
    Silence,
}

/// Serial port double: every completed write pops the next scripted reply
/// into the read buffer, and all written packets are recorded.
#[derive(Debug)]
pub(crate) struct MockPort {
    replies: VecDeque<Reply>,
    rx: VecDeque<u8>,
    pub(crate) writes: Vec<Vec<u8>>,
    timeout: Duration,
}

impl MockPort {
    pub(crate) fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            rx: VecDeque::new(),
            writes: Vec::new(),
            timeout: Duration::from_millis(5),
        }
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no scripted data"));
        }
        let count = buf.len().min(self.rx.len());
        for slot in buf.iter_mut().take(count) {
            *slot = self.rx.pop_front().expect("length checked above");
        }
        Ok(count)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes.push(buf.to_vec());
        match self.replies.pop_front() {
            Some(Reply::Frame(packet)) => self.rx.extend(slip::encode(&packet)),
            Some(Reply::Raw(bytes)) => self.rx.extend(bytes),
            Some(Reply::Silence) | None => {}
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Build raw response packet bytes (CRC-prefixed, not yet SLIP framed).
pub(crate) fn response_packet(sequence: u8, reason: AckReason, payload: &[u8]) -> Vec<u8> {
    let mut message = vec![sequence, 0x00, 0x00, reason as u8];
    message.extend_from_slice(payload);
    let mut packet = crc32fast::hash(&message).to_le_bytes().to_vec();
    packet.extend_from_slice(&message);
    packet
}

/// An acknowledging response without payload.
pub(crate) fn ack() -> Reply {
    Reply::Frame(response_packet(0, AckReason::Ack, &[]))
}

/// An acknowledging response carrying a payload.
pub(crate) fn ack_with(payload: &[u8]) -> Reply {
    Reply::Frame(response_packet(0, AckReason::Ack, payload))
}

/// A rejecting response with the given reason.
pub(crate) fn nack(reason: AckReason) -> Reply {
    Reply::Frame(response_packet(0, reason, &[]))
}

/// Decode one SLIP-framed request into (sequence, command id, body),
/// checking its CRC on the way.
pub(crate) fn decode_request(framed: &[u8]) -> (u8, u8, Vec<u8>) {
    let mut decoder = slip::Decoder::new();
    let packet = framed
        .iter()
        .find_map(|&byte| decoder.push(byte))
        .expect("write did not contain a complete frame");
    let crc = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
    assert_eq!(crc, crc32fast::hash(&packet[4..]), "request CRC mismatch");
    (packet[4], packet[5], packet[6..].to_vec())
}
