//! Device session: transaction engine and bootstrap.
//!
//! A [`Session`] owns the serial transport, the per-session sequence
//! counter and the immutable [`DeviceDescriptor`] fetched when the session
//! opens. Exactly one transaction is in flight at a time; the link is
//! half-duplex and the protocol carries no request id beyond the single
//! active sequence number, so callers must not share a session across
//! threads without serializing access externally.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::packet::{AckReason, Request, Response};
use crate::protocol::slip;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, trace};
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// Send attempts per transaction before giving up.
pub const DEFAULT_RETRY_COUNT: usize = 3;

/// Write payload bytes per transaction.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Time to wait for a complete response frame after each send.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Protocol tuning knobs, preset to the values the device firmware is
/// tested against.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Send attempts per transaction.
    pub retry_count: usize,
    /// Write payload bytes per transaction.
    pub chunk_size: usize,
    /// Time to wait for a complete response frame after each send.
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Set the per-transaction retry budget.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: usize) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the write chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

/// Device identity and memory geometry, fetched once at session open and
/// immutable afterwards. All address math derives from these fields.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Part number.
    pub part: u32,
    /// Part variant.
    pub variant: u32,
    /// Flash size in bytes.
    pub flash_size: u32,
    /// Flash page size in bytes.
    pub page_size: u32,
    /// UICR region size in bytes.
    pub uicr_size: u32,
    /// Wire protocol version.
    pub protocol_version: u32,
    /// Bootloader firmware version, formatted `major.minor.patch`.
    pub firmware_version: String,
}

impl DeviceDescriptor {
    fn from_responses(info: &Response, version: &Response) -> Result<Self> {
        let info_payload = info.payload();
        if info_payload.len() < 20 {
            return Err(Error::Protocol("device info response too short".into()));
        }
        let version_payload = version.payload();
        if version_payload.len() < 7 {
            return Err(Error::Protocol("version response too short".into()));
        }

        Ok(Self {
            part: LittleEndian::read_u32(&info_payload[0..4]),
            variant: LittleEndian::read_u32(&info_payload[4..8]),
            flash_size: LittleEndian::read_u32(&info_payload[8..12]),
            page_size: LittleEndian::read_u32(&info_payload[12..16]),
            uicr_size: LittleEndian::read_u32(&info_payload[16..20]),
            protocol_version: LittleEndian::read_u32(&version_payload[0..4]),
            // Version bytes arrive little-endian: patch, minor, major.
            firmware_version: format!(
                "{}.{}.{}",
                version_payload[6], version_payload[5], version_payload[4]
            ),
        })
    }
}

/// Transaction layer: one request on the wire at a time, with CRC-failure
/// retransmission and a deadline-driven response read.
#[derive(Debug)]
struct Link<P: Port> {
    port: P,
    decoder: slip::Decoder,
    seq_no: u8,
    config: SessionConfig,
}

impl<P: Port> Link<P> {
    fn new(port: P, config: SessionConfig) -> Self {
        Self {
            port,
            decoder: slip::Decoder::new(),
            seq_no: 0,
            config,
        }
    }

    /// Advance the sequence counter for a new transaction.
    ///
    /// The counter cycles 1..=254 then 0; the value 255 is never put on
    /// the wire. Deployed device firmware expects this exact cycle.
    fn advance_sequence(&mut self) -> u8 {
        self.seq_no = self.seq_no.wrapping_add(1);
        if self.seq_no == u8::MAX {
            self.seq_no = 0;
        }
        self.seq_no
    }

    /// Run one transaction: send, await a response, classify.
    ///
    /// The sequence counter moves exactly once per call; retransmissions
    /// reuse the same packet bytes. A corrupt response or a
    /// `NackInvalidCrc` spends one attempt, every other rejection is
    /// final.
    fn execute(&mut self, request: &Request) -> Result<Response> {
        let sequence = self.advance_sequence();
        let framed = slip::encode(&request.encode(sequence));
        trace!(
            "tx {:?} seq={sequence} ({} bytes framed)",
            request.command(),
            framed.len()
        );

        for attempt in 1..=self.config.retry_count {
            self.port.write_all(&framed)?;
            self.port.flush()?;

            let Some(packet) = self.read_packet()? else {
                debug!(
                    "no response to {:?} seq={sequence} (attempt {attempt}/{})",
                    request.command(),
                    self.config.retry_count
                );
                continue;
            };

            let Ok(response) = Response::parse(&packet) else {
                debug!(
                    "corrupt response to {:?} seq={sequence} (attempt {attempt}/{})",
                    request.command(),
                    self.config.retry_count
                );
                continue;
            };

            match response.ack_reason() {
                AckReason::Ack => return Ok(response),
                AckReason::NackInvalidCrc => {
                    debug!("device saw a corrupt request, resending seq={sequence}");
                    continue;
                }
                reason => return Err(Error::Rejected(reason)),
            }
        }

        Err(Error::Timeout)
    }

    /// Pull bytes through the framing decoder until a complete packet
    /// arrives or the read deadline passes.
    fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + self.config.read_timeout;
        let mut buf = [0u8; 256];

        loop {
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(count) => {
                    for &byte in &buf[..count] {
                        if let Some(packet) = self.decoder.push(byte) {
                            return Ok(Some(packet));
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

/// An open connection to the recovery bootloader.
#[derive(Debug)]
pub struct Session<P: Port> {
    link: Link<P>,
    descriptor: DeviceDescriptor,
}

impl<P: Port> Session<P> {
    /// Open a session: fetch device geometry and firmware version.
    ///
    /// Both queries must succeed; otherwise no session is returned and the
    /// error tells whether the device timed out or rejected the query.
    pub fn open(port: P, config: SessionConfig) -> Result<Self> {
        info!("connecting to recovery bootloader on {}", port.name());
        let mut link = Link::new(port, config);

        let info = link
            .execute(&Request::device_info())
            .map_err(|e| Error::Bootstrap(Box::new(e)))?;
        let version = link
            .execute(&Request::version_get())
            .map_err(|e| Error::Bootstrap(Box::new(e)))?;
        let descriptor = DeviceDescriptor::from_responses(&info, &version)?;

        info!(
            "device part=0x{:08X} variant=0x{:08X}, bootloader {} (protocol v{})",
            descriptor.part,
            descriptor.variant,
            descriptor.firmware_version,
            descriptor.protocol_version
        );
        debug!(
            "flash {} KiB in {} byte pages, UICR {} bytes",
            descriptor.flash_size / 1024,
            descriptor.page_size,
            descriptor.uicr_size
        );

        Ok(Self { link, descriptor })
    }

    /// Device identity and geometry for this session.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Bootloader firmware version string.
    pub fn firmware_version(&self) -> &str {
        &self.descriptor.firmware_version
    }

    /// Protocol tuning in effect for this session.
    pub fn config(&self) -> &SessionConfig {
        &self.link.config
    }

    /// Run one command against the device.
    pub fn execute(&mut self, request: &Request) -> Result<Response> {
        self.link.execute(request)
    }

    #[cfg(test)]
    pub(crate) fn with_descriptor(
        port: P,
        config: SessionConfig,
        descriptor: DeviceDescriptor,
    ) -> Self {
        Self {
            link: Link::new(port, config),
            descriptor,
        }
    }

    #[cfg(test)]
    pub(crate) fn test_port(&self) -> &P {
        &self.link.port
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig::default().with_read_timeout(Duration::from_millis(5))
}

#[cfg(test)]
pub(crate) fn test_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        part: 0x0005_2840,
        variant: 0x4141_4141,
        flash_size: 0x0010_0000,
        page_size: 4096,
        uicr_size: 0x308,
        protocol_version: 1,
        firmware_version: "1.2.3".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{ack, ack_with, decode_request, nack, response_packet, MockPort, Reply};

    fn link(replies: Vec<Reply>) -> Link<MockPort> {
        Link::new(MockPort::new(replies), test_config())
    }

    #[test]
    fn test_acked_transaction_succeeds_on_first_attempt() {
        let mut link = link(vec![ack_with(&[0xAB])]);
        let response = link.execute(&Request::reset()).unwrap();
        assert_eq!(response.ack_reason(), AckReason::Ack);
        assert_eq!(response.payload(), &[0xAB]);
        assert_eq!(link.port.writes.len(), 1);
        let (sequence, command, body) = decode_request(&link.port.writes[0]);
        assert_eq!(sequence, 1);
        assert_eq!(command, 5);
        assert!(body.is_empty());
    }

    #[test]
    fn test_corrupt_response_is_retried_with_same_sequence() {
        let mut corrupt = response_packet(0, AckReason::Ack, &[]);
        corrupt[0] ^= 0xFF;
        let mut link = link(vec![Reply::Raw(slip::encode(&corrupt)), ack()]);

        link.execute(&Request::erase_all()).unwrap();

        assert_eq!(link.port.writes.len(), 2);
        assert_eq!(link.port.writes[0], link.port.writes[1]);
        let (sequence, _, _) = decode_request(&link.port.writes[1]);
        assert_eq!(sequence, 1);
    }

    #[test]
    fn test_nack_invalid_crc_triggers_retransmission() {
        let mut link = link(vec![nack(AckReason::NackInvalidCrc), ack()]);
        link.execute(&Request::page_erase(0x1000)).unwrap();
        assert_eq!(link.port.writes.len(), 2);
        assert_eq!(link.port.writes[0], link.port.writes[1]);
    }

    #[test]
    fn test_rejection_is_final_and_not_retried() {
        let mut link = link(vec![nack(AckReason::NackPageProtected), ack()]);
        let err = link.execute(&Request::page_erase(0)).unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected(AckReason::NackPageProtected)
        ));
        assert_eq!(link.port.writes.len(), 1);
    }

    #[test]
    fn test_silence_exhausts_retry_budget() {
        let mut link = link(vec![Reply::Silence, Reply::Silence, Reply::Silence]);
        let err = link.execute(&Request::reset()).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(link.port.writes.len(), 3);
    }

    #[test]
    fn test_sequence_advances_once_per_transaction() {
        let mut link = link(vec![ack(), ack()]);
        link.execute(&Request::reset()).unwrap();
        link.execute(&Request::reset()).unwrap();
        let first = decode_request(&link.port.writes[0]).0;
        let second = decode_request(&link.port.writes[1]).0;
        assert_eq!((first, second), (1, 2));
    }

    #[test]
    fn test_sequence_cycle_skips_255() {
        let mut link = link(vec![]);
        let values: Vec<u8> = (0..255).map(|_| link.advance_sequence()).collect();
        assert_eq!(values[0], 1);
        assert_eq!(values[253], 254);
        // 255 is skipped; the counter lands back on 0.
        assert_eq!(values[254], 0);
        assert_eq!(link.advance_sequence(), 1);
    }

    #[test]
    fn test_wrap_boundary_at_254() {
        let mut link = link(vec![]);
        link.seq_no = 253;
        assert_eq!(link.advance_sequence(), 254);
        assert_eq!(link.advance_sequence(), 0);
    }

    fn device_info_payload() -> Vec<u8> {
        let mut payload = Vec::new();
        for value in [0x0005_2840u32, 0x4141_4141, 0x0010_0000, 4096, 0x308] {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        payload
    }

    fn version_payload() -> Vec<u8> {
        let mut payload = 1u32.to_le_bytes().to_vec();
        // patch, minor, major, reserved
        payload.extend_from_slice(&[3, 7, 1, 0]);
        payload
    }

    #[test]
    fn test_open_builds_descriptor_from_bootstrap_queries() {
        let port = MockPort::new(vec![
            ack_with(&device_info_payload()),
            ack_with(&version_payload()),
        ]);
        let session = Session::open(port, test_config()).unwrap();

        let descriptor = session.descriptor();
        assert_eq!(descriptor.part, 0x0005_2840);
        assert_eq!(descriptor.variant, 0x4141_4141);
        assert_eq!(descriptor.flash_size, 0x0010_0000);
        assert_eq!(descriptor.page_size, 4096);
        assert_eq!(descriptor.uicr_size, 0x308);
        assert_eq!(descriptor.protocol_version, 1);
        assert_eq!(session.firmware_version(), "1.7.3");

        let writes = &session.test_port().writes;
        assert_eq!(writes.len(), 2);
        assert_eq!(decode_request(&writes[0]).1, 10);
        assert_eq!(decode_request(&writes[1]).1, 9);
    }

    #[test]
    fn test_open_fails_without_a_session_when_device_is_silent() {
        let port = MockPort::new(vec![]);
        let err = Session::open(port, test_config()).unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));
    }

    #[test]
    fn test_open_rejects_short_device_info() {
        let port = MockPort::new(vec![ack_with(&[0u8; 8]), ack_with(&version_payload())]);
        let err = Session::open(port, test_config()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
