//! Intel HEX firmware images.
//!
//! An image is parsed into an ordered list of address-contiguous memory
//! segments. Record-level base addressing (extended linear and extended
//! segment records) is resolved here, so downstream code only ever sees
//! absolute 32-bit addresses.

use crate::error::{Error, Result};
use ihex::Record;
use std::fs;
use std::path::Path;

/// A contiguous run of firmware bytes at an absolute address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Absolute start address.
    pub address: u32,
    /// Segment contents.
    pub data: Vec<u8>,
}

impl Segment {
    /// Address one past the last byte of the segment.
    #[allow(clippy::cast_possible_truncation)] // segment sizes fit flash
    pub fn end_address(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

/// A parsed firmware image: ascending, merged memory segments.
#[derive(Debug, Clone, Default)]
pub struct FirmwareImage {
    segments: Vec<Segment>,
}

impl FirmwareImage {
    /// Parse an Intel HEX file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_hex_str(&text)
    }

    /// Parse Intel HEX text.
    pub fn from_hex_str(text: &str) -> Result<Self> {
        let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut linear_base: u32 = 0;
        let mut segment_base: u32 = 0;

        for record in ihex::Reader::new(text) {
            let record = record.map_err(|e| Error::InvalidImage(e.to_string()))?;
            match record {
                Record::Data { offset, value } => {
                    let address = linear_base
                        .wrapping_add(segment_base)
                        .wrapping_add(u32::from(offset));
                    chunks.push((address, value));
                }
                Record::EndOfFile => break,
                Record::ExtendedSegmentAddress(base) => {
                    segment_base = u32::from(base) * 16;
                }
                Record::ExtendedLinearAddress(base) => {
                    linear_base = u32::from(base) << 16;
                }
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
            }
        }

        Ok(Self::from_chunks(chunks))
    }

    /// Build an image from raw (address, data) pairs; useful when the
    /// firmware comes from somewhere other than a hex file.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self::from_chunks(
            segments
                .into_iter()
                .map(|segment| (segment.address, segment.data))
                .collect(),
        )
    }

    fn from_chunks(mut chunks: Vec<(u32, Vec<u8>)>) -> Self {
        chunks.sort_by_key(|(address, _)| *address);

        let mut segments: Vec<Segment> = Vec::new();
        for (address, data) in chunks {
            if data.is_empty() {
                continue;
            }
            match segments.last_mut() {
                Some(last) if last.end_address() == address => {
                    last.data.extend_from_slice(&data);
                }
                _ => segments.push(Segment { address, data }),
            }
        }
        Self { segments }
    }

    /// Memory segments in ascending address order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total number of firmware bytes across all segments.
    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|segment| segment.data.len()).sum()
    }

    /// Whether the image carries no data at all.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
