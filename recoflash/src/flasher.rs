//! Flash programming and verification on top of the transaction engine.
//!
//! The algorithm walks a parsed firmware image in ascending address order
//! and turns every segment into erase/write/verify transactions that
//! respect the flash geometry reported by the device: the reserved MBR
//! page is never touched, pages are erased exactly when a write chunk
//! lands on a page boundary, and every write is checked after the fact
//! (device-side CRC for flash, byte-exact readback for UICR).

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::port::Port;
use crate::protocol::packet::{AckReason, Request, pad_to_word};
use crate::protocol::{
    APPROTECT_ADDRESS, BOOTLOADER_SIZE, MBR_ADDRESS, MBR_SIZE, UICR_BASE_ADDRESS,
};
use crate::session::Session;
use log::{debug, info};

/// First writable flash address; everything below belongs to the MBR.
const MBR_END: u32 = MBR_ADDRESS + MBR_SIZE;

/// APPROTECT register value enabling read protection.
const APPROTECT_ENABLE: [u8; 4] = [0x00, 0xFF, 0xFF, 0xFF];

impl<P: Port> Session<P> {
    /// Program a parsed firmware image.
    ///
    /// Segments are processed in ascending address order; segments above
    /// the UICR base take the UICR path, everything else the flash path.
    pub fn flash_image(&mut self, image: &FirmwareImage) -> Result<()> {
        self.flash_image_with_progress(image, |_, _| {})
    }

    /// Program a parsed firmware image, reporting `(bytes done, bytes
    /// total)` after every chunk.
    pub fn flash_image_with_progress<F>(
        &mut self,
        image: &FirmwareImage,
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let total = image.total_bytes();
        let mut done = 0usize;

        for segment in image.segments() {
            let base = done;
            let span = segment.data.len();
            let mut tick = |written: usize| progress(base + written.min(span), total);

            if segment.address > UICR_BASE_ADDRESS {
                self.flash_uicr_with(segment.address, &segment.data, &mut tick)?;
            } else {
                self.flash_segment_with(segment.address, &segment.data, &mut tick)?;
            }

            done += span;
            progress(done, total);
        }

        info!("programmed {total} bytes in {} segments", image.segments().len());
        Ok(())
    }

    /// Write one segment to flash and verify it by CRC.
    pub fn flash_segment(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.flash_segment_with(address, data, &mut |_| {})
    }

    #[allow(clippy::cast_possible_truncation)] // chunk offsets fit flash addresses
    fn flash_segment_with(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        let mut data = pad_to_word(data);
        let mut address = address;

        // The MBR page is never reprogrammed; drop any bytes below it.
        if address < MBR_END {
            if address as u64 + data.len() as u64 <= u64::from(MBR_END) {
                debug!("segment at {address:#010x} lies inside the reserved MBR page, skipping");
                return Ok(());
            }
            data.drain(..(MBR_END - address) as usize);
            address = MBR_END;
        }

        let chunk_size = self.config().chunk_size;
        let page_size = self.descriptor().page_size;
        debug!("writing {} bytes at {address:#010x}", data.len());

        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            let chunk_address = address + (index * chunk_size) as u32;
            if chunk_address % page_size == 0 {
                debug!("erasing page {chunk_address:#010x}");
                self.execute(&Request::page_erase(chunk_address))?;
            }
            self.execute(&Request::data_write(chunk_address, chunk))?;
            progress(index * chunk_size + chunk.len());
        }

        self.check_flash_crc(address, &data)
    }

    /// Write one segment to the UICR region and verify it by readback.
    ///
    /// The APPROTECT register is special-cased: the device answers
    /// `NackApprotectOn` for it once protection is already active, which
    /// counts as success for that register alone.
    pub fn flash_uicr(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.flash_uicr_with(address, data, &mut |_| {})
    }

    fn flash_uicr_with(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        match self.write_uicr_verified(address, data, progress) {
            Err(Error::Rejected(AckReason::NackApprotectOn)) if address == APPROTECT_ADDRESS => {
                debug!("APPROTECT already active, treating write as done");
                Ok(())
            }
            other => other,
        }
    }

    #[allow(clippy::cast_possible_truncation)] // chunk offsets fit UICR addresses
    fn write_uicr_verified(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        let data = pad_to_word(data);
        let chunk_size = self.config().chunk_size;
        debug!("writing {} UICR bytes at {address:#010x}", data.len());

        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            let chunk_address = address + (index * chunk_size) as u32;
            self.execute(&Request::uicr_write(chunk_address, chunk))?;
            progress(index * chunk_size + chunk.len());
        }

        let readback = self.read_uicr(address, data.len() as u32)?;
        if readback != data {
            return Err(Error::Verification {
                address,
                length: data.len(),
            });
        }
        Ok(())
    }

    /// Verify device contents against a parsed firmware image.
    ///
    /// Flash segments are compared by device-reported CRC over the same
    /// padded bytes programming would write; UICR segments byte by byte.
    pub fn verify_image(&mut self, image: &FirmwareImage) -> Result<()> {
        for segment in image.segments() {
            if segment.address > UICR_BASE_ADDRESS {
                self.verify_uicr_segment(segment.address, &segment.data)?;
            } else {
                self.verify_flash_segment(segment.address, &segment.data)?;
            }
        }
        info!("verified {} bytes", image.total_bytes());
        Ok(())
    }

    fn verify_flash_segment(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut data = pad_to_word(data);
        let mut address = address;

        if address < MBR_END {
            if address as u64 + data.len() as u64 <= u64::from(MBR_END) {
                return Ok(());
            }
            data.drain(..(MBR_END - address) as usize);
            address = MBR_END;
        }

        self.check_flash_crc(address, &data)
    }

    #[allow(clippy::cast_possible_truncation)] // segment sizes fit flash
    fn verify_uicr_segment(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let data = pad_to_word(data);
        let readback = self.read_uicr(address, data.len() as u32)?;
        if readback != data {
            return Err(Error::Verification {
                address,
                length: data.len(),
            });
        }
        Ok(())
    }

    /// Ask the device for the CRC of a flash area and compare it against
    /// the locally computed one.
    #[allow(clippy::cast_possible_truncation)] // segment sizes fit flash
    fn check_flash_crc(&mut self, address: u32, expected: &[u8]) -> Result<()> {
        let response = self.execute(&Request::crc_check(address, expected.len() as u32))?;
        let reported = response
            .result_u32()
            .ok_or_else(|| Error::Protocol("CRC check response too short".into()))?;
        let local = crc32fast::hash(expected);

        if reported != local {
            debug!(
                "CRC mismatch at {address:#010x}: device {reported:#010x}, local {local:#010x}"
            );
            return Err(Error::Verification {
                address,
                length: expected.len(),
            });
        }
        Ok(())
    }

    /// Erase all application flash page by page, leaving the reserved MBR
    /// and bootloader region untouched.
    pub fn chip_flash_erase(&mut self) -> Result<()> {
        self.chip_flash_erase_with_progress(|_, _| {})
    }

    /// Page-by-page erase with a `(pages done, pages total)` callback.
    pub fn chip_flash_erase_with_progress<F>(&mut self, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let page_size = self.descriptor().page_size;
        let flash_size = self.descriptor().flash_size;
        let first = MBR_ADDRESS + MBR_SIZE + BOOTLOADER_SIZE;
        let total = ((flash_size - first) / page_size) as usize;

        info!("erasing flash pages {first:#010x}..{flash_size:#010x}");
        let mut address = first;
        let mut done = 0usize;
        while address < flash_size {
            self.execute(&Request::page_erase(address))?;
            address += page_size;
            done += 1;
            progress(done, total);
        }
        Ok(())
    }

    /// Erase all available flash and the UICR page in one transaction.
    pub fn erase_all(&mut self) -> Result<()> {
        info!("erasing all flash and UICR");
        self.execute(&Request::erase_all()).map(drop)
    }

    /// Erase the UICR page.
    pub fn erase_uicr(&mut self) -> Result<()> {
        info!("erasing UICR");
        self.execute(&Request::uicr_erase()).map(drop)
    }

    /// Erase the flash page at the given address.
    pub fn erase_page(&mut self, page_address: u32) -> Result<()> {
        info!("erasing page {page_address:#010x}");
        self.execute(&Request::page_erase(page_address)).map(drop)
    }

    /// Reset the device, leaving the recovery bootloader.
    pub fn reset(&mut self) -> Result<()> {
        info!("resetting device");
        self.execute(&Request::reset()).map(drop)
    }

    /// Read a range of UICR registers.
    pub fn read_uicr(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        let response = self.execute(&Request::uicr_read(address, length))?;
        Ok(response.read_payload().to_vec())
    }

    /// Read a range of flash.
    pub fn read_data(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        let response = self.execute(&Request::data_read(address, length))?;
        Ok(response.read_payload().to_vec())
    }

    /// Enable application read protection by clearing the APPROTECT
    /// register. Succeeds if protection is already active.
    pub fn protect_application(&mut self) -> Result<()> {
        info!("enabling application read protection");
        self.flash_uicr(APPROTECT_ADDRESS, &APPROTECT_ENABLE)
    }
}
