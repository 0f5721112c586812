//! # recoflash
//!
//! A library for recovering bricked devices through their always-present
//! serial recovery bootloader.
//!
//! Even when the application firmware and its regular update path are
//! unusable, the recovery bootloader keeps listening on the UART. This
//! crate speaks its framed protocol and provides:
//!
//! - CRC32-validated command packets over SLIP framing
//! - A retrying transaction engine with strict sequence-number discipline
//! - Session bootstrap that captures the device's flash geometry
//! - Flash programming from Intel HEX images, with MBR exclusion,
//!   page-aligned erase and post-write verification
//! - UICR register access, including application read protection
//!
//! ## Example
//!
//! ```rust,no_run
//! use recoflash::{FirmwareImage, NativePort, SerialConfig, Session, SessionConfig};
//!
//! fn main() -> recoflash::Result<()> {
//!     // Parse the firmware image
//!     let image = FirmwareImage::from_file("firmware.hex")?;
//!
//!     // Open the port and bootstrap a session
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115_200))?;
//!     let mut session = Session::open(port, SessionConfig::default())?;
//!
//!     // Program, verify, restart
//!     session.flash_image(&image)?;
//!     session.verify_image(&image)?;
//!     session.reset()?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

mod flasher;

// Re-exports for convenience
pub use {
    error::{Error, Result},
    image::{FirmwareImage, Segment},
    port::{list_ports, NativePort, Port, PortInfo, SerialConfig},
    protocol::{
        packet::{AckReason, Command, Request, Response},
        APPROTECT_ADDRESS, DEFAULT_BAUD, MBR_SIZE, UICR_BASE_ADDRESS,
    },
    session::{DeviceDescriptor, Session, SessionConfig},
};
