//! Recovery bootloader wire protocol.

pub mod packet;
pub mod slip;

// Re-export common types
pub use packet::{AckReason, Command, Request, Response};

/// Start address of the MBR flash page.
pub const MBR_ADDRESS: u32 = 0;

/// Size of the reserved MBR region in bytes.
pub const MBR_SIZE: u32 = 4096;

/// Size of the bootloader's own reserved flash in bytes.
pub const BOOTLOADER_SIZE: u32 = 4096;

/// Base address of the UICR configuration region.
pub const UICR_BASE_ADDRESS: u32 = 0x1000_1000;

/// Address of the APPROTECT read-protection register.
pub const APPROTECT_ADDRESS: u32 = UICR_BASE_ADDRESS + 0x208;

/// Baud rate the recovery bootloader listens at.
pub const DEFAULT_BAUD: u32 = 115_200;
