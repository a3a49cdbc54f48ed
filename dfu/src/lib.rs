//! USB Device Firmware Upgrade (DFU) host implementation based on
//! [`nusb`]
//!
//! Covers the baseline DFU 1.0/1.1 protocol and the STM32 extensions
//! (aka "DfuSe"): device discovery with quirk handling, the class-level
//! state machine with its transfer loops, the DfuSe special commands
//! with per-page erase, and the DfuSe file container format.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//! - DfuSe file format: STMicroelectronics UM0391
//!
//! # Example
//!
//! Enumerating DFU-capable alt-settings:
//! ```no_run
//! use dfu::{probe_devices, DeviceMatch};
//!
//! let interfaces = probe_devices(&DeviceMatch::default()).unwrap();
//! for intf in &interfaces {
//!     println!(
//!         "[{:04x}:{:04x}] alt={} name={:?}",
//!         intf.vendor(),
//!         intf.product(),
//!         intf.alt_setting(),
//!         intf.alt_name(),
//!     );
//! }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

extern crate alloc;

use std::time::Duration;

/// Timeout for all DFU control transfers.
pub(crate) const DEFAULT_TIMEOUT: Duration =
    Duration::from_millis(5000u64);

/// wValue of a DFU_DETACH request: how long the device waits for the
/// follow-up reset.
pub const DETACH_TIMEOUT_MS: u16 = 1000;

mod connection;
mod descriptor;
mod dfuse;
mod dfuse_file;
mod error;
mod file;
mod interface;
mod load;
mod matching;
mod memory;
mod probe;
mod quirks;
mod status;
mod transport;

// Re-exports
pub use connection::{negotiate_transfer_size, DfuConnection};
pub use descriptor::{DfuDescriptor, DFUSE_VERSION_NUMBER};
pub use dfuse::{
    Dfuse, DfuseAlt, DfuseCommand, DfuseDevice, DfuseOptions,
};
pub use dfuse_file::{DfuseElement, DfuseImage, DfuseTarget};
pub use error::DfuError;
pub use file::{DfuFile, ID_ANY};
pub use interface::DfuInterface;
pub use load::{do_dnload, do_upload, NullProgress, Progress};
pub use matching::{DeviceMatch, MatchValue};
pub use memory::{
    fixup_layout, parse_memory_layout, DfuMemory, MemorySegment,
};
pub use probe::{device_path, probe_devices};
pub use quirks::Quirks;
pub use status::{status_to_string, DfuState, DfuStatus, DFU_STATUS_OK};
pub use transport::{DfuTransport, NusbTransport};
