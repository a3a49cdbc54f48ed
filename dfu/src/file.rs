//! Firmware file accessor: raw bytes plus whatever the 16-byte DFU
//! suffix declares about the intended device.

use std::path::Path;

use crc_any::CRCu32;
use log::{info, warn};

use crate::error::DfuError;

const SUFFIX_LEN: usize = 16;
/// "DFU" reversed, as stored in the suffix signature field.
const SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";

/// Wildcard vendor/product/device id in a DFU suffix.
pub const ID_ANY: u16 = 0xffff;

#[derive(Debug)]
pub struct DfuFile {
    pub data: Vec<u8>,
    pub prefix_len: usize,
    pub suffix_len: usize,
    pub vendor: u16,
    pub product: u16,
    pub bcd_device: u16,
    pub bcd_dfu: u16,
}

impl DfuFile {
    pub fn load(path: &Path) -> Result<Self, DfuError> {
        Ok(Self::from_bytes(std::fs::read(path)?))
    }

    /// Probe the trailing DFU suffix. Files without one (or with a bad
    /// CRC) are treated as raw firmware matching any device.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut file = DfuFile {
            data,
            prefix_len: 0,
            suffix_len: 0,
            vendor: ID_ANY,
            product: ID_ANY,
            bcd_device: ID_ANY,
            bcd_dfu: 0,
        };

        let len = file.data.len();
        if len < SUFFIX_LEN {
            return file;
        }
        let tail = &file.data[len - SUFFIX_LEN..];
        if &tail[8..11] != SUFFIX_SIGNATURE {
            return file;
        }
        let suffix_len = tail[11] as usize;
        if suffix_len < SUFFIX_LEN || suffix_len > len {
            warn!("Unsupported DFU suffix length {}", suffix_len);
            return file;
        }

        let stored_crc = u32::from_le_bytes([
            tail[12], tail[13], tail[14], tail[15],
        ]);
        let mut crc = CRCu32::crc32();
        crc.digest(&file.data[..len - 4]);
        // The suffix stores the complement of CRC-32/ISO-HDLC
        if stored_crc != crc.get_crc() ^ 0xffff_ffff {
            warn!("Invalid DFU suffix CRC, ignoring suffix");
            return file;
        }

        file.suffix_len = suffix_len;
        file.bcd_device = u16::from_le_bytes([tail[0], tail[1]]);
        file.product = u16::from_le_bytes([tail[2], tail[3]]);
        file.vendor = u16::from_le_bytes([tail[4], tail[5]]);
        file.bcd_dfu = u16::from_le_bytes([tail[6], tail[7]]);
        info!(
            "DFU suffix: version {:04x}, device {:04x}:{:04x}",
            file.bcd_dfu, file.vendor, file.product
        );
        file
    }

    /// The firmware bytes between prefix and suffix.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.prefix_len..self.data.len() - self.suffix_len]
    }

    /// A `bcdDFU` of 0x011a marks a DfuSe container.
    pub fn is_dfuse(&self) -> bool {
        self.bcd_dfu == 0x011a
    }
}
