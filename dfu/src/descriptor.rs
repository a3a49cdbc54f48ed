use log::{info, warn};

pub(crate) const DFU_DESC_TYPE: u8 = 0x21;
pub(crate) const DFU_DESC_LEN: usize = 9;

pub const DFUSE_VERSION_NUMBER: u16 = 0x11a;

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3
/// of the DFU 1.1 specification. Some bootloaders ship a 7-byte DFU 1.0
/// descriptor or none at all; [DfuDescriptor::from_bytes] and
/// [DfuDescriptor::runtime_fallback] cover those.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DfuDescriptor {
    length: u8,
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl DfuDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    /// Parse a located functional descriptor, applying the
    /// compatibility rules for short descriptors.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut desc = DfuDescriptor {
            length: raw.first().copied().unwrap_or(0),
            ..Default::default()
        };
        if raw.len() >= DFU_DESC_LEN {
            desc.attributes = raw[2];
            desc.detach_timeout =
                (raw[4] as u16) << 8 | (raw[3] as u16);
            desc.transfer_size = (raw[6] as u16) << 8 | (raw[5] as u16);
            desc.dfu_version = (raw[8] as u16) << 8 | (raw[7] as u16);
        } else if raw.len() > 2 {
            desc.attributes = raw[2];
        }
        if desc.length == 7 {
            info!(
                "Deducing device DFU version from functional descriptor length"
            );
            desc.dfu_version = 0x0100;
        } else if (desc.length as usize) < DFU_DESC_LEN {
            warn!("Error obtaining DFU functional descriptor");
            warn!("Warning: Assuming DFU version 1.0");
            desc.dfu_version = 0x0100;
            warn!("Warning: Transfer size can not be detected");
            desc.transfer_size = 0;
        }
        desc
    }

    /// Synthesized descriptor for devices that expose a DFU interface
    /// but no functional descriptor at all.
    pub fn runtime_fallback() -> Self {
        DfuDescriptor {
            length: 7,
            dfu_version: 0x0100,
            ..Default::default()
        }
    }

    /// Applied for the `forceDfu11` quirk.
    pub fn force_version(&mut self, version: u16) {
        self.dfu_version = version;
    }

    #[doc(alias = "bLength")]
    pub fn length(&self) -> u8 {
        self.length
    }

    #[doc(alias = "bmAttributes")]
    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue
    /// a USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Time, in milliseconds, that the device will wait after receipt of
    /// the `DFU_DETACH` request (`wDetachTimeOut`).
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per
    /// control-write transaction (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU
    /// Specification release (`bcdDFUVersion`).
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}
