//! Device-specific workarounds keyed on vendor/product/bcdDevice.

use std::ops::{BitOr, BitOrAssign};

const VENDOR_LEAFLABS: u16 = 0x1eaf;
const PRODUCT_MAPLE3: u16 = 0x0003; /* rev 3 and 5 */
const VENDOR_GIGADEVICE: u16 = 0x28e9;
const PRODUCT_GD32: u16 = 0x0189; /* GD32VF103 rev 1 */
const VENDOR_ARTERY: u16 = 0x2e3c;
const PRODUCT_AT32: u16 = 0xdf11;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Quirks(u16);

impl Quirks {
    /// Reports wrong DFU version in the functional descriptor.
    pub const FORCE_DFU11: Quirks = Quirks(1 << 0);
    /// Serial number string descriptor is raw UTF-8, not UTF-16LE.
    pub const UTF8_SERIAL: Quirks = Quirks(1 << 1);
    /// Advertised DfuSe memory layout does not match the hardware.
    pub const DFUSE_LAYOUT: Quirks = Quirks(1 << 2);
    /// Device may leave DFU mode without answering the leave request.
    pub const DFUSE_LEAVE: Quirks = Quirks(1 << 3);

    pub fn detect(vendor: u16, product: u16, bcd_device: u16) -> Quirks {
        let mut quirks = Quirks::default();

        if vendor == VENDOR_LEAFLABS
            && product == PRODUCT_MAPLE3
            && bcd_device == 0x0200
        {
            quirks |= Quirks::FORCE_DFU11;
        }

        /* Some GD32VF103 encode their serial number in UTF-8 */
        if vendor == VENDOR_GIGADEVICE && product == PRODUCT_GD32 {
            quirks |= Quirks::UTF8_SERIAL;
            quirks |= Quirks::DFUSE_LAYOUT;
        }

        if vendor == VENDOR_ARTERY && product == PRODUCT_AT32 {
            quirks |= Quirks::DFUSE_LEAVE;
        }

        quirks
    }

    pub fn contains(self, other: Quirks) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Quirks {
    type Output = Quirks;

    fn bitor(self, rhs: Quirks) -> Quirks {
        Quirks(self.0 | rhs.0)
    }
}

impl BitOrAssign for Quirks {
    fn bitor_assign(&mut self, rhs: Quirks) {
        self.0 |= rhs.0;
    }
}
