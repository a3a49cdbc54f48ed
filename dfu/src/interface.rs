//! One matched DFU alt-setting and its USB resources.

use nusb::MaybeFuture;

use crate::connection::DfuConnection;
use crate::descriptor::DfuDescriptor;
use crate::error::DfuError;
use crate::memory::{self, DfuMemory};
use crate::quirks::Quirks;
use crate::transport::NusbTransport;

/// A DFU-capable alt-setting found by [crate::probe_devices], carrying
/// everything the engine needs to talk to it. The device handle is
/// opened lazily and dropped with the interface.
pub struct DfuInterface {
    pub(crate) info: nusb::DeviceInfo,
    pub(crate) device: Option<nusb::Device>,
    pub(crate) vendor: u16,
    pub(crate) product: u16,
    pub(crate) bcd_device: u16,
    pub(crate) configuration: u8,
    pub(crate) interface: u8,
    pub(crate) alt_setting: u8,
    pub(crate) devnum: u8,
    pub(crate) path: String,
    pub(crate) max_packet_size0: u8,
    pub(crate) alt_name: String,
    pub(crate) serial_name: String,
    pub(crate) dfu_mode: bool,
    pub(crate) multiple_alt: bool,
    pub(crate) func_dfu: DfuDescriptor,
    pub(crate) quirks: Quirks,
    pub(crate) layout: Option<DfuMemory>,
}

impl DfuInterface {
    pub fn vendor(&self) -> u16 {
        self.vendor
    }
    pub fn product(&self) -> u16 {
        self.product
    }
    pub fn bcd_device(&self) -> u16 {
        self.bcd_device
    }
    pub fn configuration(&self) -> u8 {
        self.configuration
    }
    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    pub fn devnum(&self) -> u8 {
        self.devnum
    }
    pub fn path(&self) -> &str {
        &self.path
    }
    pub fn max_packet_size0(&self) -> u8 {
        self.max_packet_size0
    }
    pub fn alt_name(&self) -> &str {
        &self.alt_name
    }
    pub fn serial_name(&self) -> &str {
        &self.serial_name
    }
    pub fn is_dfu_mode(&self) -> bool {
        self.dfu_mode
    }
    pub fn has_multiple_alts(&self) -> bool {
        self.multiple_alt
    }
    pub fn func_dfu(&self) -> &DfuDescriptor {
        &self.func_dfu
    }
    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// True when `other` is another alt-setting of the same interface
    /// on the same device.
    pub fn same_interface(&self, other: &DfuInterface) -> bool {
        self.info.id() == other.info.id()
            && self.configuration == other.configuration
            && self.interface == other.interface
    }

    pub fn layout(&self) -> Option<&DfuMemory> {
        self.layout.as_ref()
    }

    /// Parse (and quirk-fix) the memory layout advertised in the
    /// alt-setting name. Cached after the first call.
    pub fn parse_layout(&mut self) -> Result<&DfuMemory, DfuError> {
        if self.layout.is_none() {
            let mut layout = memory::parse_memory_layout(&self.alt_name)
                .ok_or(DfuError::NoMemoryLayout(self.alt_setting))?;
            memory::fixup_layout(
                self.vendor,
                self.product,
                self.quirks,
                &self.alt_name,
                &mut layout,
            );
            self.layout = Some(layout);
        }
        self.layout
            .as_ref()
            .ok_or(DfuError::NoMemoryLayout(self.alt_setting))
    }

    pub fn open(&mut self) -> Result<&nusb::Device, DfuError> {
        if self.device.is_none() {
            self.device = Some(self.info.open().wait()?);
        }
        // just opened above
        Ok(self.device.as_ref().unwrap())
    }

    /// Claim the interface for exclusive use and wrap it in a protocol
    /// connection. The claim is released when the connection drops.
    pub fn claim(
        &mut self,
    ) -> Result<DfuConnection<NusbTransport>, DfuError> {
        let interface_number = self.interface;
        let device = self.open()?.clone();
        let interface =
            device.claim_interface(interface_number).wait()?;
        Ok(DfuConnection::new(NusbTransport::new(interface)))
    }

    pub fn usb_reset(&mut self) -> Result<(), DfuError> {
        self.open()?.reset().wait()?;
        Ok(())
    }

    /// Drop the device handle; keeping handles open can prevent
    /// re-enumeration after a detach.
    pub fn close(&mut self) {
        self.device = None;
    }
}
