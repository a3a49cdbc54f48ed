//! The thin set of USB operations the protocol engine invokes.

use std::time::Duration;

use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::DEFAULT_TIMEOUT;
use crate::error::DfuError;

/// Transport seam between the DFU engine and the USB stack.
///
/// All DFU class requests are control transfers with recipient
/// interface; the trait narrows the stack to exactly those plus the
/// millisecond sleep the status polls need, so the engine can be
/// exercised against a scripted device in tests.
pub trait DfuTransport {
    fn class_in(
        &self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError>;

    fn class_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError>;

    /// Switch the claimed interface to another alt setting.
    fn select_alt(&self, alt_setting: u8) -> Result<(), DfuError>;

    fn sleep_ms(&self, ms: u32) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
    }
}

pub struct NusbTransport {
    interface: nusb::Interface,
}

impl NusbTransport {
    pub fn new(interface: nusb::Interface) -> Self {
        NusbTransport { interface }
    }
}

impl DfuTransport for NusbTransport {
    fn class_in(
        &self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }

    fn class_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }

    fn select_alt(&self, alt_setting: u8) -> Result<(), DfuError> {
        Ok(self.interface.set_alt_setting(alt_setting).wait()?)
    }
}
