//! The DFU class requests and host-side state machine helpers.

use std::time::Instant;

use log::{debug, info, warn};

use crate::descriptor::DfuDescriptor;
use crate::error::DfuError;
use crate::status::{DfuState, DfuStatus};
use crate::transport::DfuTransport;

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_GETSTATE: u8 = 5;
const DFU_ABORT: u8 = 6;

const DFU_STATUS_LEN: u16 = 6;

/// Cap on the abort-to-idle poll loop; devices are expected to settle
/// well within this.
const ABORT_TO_IDLE_TIMEOUT_MS: u128 = 4000;

/// Largest transfer the Linux kernel accepts in one control URB.
const LINUX_MAX_TRANSFER_SIZE: u16 = 4096;

pub struct DfuConnection<T: DfuTransport> {
    transport: T,
}

impl<T: DfuTransport> DfuConnection<T> {
    pub fn new(transport: T) -> Self {
        DfuConnection { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn sleep_ms(&self, ms: u32) {
        self.transport.sleep_ms(ms);
    }

    pub fn select_alt(&self, alt_setting: u8) -> Result<(), DfuError> {
        self.transport.select_alt(alt_setting)
    }

    /// DFU_DETACH. `timeout_ms` goes out in wValue; it is the time the
    /// device will wait for the subsequent reset, not a transfer
    /// timeout.
    pub fn detach(&self, timeout_ms: u16) -> Result<(), DfuError> {
        self.transport.class_out(DFU_DETACH, timeout_ms, &[])
    }

    /// DFU_DNLOAD with the given transaction number. An empty payload
    /// signals end of transfer.
    pub fn dnload(
        &self,
        transaction: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        self.transport.class_out(DFU_DNLOAD, transaction, data)
    }

    /// DFU_UPLOAD of at most `length` bytes. A short read marks the
    /// final block.
    pub fn upload(
        &self,
        transaction: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        self.transport.class_in(DFU_UPLOAD, transaction, length)
    }

    pub fn get_status(&self) -> Result<DfuStatus, DfuError> {
        let data =
            self.transport.class_in(DFU_GETSTATUS, 0, DFU_STATUS_LEN)?;
        let status = DfuStatus::from_raw(&data)?;
        debug!(
            "DFU state({}) = {}, status({}) = {}",
            status.state.to_u8(),
            status.state.name(),
            status.status,
            crate::status::status_to_string(status.status),
        );
        Ok(status)
    }

    pub fn get_state(&self) -> Result<DfuState, DfuError> {
        let data = self.transport.class_in(DFU_GETSTATE, 0, 1)?;
        match data.first() {
            Some(&b) => Ok(DfuState::from(b)),
            None => Err(DfuError::Data(
                "Empty DFU_GETSTATE response".into(),
            )),
        }
    }

    pub fn clear_status(&self) -> Result<(), DfuError> {
        self.transport.class_out(DFU_CLRSTATUS, 0, &[])
    }

    pub fn abort(&self) -> Result<(), DfuError> {
        self.transport.class_out(DFU_ABORT, 0, &[])
    }

    /// Normalize to dfuIDLE: abort, then poll until the device settles.
    /// Used defensively before and after transfer operations.
    pub fn abort_to_idle(&self) -> Result<(), DfuError> {
        self.abort()?;
        let start = Instant::now();
        loop {
            let status = self.get_status()?;
            if status.state == DfuState::DfuIdle {
                return status.ok();
            }
            if start.elapsed().as_millis() >= ABORT_TO_IDLE_TIMEOUT_MS {
                warn!("Device did not reach dfuIDLE after abort");
                return Err(DfuError::Timeout);
            }
            self.sleep_ms(status.poll_timeout);
        }
    }
}

/// Pick the chunk size for transfer loops: the device-reported
/// `wTransferSize` unless overridden by the user, clamped to the Linux
/// URB limit and floored at `bMaxPacketSize0`.
pub fn negotiate_transfer_size(
    func_dfu: &DfuDescriptor,
    user_size: Option<u16>,
    max_packet_size0: u8,
) -> Result<u16, DfuError> {
    let device_size = func_dfu.transfer_size();
    let mut size = if device_size != 0 {
        info!("Device returned transfer size {}", device_size);
        match user_size {
            Some(user) => {
                warn!("Overriding device-reported transfer size");
                user
            }
            None => device_size,
        }
    } else {
        user_size.ok_or(DfuError::MissingTransferSize)?
    };

    if cfg!(target_os = "linux") && size > LINUX_MAX_TRANSFER_SIZE {
        size = LINUX_MAX_TRANSFER_SIZE;
        info!("Limited transfer size to {}", size);
    }

    if size < max_packet_size0 as u16 {
        size = max_packet_size0 as u16;
        info!("Adjusted transfer size to {}", size);
    }

    Ok(size)
}
