//! The 6-byte DFU_GETSTATUS record and the DFU state set.

use crate::error::DfuError;

pub const DFU_STATUS_OK: u8 = 0x00;

const STATUS_NAMES: [&str; 16] = [
    "No error condition is present",
    "File is not targeted for use by this device",
    "File is for this device but fails some vendor-specific test",
    "Device is unable to write memory",
    "Memory erase function failed",
    "Memory erase check failed",
    "Program memory function failed",
    "Programmed memory failed verification",
    "Cannot program memory due to received address that is out of range",
    "Received DFU_DNLOAD with wLength = 0, but device does not think that it has all data yet",
    "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations",
    "iString indicates a vendor specific error",
    "Device detected unexpected USB reset signalling",
    "Device detected unexpected power on reset",
    "Something went wrong, but the device does not know what it was",
    "Device stalled an unexpected request",
];

pub fn status_to_string(status: u8) -> &'static str {
    STATUS_NAMES
        .get(status as usize)
        .copied()
        .unwrap_or("INVALID")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnloadBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    /// A state byte outside the DFU 1.1 state set. Never satisfies a
    /// poll-loop exit condition; surfaces as a protocol error.
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(value: u8) -> Self {
        match value {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DnloadSync,
            4 => DfuState::DnloadBusy,
            5 => DfuState::DnloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }
}

impl DfuState {
    pub fn to_u8(self) -> u8 {
        match self {
            DfuState::AppIdle => 0,
            DfuState::AppDetach => 1,
            DfuState::DfuIdle => 2,
            DfuState::DnloadSync => 3,
            DfuState::DnloadBusy => 4,
            DfuState::DnloadIdle => 5,
            DfuState::ManifestSync => 6,
            DfuState::Manifest => 7,
            DfuState::ManifestWaitReset => 8,
            DfuState::UploadIdle => 9,
            DfuState::Error => 10,
            DfuState::Unknown(other) => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DnloadBusy => "dfuDNBUSY",
            DfuState::DnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::ManifestSync => "dfuMANIFEST-SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::UploadIdle => "dfuUPLOAD-IDLE",
            DfuState::Error => "dfuERROR",
            DfuState::Unknown(_) => "INVALID STATE",
        }
    }
}

/// Result of a DFU_GETSTATUS request. All multi-byte fields are
/// little-endian on the wire; the poll timeout is 24 bits wide.
#[derive(Clone, Copy, Debug)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatus {
    pub fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < 6 {
            return Err(DfuError::Data(format!(
                "Short DFU_GETSTATUS response ({} bytes)",
                data.len()
            )));
        }
        Ok(DfuStatus {
            status: data[0],
            poll_timeout: (data[3] as u32) << 16
                | (data[2] as u32) << 8
                | (data[1] as u32),
            state: DfuState::from(data[4]),
            string_index: data[5],
        })
    }

    /// Synthesized status for devices that stall GETSTATUS while still
    /// in run-time mode.
    pub fn assumed_app_idle() -> Self {
        DfuStatus {
            status: DFU_STATUS_OK,
            poll_timeout: 0,
            state: DfuState::AppIdle,
            string_index: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DFU_STATUS_OK
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(DfuError::Status {
                status: self.status,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_raw() {
        let st =
            DfuStatus::from_raw(&[0x00, 0x10, 0x02, 0x01, 0x05, 0x00])
                .unwrap();
        assert_eq!(st.status, DFU_STATUS_OK);
        assert_eq!(st.poll_timeout, 0x010210);
        assert_eq!(st.state, DfuState::DnloadIdle);
        assert!(st.is_ok());
    }

    #[test]
    fn test_status_error() {
        let st =
            DfuStatus::from_raw(&[0x08, 0x00, 0x00, 0x00, 0x0a, 0x00])
                .unwrap();
        assert_eq!(st.state, DfuState::Error);
        assert!(st.ok().is_err());
    }

    #[test]
    fn test_short_record() {
        assert!(DfuStatus::from_raw(&[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_state_round_trip() {
        for b in 0..=11u8 {
            assert_eq!(DfuState::from(b).to_u8(), b);
        }
    }
}
