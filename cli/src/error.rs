use std::fmt::Display;
use std::io;

use dfu::DfuError;

/// Driver-level errors, each mapped onto its `sysexits` exit code.
pub enum CliError {
    Usage(String),
    Data(String),
    NoInput(String),
    Software(String),
    CantCreate(String),
    Io(String),
    Protocol(String),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Usage(_) => 64,
            CliError::Data(_) => 65,
            CliError::NoInput(_) => 66,
            CliError::Software(_) => 70,
            CliError::CantCreate(_) => 73,
            CliError::Io(_) => 74,
            CliError::Protocol(_) => 76,
        }
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Usage(msg)
            | CliError::Data(msg)
            | CliError::NoInput(msg)
            | CliError::Software(msg)
            | CliError::CantCreate(msg)
            | CliError::Io(msg)
            | CliError::Protocol(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<DfuError> for CliError {
    fn from(err: DfuError) -> Self {
        match err {
            DfuError::Usage(msg) => CliError::Usage(msg),
            DfuError::Data(msg) => CliError::Data(msg),
            DfuError::MissingTransferSize
            | DfuError::NotReadable(_)
            | DfuError::NotWriteable(_)
            | DfuError::NotErasable(_) => {
                CliError::Usage(err.to_string())
            }
            DfuError::Status { .. } | DfuError::WrongState { .. } => {
                CliError::Protocol(err.to_string())
            }
            DfuError::Usb(_)
            | DfuError::Transfer(_)
            | DfuError::Io(_)
            | DfuError::Timeout
            | DfuError::Stuck
            | DfuError::NoMemoryLayout(_) => {
                CliError::Io(err.to_string())
            }
        }
    }
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        CliError::Io(err.to_string())
    }
}
