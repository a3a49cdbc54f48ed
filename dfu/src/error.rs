use crate::status::DfuState;

#[derive(Debug)]
pub enum DfuError {
    Usb(nusb::Error),
    Transfer(nusb::transfer::TransferError),
    Io(std::io::Error),
    /// Device reported a non-OK status in a GETSTATUS poll.
    Status { status: u8, state: DfuState },
    /// Device ended up in a state the protocol does not allow here.
    WrongState {
        state: DfuState,
        context: &'static str,
    },
    MissingTransferSize,
    Timeout,
    /// Device kept reporting a zero poll timeout without progressing.
    Stuck,
    NotReadable(u32),
    NotWriteable(u32),
    NotErasable(u32),
    NoMemoryLayout(u8),
    Usage(String),
    Data(String),
}

impl std::error::Error for DfuError {}

impl std::fmt::Display for DfuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DfuError::Usb(err) => write!(f, "USB error: {}", err),
            DfuError::Transfer(err) => write!(f, "Transfer error: {}", err),
            DfuError::Io(err) => write!(f, "I/O error: {}", err),
            DfuError::Status { status, state } => write!(
                f,
                "DFU status({}) = {}, state = {}",
                status,
                crate::status::status_to_string(*status),
                state.name(),
            ),
            DfuError::WrongState { state, context } => {
                write!(f, "Wrong state {} {}", state.name(), context)
            }
            DfuError::MissingTransferSize => {
                write!(f, "Transfer size must be specified")
            }
            DfuError::Timeout => write!(f, "Timeout"),
            DfuError::Stuck => {
                write!(f, "Device stuck after special command request")
            }
            DfuError::NotReadable(addr) => {
                write!(f, "Page at 0x{:08x} is not readable", addr)
            }
            DfuError::NotWriteable(addr) => {
                write!(f, "Page at 0x{:08x} is not writeable", addr)
            }
            DfuError::NotErasable(addr) => {
                write!(f, "Page at 0x{:08x} can not be erased", addr)
            }
            DfuError::NoMemoryLayout(alt) => write!(
                f,
                "Failed to parse memory layout for alternate interface {}",
                alt
            ),
            DfuError::Usage(msg) => write!(f, "{}", msg),
            DfuError::Data(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for DfuError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        DfuError::Transfer(err)
    }
}

impl From<std::io::Error> for DfuError {
    fn from(err: std::io::Error) -> Self {
        DfuError::Io(err)
    }
}

impl DfuError {
    /// A stalled control pipe, as opposed to a hard transport failure.
    pub fn is_stall(&self) -> bool {
        matches!(
            self,
            DfuError::Transfer(nusb::transfer::TransferError::Stall)
        )
    }
}
