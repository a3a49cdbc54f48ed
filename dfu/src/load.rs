//! Baseline DFU 1.0/1.1 transfer loops.

use std::io::Write;

use log::{info, warn};

use crate::connection::DfuConnection;
use crate::error::DfuError;
use crate::status::DfuState;
use crate::transport::DfuTransport;

/// Upload transactions start at 2, the DfuSe convention the engine
/// follows universally; downloads start at 0.
const UPLOAD_FIRST_TRANSACTION: u16 = 2;

/// Injected sink for transfer progress reporting.
pub trait Progress {
    fn report(&mut self, operation: &str, done: u64, total: u64);
}

pub struct NullProgress;

impl Progress for NullProgress {
    fn report(&mut self, _operation: &str, _done: u64, _total: u64) {}
}

/// Read firmware out of the device in `xfer_size` chunks, stopping on
/// a short read or once `expected_size` bytes have arrived. Returns the
/// number of bytes written to `out`.
pub fn do_upload<T: DfuTransport, W: Write>(
    conn: &DfuConnection<T>,
    xfer_size: u16,
    expected_size: Option<u64>,
    out: &mut W,
    progress: &mut dyn Progress,
) -> Result<u64, DfuError> {
    let mut transaction = UPLOAD_FIRST_TRANSACTION;
    let mut total_bytes: u64 = 0;

    loop {
        let data = conn.upload(transaction, xfer_size)?;
        out.write_all(&data)?;
        total_bytes += data.len() as u64;
        transaction = transaction.wrapping_add(1);

        if let Some(expected) = expected_size {
            progress.report("Upload", total_bytes, expected);
            if total_bytes >= expected {
                break;
            }
        }
        if data.len() < xfer_size as usize {
            break;
        }
    }
    progress.report("Upload", total_bytes, total_bytes);

    conn.abort_to_idle()?;
    Ok(total_bytes)
}

/// Write `data` to the device in `xfer_size` chunks and see it through
/// manifestation. Transactions are numbered from 0; a final zero-length
/// DNLOAD signals end of transfer.
pub fn do_dnload<T: DfuTransport>(
    conn: &DfuConnection<T>,
    xfer_size: u16,
    data: &[u8],
    manifestation_tolerant: bool,
    progress: &mut dyn Progress,
) -> Result<(), DfuError> {
    let total = data.len() as u64;
    let mut transaction: u16 = 0;
    let mut sent: u64 = 0;

    progress.report("Download", 0, total);
    for chunk in data.chunks(xfer_size as usize) {
        conn.dnload(transaction, chunk)?;
        transaction = transaction.wrapping_add(1);
        wait_dnload_idle(conn)?;
        sent += chunk.len() as u64;
        progress.report("Download", sent, total);
    }

    // Zero-length download: end of transfer, enter manifestation
    conn.dnload(transaction, &[])?;
    info!("File downloaded successfully");

    if manifestation_tolerant {
        // Device stays on the bus while committing the firmware
        loop {
            let status = conn.get_status()?;
            match status.state {
                DfuState::DfuIdle => return status.ok(),
                DfuState::ManifestSync
                | DfuState::Manifest
                | DfuState::DnloadSync
                | DfuState::DnloadBusy => {
                    conn.sleep_ms(status.poll_timeout)
                }
                DfuState::ManifestWaitReset => {
                    info!("Device is waiting for a USB reset");
                    return Ok(());
                }
                DfuState::Error => {
                    return Err(DfuError::Status {
                        status: status.status,
                        state: status.state,
                    });
                }
                state => {
                    return Err(DfuError::WrongState {
                        state,
                        context: "during manifestation",
                    });
                }
            }
        }
    } else {
        // Device will reset and re-enumerate by itself; the status
        // read may already fail
        match conn.get_status() {
            Ok(status) if status.state == DfuState::Manifest => {
                info!("Transitioning to dfuMANIFEST state");
                Ok(())
            }
            Ok(status) => status.ok(),
            Err(_) => {
                warn!(
                    "Unable to read DFU status after completion; \
                     device probably reset"
                );
                Ok(())
            }
        }
    }
}

/// Poll GETSTATUS until the download engine leaves
/// dfuDNLOAD-SYNC/dfuDNBUSY, sleeping the reported interval between
/// polls.
fn wait_dnload_idle<T: DfuTransport>(
    conn: &DfuConnection<T>,
) -> Result<(), DfuError> {
    loop {
        let status = conn.get_status()?;
        match status.state {
            DfuState::DnloadSync | DfuState::DnloadBusy => {
                conn.sleep_ms(status.poll_timeout)
            }
            DfuState::DnloadIdle | DfuState::Manifest => {
                return status.ok();
            }
            DfuState::Error => {
                return Err(DfuError::Status {
                    status: status.status,
                    state: status.state,
                });
            }
            state => {
                return Err(DfuError::WrongState {
                    state,
                    context: "after DFU_DNLOAD",
                });
            }
        }
    }
}
