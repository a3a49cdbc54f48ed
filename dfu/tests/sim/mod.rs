//! A scripted DFU/DfuSe device behind the transport trait.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use dfu::{DfuError, DfuTransport};

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_GETSTATE: u8 = 5;
const DFU_ABORT: u8 = 6;

pub const STATE_DFU_IDLE: u8 = 2;
pub const STATE_DNBUSY: u8 = 4;
pub const STATE_DNLOAD_IDLE: u8 = 5;
pub const STATE_MANIFEST: u8 = 7;
pub const STATE_ERROR: u8 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Detach { timeout: u16 },
    Dnload { transaction: u16, len: usize },
    Upload { transaction: u16, length: u16 },
    GetStatus,
    ClrStatus,
    GetState,
    Abort,
    SelectAlt(u8),
}

pub struct Sim {
    /// Everything the host sent, in wire order.
    pub log: Vec<Request>,
    /// Host sleeps between polls, in milliseconds.
    pub sleeps: Vec<u32>,
    /// When set, data chunks complete with this (state, status)
    /// instead of the busy/idle sequence.
    pub chunk_status: Option<(u8, u8)>,
    /// (state, status) pairs served by upcoming GETSTATUS polls.
    pub queue: VecDeque<(u8, u8)>,
    /// State reported once the queue drains.
    pub settle: u8,
    pub poll_timeout: u32,
    /// GETSTATUS polls answered dfuDNBUSY after each command or chunk.
    pub busy_polls: u32,
    /// After an erase, report dfuERROR this many times (until a
    /// CLRSTATUS) — the sticky STM32H7 behavior.
    pub error_polls_after_erase: u32,
    /// Polls spent in dfuMANIFEST after the final empty DNLOAD.
    pub manifest_polls: u32,
    pub manifestation_tolerant: bool,
    /// Writes via the DfuSe address pointer.
    pub address_pointer: u32,
    pub written: Vec<(u32, Vec<u8>)>,
    /// Baseline (non-DfuSe) download bytes, concatenated.
    pub baseline: Vec<u8>,
    pub erased: Vec<u32>,
    pub mass_erased: bool,
    /// Image served by UPLOAD requests.
    pub upload_image: Vec<u8>,
    pub upload_pos: usize,
    pub dfuse: bool,
}

impl Sim {
    fn handle_dnload(&mut self, transaction: u16, data: &[u8]) {
        self.log.push(Request::Dnload {
            transaction,
            len: data.len(),
        });

        if data.is_empty() {
            // End of transfer (or a leave request)
            if self.manifestation_tolerant {
                for _ in 0..self.manifest_polls {
                    self.queue.push_back((STATE_MANIFEST, 0));
                }
                self.settle = STATE_DFU_IDLE;
            } else {
                self.settle = STATE_MANIFEST;
            }
            return;
        }

        if self.dfuse && transaction == 0 {
            match data[0] {
                0x21 if data.len() == 5 => {
                    self.address_pointer = u32::from_le_bytes([
                        data[1], data[2], data[3], data[4],
                    ]);
                    self.begin_command();
                }
                0x41 if data.len() == 5 => {
                    let addr = u32::from_le_bytes([
                        data[1], data[2], data[3], data[4],
                    ]);
                    self.erased.push(addr);
                    self.begin_command();
                    for _ in 0..self.error_polls_after_erase {
                        self.queue.push_back((STATE_ERROR, 0x04));
                    }
                }
                0x41 => {
                    self.mass_erased = true;
                    self.begin_command();
                }
                0x92 => {
                    self.begin_command();
                }
                _ => {
                    self.settle = STATE_ERROR;
                }
            }
            return;
        }

        // A data chunk
        if self.dfuse {
            self.written
                .push((self.address_pointer, data.to_vec()));
        } else {
            self.baseline.extend_from_slice(data);
        }
        if let Some((state, status)) = self.chunk_status {
            self.queue.push_back((state, status));
            self.settle = state;
        } else {
            self.begin_command();
        }
    }

    fn begin_command(&mut self) {
        for _ in 0..self.busy_polls.max(1) {
            self.queue.push_back((STATE_DNBUSY, 0));
        }
        self.settle = STATE_DNLOAD_IDLE;
    }

    fn next_status(&mut self) -> Vec<u8> {
        let (state, status) = self
            .queue
            .pop_front()
            .unwrap_or((self.settle, 0));
        let t = self.poll_timeout;
        vec![
            status,
            (t & 0xff) as u8,
            ((t >> 8) & 0xff) as u8,
            ((t >> 16) & 0xff) as u8,
            state,
            0,
        ]
    }

    fn serve_upload(&mut self, length: u16) -> Vec<u8> {
        let remaining = self.upload_image.len() - self.upload_pos;
        let len = (length as usize).min(remaining);
        let data = self.upload_image
            [self.upload_pos..self.upload_pos + len]
            .to_vec();
        self.upload_pos += len;
        data
    }
}

#[derive(Clone)]
pub struct SimDevice(Rc<RefCell<Sim>>);

impl SimDevice {
    pub fn new() -> Self {
        SimDevice(Rc::new(RefCell::new(Sim {
            log: Vec::new(),
            sleeps: Vec::new(),
            chunk_status: None,
            queue: VecDeque::new(),
            settle: STATE_DFU_IDLE,
            poll_timeout: 0,
            busy_polls: 1,
            error_polls_after_erase: 0,
            manifest_polls: 1,
            manifestation_tolerant: true,
            address_pointer: 0,
            written: Vec::new(),
            baseline: Vec::new(),
            erased: Vec::new(),
            mass_erased: false,
            upload_image: Vec::new(),
            upload_pos: 0,
            dfuse: false,
        })))
    }

    pub fn dfuse() -> Self {
        let dev = Self::new();
        dev.configure(|sim| sim.dfuse = true);
        dev
    }

    pub fn configure<F: FnOnce(&mut Sim)>(&self, f: F) {
        f(&mut self.0.borrow_mut());
    }

    pub fn inspect<R, F: FnOnce(&Sim) -> R>(&self, f: F) -> R {
        f(&self.0.borrow())
    }

    pub fn log(&self) -> Vec<Request> {
        self.0.borrow().log.clone()
    }
}

impl DfuTransport for SimDevice {
    fn class_in(
        &self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let mut sim = self.0.borrow_mut();
        match request {
            DFU_GETSTATUS => {
                sim.log.push(Request::GetStatus);
                Ok(sim.next_status())
            }
            DFU_UPLOAD => {
                sim.log.push(Request::Upload {
                    transaction: value,
                    length,
                });
                Ok(sim.serve_upload(length))
            }
            DFU_GETSTATE => {
                sim.log.push(Request::GetState);
                Ok(vec![sim.settle])
            }
            other => Err(DfuError::Data(format!(
                "unexpected IN request {}",
                other
            ))),
        }
    }

    fn class_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let mut sim = self.0.borrow_mut();
        match request {
            DFU_DETACH => {
                sim.log.push(Request::Detach { timeout: value });
                Ok(())
            }
            DFU_DNLOAD => {
                sim.handle_dnload(value, data);
                Ok(())
            }
            DFU_CLRSTATUS => {
                sim.log.push(Request::ClrStatus);
                sim.queue.clear();
                Ok(())
            }
            DFU_ABORT => {
                sim.log.push(Request::Abort);
                sim.queue.clear();
                sim.settle = STATE_DFU_IDLE;
                Ok(())
            }
            other => Err(DfuError::Data(format!(
                "unexpected OUT request {}",
                other
            ))),
        }
    }

    fn select_alt(&self, alt_setting: u8) -> Result<(), DfuError> {
        self.0
            .borrow_mut()
            .log
            .push(Request::SelectAlt(alt_setting));
        Ok(())
    }

    // Simulated clock: polls complete instantly
    fn sleep_ms(&self, ms: u32) {
        self.0.borrow_mut().sleeps.push(ms);
    }
}
