//! ST Microelectronics DFU extensions (DfuSe), per the DfuSe 1.1a
//! specification (AN3156) and the UM0391 file format.

use std::io::Write;
use std::str::FromStr;

use log::{debug, info, warn};

use crate::connection::DfuConnection;
use crate::dfuse_file::DfuseImage;
use crate::error::DfuError;
use crate::file::DfuFile;
use crate::load::Progress;
use crate::memory::DfuMemory;
use crate::quirks::Quirks;
use crate::status::{DfuState, DfuStatus, DFU_STATUS_OK};
use crate::transport::DfuTransport;

/// DfuSe data transfers carry no transaction counter; the address is
/// set explicitly before each chunk and wValue stays at 2.
const DFUSE_DATA_TRANSACTION: u16 = 2;

/// Fallback upload bound when the target segment is unknown.
const DEFAULT_UPLOAD_LIMIT: u64 = 0x4000;

const STM32H7_VENDOR: u16 = 0x0483;
const STM32H7_PRODUCT: u16 = 0xdf11;
/// Serial prefix of the dual-bank STM32H7 bootloaders that get stuck
/// in dfuERROR while erasing the second bank.
const STM32H7_SERIAL_PREFIX: &str = "200364500000";

const ERASE_UNSTICK_POLLS: u32 = 4;
const MAX_PIPE_STALLS: u32 = 3;
const MAX_ZERO_TIMEOUT_POLLS: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuseCommand {
    SetAddress(u32),
    ErasePage(u32),
    MassErase,
    ReadUnprotect,
}

impl DfuseCommand {
    pub fn name(self) -> &'static str {
        match self {
            DfuseCommand::SetAddress(_) => "SET_ADDRESS",
            DfuseCommand::ErasePage(_) => "ERASE_PAGE",
            DfuseCommand::MassErase => "MASS_ERASE",
            DfuseCommand::ReadUnprotect => "READ_UNPROTECT",
        }
    }

    fn payload(self) -> Vec<u8> {
        match self {
            DfuseCommand::SetAddress(addr) => {
                let mut buf = vec![0x21];
                buf.extend_from_slice(&addr.to_le_bytes());
                buf
            }
            DfuseCommand::ErasePage(addr) => {
                let mut buf = vec![0x41];
                buf.extend_from_slice(&addr.to_le_bytes());
                buf
            }
            // Erase command with no address means mass erase
            DfuseCommand::MassErase => vec![0x41],
            DfuseCommand::ReadUnprotect => vec![0x92],
        }
    }
}

/// Options from the `-s` command line string:
/// `address[:force][:leave][:unprotect][:mass-erase][:will-reset][:length]`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DfuseOptions {
    pub address: Option<u32>,
    pub force: bool,
    pub leave: bool,
    pub mass_erase: bool,
    pub unprotect: bool,
    pub will_reset: bool,
    pub length: Option<u32>,
}

fn parse_num(s: &str) -> Result<u32, ()> {
    if let Some(hex) =
        s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).map_err(|_| ())
    } else {
        s.parse().map_err(|_| ())
    }
}

impl FromStr for DfuseOptions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut opts = DfuseOptions::default();
        let mut tokens = s.split(':');

        // The address, possibly empty, must come first
        if !s.starts_with(':') {
            if let Some(first) = tokens.next() {
                if !first.is_empty() {
                    opts.address = Some(parse_num(first).map_err(
                        |_| format!("Invalid dfuse address: {}", first),
                    )?);
                }
            }
        }

        for token in tokens {
            match token {
                "" => continue,
                "force" => opts.force = true,
                "leave" => opts.leave = true,
                "unprotect" => opts.unprotect = true,
                "mass-erase" => opts.mass_erase = true,
                "will-reset" => opts.will_reset = true,
                // any valid number is interpreted as upload length
                other => {
                    opts.length =
                        Some(parse_num(other).map_err(|_| {
                            format!("Invalid dfuse modifier: {}", other)
                        })?)
                }
            }
        }
        Ok(opts)
    }
}

/// Identity of the device under the claimed interface, needed for the
/// serial- and id-keyed poll workarounds.
#[derive(Clone, Debug)]
pub struct DfuseDevice {
    pub vendor: u16,
    pub product: u16,
    pub serial: String,
    pub quirks: Quirks,
}

impl DfuseDevice {
    fn is_sticky_stm32h7(&self) -> bool {
        self.vendor == STM32H7_VENDOR
            && self.product == STM32H7_PRODUCT
            && self.serial.starts_with(STM32H7_SERIAL_PREFIX)
    }
}

/// One alternate setting of the claimed interface together with its
/// parsed memory layout.
#[derive(Debug)]
pub struct DfuseAlt {
    pub alt_setting: u8,
    pub layout: Option<DfuMemory>,
}

pub struct Dfuse<'a, T: DfuTransport> {
    conn: &'a DfuConnection<T>,
    opts: DfuseOptions,
    device: DfuseDevice,
    alts: Vec<DfuseAlt>,
    current_alt: u8,
    /// Page-aligned address of the last erase, to avoid re-erasing.
    /// Starts at an unaligned value so it never matches.
    last_erased_page: u32,
    leave_address: Option<u32>,
    first_address_saved: bool,
}

impl<'a, T: DfuTransport> Dfuse<'a, T> {
    pub fn new(
        conn: &'a DfuConnection<T>,
        opts: DfuseOptions,
        device: DfuseDevice,
        alts: Vec<DfuseAlt>,
        current_alt: u8,
    ) -> Self {
        let leave_address = opts.address;
        Dfuse {
            conn,
            opts,
            device,
            alts,
            current_alt,
            last_erased_page: 1,
            leave_address,
            first_address_saved: false,
        }
    }

    fn layout(&self) -> Option<&DfuMemory> {
        self.alts
            .iter()
            .find(|a| a.alt_setting == self.current_alt)
            .and_then(|a| a.layout.as_ref())
    }

    /// Switch to the alt setting a DfuSe file target addresses. Returns
    /// false when the device exposes no such alt setting.
    fn select_target(&mut self, alt_setting: u8) -> Result<bool, DfuError> {
        if !self.alts.iter().any(|a| a.alt_setting == alt_setting) {
            return Ok(false);
        }
        info!("Setting Alternate Interface #{} ...", alt_setting);
        self.conn.select_alt(alt_setting)?;
        self.current_alt = alt_setting;
        Ok(true)
    }

    /// Issue a DfuSe special command and poll it to completion,
    /// applying the device-specific timing workarounds.
    pub fn special_command(
        &mut self,
        command: DfuseCommand,
    ) -> Result<(), DfuError> {
        if let DfuseCommand::ErasePage(address) = command {
            let segment = self
                .layout()
                .and_then(|l| l.find_segment(address))
                .filter(|s| s.erasable())
                .copied()
                .ok_or(DfuError::NotErasable(address))?;
            debug!(
                "Erasing page size {} at address 0x{:08x}, page \
                 starting at 0x{:08x}",
                segment.page_size(),
                address,
                segment.page_start(address)
            );
            self.last_erased_page = segment.page_start(address);
        } else if let DfuseCommand::SetAddress(address) = command {
            debug!("  Setting address pointer to 0x{:08x}", address);
        }

        self.conn.dnload(0, &command.payload())?;

        let mut n_polls: u32 = 0;
        let mut n_stalls: u32 = 0;
        let mut n_timeouts: u32 = 0;
        let mut poll_timeout: u32 = 0;
        let status;

        loop {
            // STM32H7 devices with two memory banks get stuck reporting
            // an error state when erasing blocks in the second bank.
            // The erase itself succeeds; the FSM just needs a kick.
            if n_polls > ERASE_UNSTICK_POLLS
                && matches!(command, DfuseCommand::ErasePage(_))
                && self.device.is_sticky_stm32h7()
            {
                warn!(
                    "STM32 DFU ERASE_PAGE fix: clearing the dfu FSM status"
                );
                self.conn.clear_status()?;
            }

            let st = match self.conn.get_status() {
                // Some STM32L4 bootloaders report a too short poll
                // timeout and stall the pipe when we poll
                Err(err)
                    if err.is_stall()
                        && poll_timeout != 0
                        && n_stalls < MAX_PIPE_STALLS =>
                {
                    n_stalls += 1;
                    debug!(
                        "Device stalled USB pipe, reusing last poll timeout"
                    );
                    DfuStatus {
                        status: DFU_STATUS_OK,
                        poll_timeout,
                        state: DfuState::DnloadBusy,
                        string_index: 0,
                    }
                }
                Err(err) => return Err(err),
                Ok(st) => {
                    poll_timeout = st.poll_timeout;
                    st
                }
            };

            if n_polls == 0 {
                if st.state != DfuState::DnloadBusy {
                    warn!(
                        "DFU state({}) = {}, status({}) = {}",
                        st.state.to_u8(),
                        st.state.name(),
                        st.status,
                        crate::status::status_to_string(st.status),
                    );
                    return Err(DfuError::WrongState {
                        state: st.state,
                        context: "after special command download",
                    });
                }
                /* STM32F405 lies about mass erase timeout */
                if command == DfuseCommand::MassErase
                    && st.poll_timeout == 100
                {
                    poll_timeout = 35000; /* datasheet says up to 32 s */
                    info!("Setting timeout to 35 seconds");
                }
            }

            debug!("   Sleeping for poll_timeout = {} ms", poll_timeout);
            self.conn.sleep_ms(poll_timeout);

            // The device disconnects and resets after acknowledging a
            // read unprotect; waiting further would hang
            if command == DfuseCommand::ReadUnprotect {
                return Ok(());
            }

            if st.poll_timeout == 0 {
                n_timeouts += 1;
                if n_timeouts == MAX_ZERO_TIMEOUT_POLLS {
                    return Err(DfuError::Stuck);
                }
            } else {
                n_timeouts = 0;
            }

            n_polls += 1;
            if st.state != DfuState::DnloadBusy
                && st.state != DfuState::Error
            {
                status = st;
                break;
            }
        }

        if status.status != DFU_STATUS_OK {
            if matches!(command, DfuseCommand::ErasePage(_))
                && self.device.is_sticky_stm32h7()
            {
                warn!(
                    "ERASE_PAGE ended with an error, but note that this \
                     can be spurious with STM32H7 MCUs"
                );
            } else {
                return Err(DfuError::Status {
                    status: status.status,
                    state: status.state,
                });
            }
        }
        Ok(())
    }

    /// One addressed data transfer: the caller has set the address
    /// pointer, so wValue stays at 2 and no counter advances.
    fn dnload_chunk(&self, data: &[u8]) -> Result<(), DfuError> {
        self.conn.dnload(DFUSE_DATA_TRANSACTION, data)?;

        let status = loop {
            let st = self.conn.get_status()?;
            self.conn.sleep_ms(st.poll_timeout);
            match st.state {
                DfuState::DnloadIdle
                | DfuState::Error
                | DfuState::Manifest => break st,
                DfuState::DnloadBusy if self.opts.will_reset => break st,
                _ => continue,
            }
        };

        if status.state == DfuState::Manifest {
            info!("Transitioning to dfuMANIFEST state");
        }
        status.ok()
    }

    /// Write one element, erasing every involved page first.
    pub fn dnload_element(
        &mut self,
        address: u32,
        data: &[u8],
        xfer_size: u16,
        progress: &mut dyn Progress,
    ) -> Result<(), DfuError> {
        let size = data.len() as u32;
        let xfer_size = xfer_size as u32;
        if size == 0 {
            return Ok(());
        }

        // Check at least that we can write to the last address
        let last = address + size - 1;
        if !self.opts.force
            && !self
                .layout()
                .and_then(|l| l.find_segment(last))
                .is_some_and(|s| s.writeable())
        {
            return Err(DfuError::NotWriteable(last));
        }

        // First pass: erase involved pages
        progress.report("Erase", 0, size as u64);
        let mut p: u32 = 0;
        while p < size {
            let chunk_addr = address + p;
            let chunk_size = xfer_size.min(size - p);

            let segment = self
                .layout()
                .and_then(|l| l.find_segment(chunk_addr))
                .copied();
            if !self.opts.force
                && !segment.is_some_and(|s| s.writeable())
            {
                return Err(DfuError::NotWriteable(chunk_addr));
            }
            // Outside the memory map we skip erasing, since the page
            // size for a flash erase is unknown
            let Some(segment) = segment else {
                p += xfer_size;
                continue;
            };

            if segment.erasable() && !self.opts.mass_erase {
                let mut erase_address = chunk_addr;
                while erase_address < chunk_addr + chunk_size {
                    if segment.page_start(erase_address)
                        != self.last_erased_page
                    {
                        self.special_command(DfuseCommand::ErasePage(
                            erase_address,
                        ))?;
                    }
                    erase_address += segment.page_size();
                }
                let chunk_end = chunk_addr + chunk_size - 1;
                if segment.page_start(chunk_end) != self.last_erased_page
                {
                    debug!(
                        " Chunk extends into next page, erase it as well"
                    );
                    self.special_command(DfuseCommand::ErasePage(
                        chunk_end,
                    ))?;
                }
                progress.report("Erase", p as u64, size as u64);
            }
            p += xfer_size;
        }
        progress.report("Erase", size as u64, size as u64);

        // Second pass: write data to the (erased) pages
        progress.report("Download", 0, size as u64);
        let mut p: u32 = 0;
        while p < size {
            let chunk_addr = address + p;
            let chunk_size = xfer_size.min(size - p);
            debug!(
                " Download from image offset {:08x} to memory \
                 {:08x}-{:08x}, size {}",
                p,
                chunk_addr,
                chunk_addr + chunk_size - 1,
                chunk_size
            );

            self.special_command(DfuseCommand::SetAddress(chunk_addr))?;
            self.dnload_chunk(
                &data[p as usize..(p + chunk_size) as usize],
            )?;

            p += chunk_size;
            progress.report("Download", p as u64, size as u64);
        }
        Ok(())
    }

    /// Upload from the device, bounded by the `-s` length, the end of
    /// the addressed segment, or the 16 KiB fallback.
    pub fn do_upload<W: Write>(
        &mut self,
        xfer_size: u16,
        out: &mut W,
        progress: &mut dyn Progress,
    ) -> Result<u64, DfuError> {
        let mut upload_limit =
            self.opts.length.map(u64::from).unwrap_or(0);

        if let Some(address) = self.opts.address {
            let segment = self
                .layout()
                .ok_or(DfuError::NoMemoryLayout(self.current_alt))?
                .find_segment(address)
                .copied();
            if !self.opts.force
                && !segment.is_some_and(|s| s.readable())
            {
                return Err(DfuError::NotReadable(address));
            }
            if upload_limit == 0 {
                match segment {
                    Some(segment) => {
                        upload_limit =
                            (segment.end_addr() - address + 1) as u64;
                        info!(
                            "Limiting upload to end of memory segment, \
                             {} bytes",
                            upload_limit
                        );
                    }
                    None => {
                        // unknown segment, "force" has been used
                        upload_limit = DEFAULT_UPLOAD_LIMIT;
                        info!("Limiting upload to {} bytes", upload_limit);
                    }
                }
            }
            self.special_command(DfuseCommand::SetAddress(address))?;
            self.conn.abort_to_idle()?;
        } else {
            // The boot loader decides the start address, unknown to us;
            // use a short length to lower the risk of running out of
            // bounds
            if upload_limit == 0 {
                warn!("Unbound upload not supported on DfuSe devices");
                upload_limit = DEFAULT_UPLOAD_LIMIT;
            }
            info!("Limiting default upload to {} bytes", upload_limit);
        }

        progress.report("Upload", 0, upload_limit);
        let mut transaction: u16 = 2;
        let mut total_bytes: u64 = 0;
        loop {
            // last chunk can be smaller than the transfer size
            let request =
                (xfer_size as u64).min(upload_limit - total_bytes) as u16;
            let data = self.conn.upload(transaction, request)?;
            transaction = transaction.wrapping_add(1);
            out.write_all(&data)?;
            total_bytes += data.len() as u64;

            if data.len() < request as usize
                || total_bytes >= upload_limit
            {
                break;
            }
            progress.report("Upload", total_bytes, upload_limit);
        }
        progress.report("Upload", total_bytes, total_bytes);

        self.conn.abort_to_idle()?;
        if self.opts.leave {
            self.leave()?;
        }
        Ok(total_bytes)
    }

    /// Download driver: special-command modes, raw binary at an
    /// address, or a DfuSe container spanning alt settings.
    pub fn do_dnload(
        &mut self,
        xfer_size: u16,
        file: Option<&DfuFile>,
        progress: &mut dyn Progress,
    ) -> Result<(), DfuError> {
        for alt in &self.alts {
            if alt.layout.is_none() {
                return Err(DfuError::NoMemoryLayout(alt.alt_setting));
            }
        }

        if self.opts.unprotect {
            if !self.opts.force {
                return Err(DfuError::Usage(
                    "The read unprotect command will erase the flash \
                     memory and can only be used with force"
                        .into(),
                ));
            }
            self.special_command(DfuseCommand::ReadUnprotect)?;
            info!("Device disconnects, erases flash and resets now");
            return Ok(());
        }
        if self.opts.mass_erase {
            if !self.opts.force {
                return Err(DfuError::Usage(
                    "The mass erase command can only be used with force"
                        .into(),
                ));
            }
            info!("Performing mass erase, this can take a moment");
            self.special_command(DfuseCommand::MassErase)?;
        }

        match file {
            None => info!("DfuSe command mode"),
            Some(file) if self.opts.address.is_some() => {
                if file.is_dfuse() {
                    return Err(DfuError::Usage(
                        "This is a DfuSe file, not meant for raw \
                         download"
                            .into(),
                    ));
                }
                let address = self.opts.address.unwrap_or_default();
                let payload = file.payload();
                info!(
                    "Downloading element to address = 0x{:08x}, size = {}",
                    address,
                    payload.len()
                );
                self.dnload_element(
                    address, payload, xfer_size, progress,
                )?;
                info!("File downloaded successfully");
            }
            Some(file) => {
                if !file.is_dfuse() {
                    warn!("Only DfuSe file version 1.1a is supported");
                    return Err(DfuError::Usage(
                        "For raw binary download, use the \
                         --dfuse-address option"
                            .into(),
                    ));
                }
                self.dnload_image(
                    &DfuseImage::parse(file.payload())?,
                    xfer_size,
                    progress,
                )?;
            }
        }

        if !self.opts.will_reset {
            self.conn.abort_to_idle()?;
        }
        if self.opts.leave {
            self.leave()?;
        }
        Ok(())
    }

    fn dnload_image(
        &mut self,
        image: &DfuseImage,
        xfer_size: u16,
        progress: &mut dyn Progress,
    ) -> Result<(), DfuError> {
        info!("File contains {} DFU images", image.targets.len());
        for target in &image.targets {
            match &target.name {
                Some(name) => info!("Target name: {}", name),
                None => info!("No target name"),
            }
            info!(
                "Image for alternate setting {}, ({} elements)",
                target.alt_setting,
                target.elements.len()
            );
            let present = self.select_target(target.alt_setting)?;
            if !present {
                warn!(
                    "No alternate setting {} (skipping elements)",
                    target.alt_setting
                );
            }
            for element in &target.elements {
                info!(
                    "Downloading element, address = 0x{:08x}, size = {}",
                    element.address,
                    element.data.len()
                );
                if !self.first_address_saved {
                    self.first_address_saved = true;
                    self.leave_address = Some(element.address);
                }
                if present {
                    self.dnload_element(
                        element.address,
                        &element.data,
                        xfer_size,
                        progress,
                    )?;
                }
            }
        }
        info!("Done parsing DfuSe file");
        Ok(())
    }

    /// Jump to the application: set the address pointer if one is
    /// known, then send a zero-length download.
    pub fn leave(&mut self) -> Result<(), DfuError> {
        if let Some(address) = self.leave_address {
            self.special_command(DfuseCommand::SetAddress(address))?;
        }
        info!("Submitting leave request...");
        if self.device.quirks.contains(Quirks::DFUSE_LEAVE) {
            // The device might leave after this request, with or
            // without a response
            let _ = self.conn.dnload(DFUSE_DATA_TRANSACTION, &[]);
            let _ = self.conn.get_status();
            Ok(())
        } else {
            self.dnload_chunk(&[])
        }
    }
}
