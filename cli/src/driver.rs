//! The command driver: probe, bring the device into DFU mode, run the
//! requested operation, optionally reset. The retry-probe control flow
//! is modeled as an explicit state machine.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};

use dfu::{
    negotiate_transfer_size, probe_devices, DeviceMatch, DfuFile,
    DfuInterface, DfuState, DfuStatus, Dfuse, DfuseAlt, DfuseDevice,
    DfuseOptions, MatchValue, Quirks, DETACH_TIMEOUT_MS, ID_ANY,
};

use crate::error::CliError;
use crate::list;
use crate::progress::ConsoleProgress;

/// How often to re-probe while waiting for a device under `--wait`.
const WAIT_POLL_MS: u64 = 20;

pub enum Mode {
    List,
    Detach,
    Upload(PathBuf),
    /// A download without a file is DfuSe command mode (`-s` only).
    Download(Option<PathBuf>),
}

pub struct Config {
    pub mode: Mode,
    pub criteria: DeviceMatch,
    pub transfer_size: Option<u16>,
    pub upload_size: Option<u64>,
    pub final_reset: bool,
    pub wait_device: bool,
    pub detach_delay: Duration,
    pub dfuse_options: Option<DfuseOptions>,
}

enum DriverState {
    Probing,
    RunTimeDetected,
    WaitingForDfu,
    DfuReady,
    Operating,
    ResettingOrLeaving,
    Done,
}

/// Identity of the selected interface, copied out so the interface
/// collection can be borrowed freely afterwards.
struct Selected {
    vendor: u16,
    product: u16,
    serial: String,
    quirks: Quirks,
    alt_setting: u8,
    manifestation_tolerant: bool,
    is_dfuse: bool,
}

pub fn run(mut cfg: Config) -> Result<(), CliError> {
    let file = load_download_file(&mut cfg)?;
    let dfuse_file = file.as_ref().is_some_and(|f| f.is_dfuse());

    if cfg.wait_device {
        println!("Waiting for device, exit with ctrl-C");
    }

    let mut interfaces: Vec<DfuInterface> = Vec::new();
    let mut conn = None;
    let mut xfer_size: u16 = 0;
    let mut selected: Option<Selected> = None;
    let mut runtime_vendor: u16 = ID_ANY;
    let mut runtime_product: u16 = ID_ANY;

    let mut state = DriverState::Probing;
    loop {
        state = match state {
            DriverState::Probing => {
                interfaces = loop {
                    let found = probe_devices(&cfg.criteria)?;
                    if let Mode::List = cfg.mode {
                        list::list_dfu_interfaces(&found);
                        return Ok(());
                    }
                    if !found.is_empty() {
                        break found;
                    }
                    if !cfg.wait_device {
                        return Err(CliError::Io(
                            "No DFU capable USB device available".into(),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(
                        WAIT_POLL_MS,
                    ));
                };

                // More than one device with the same vendor/product
                // cannot be supported: the bus reset during DFU entry
                // gives the target a new address. A DfuSe file spanning
                // alternate settings of one interface is fine.
                if dfuse_file && same_single_interface(&interfaces) {
                    if interfaces.len() > 1 {
                        println!(
                            "Multiple alternate interfaces for DfuSe file"
                        );
                    }
                } else if interfaces.len() > 1 {
                    return Err(CliError::Io(
                        "More than one DFU capable USB device found! \
                         Try `--list' and specify the serial number \
                         or disconnect all but one device"
                            .into(),
                    ));
                }

                let dif = &mut interfaces[0];
                println!("Opening DFU capable USB device...");
                dif.open()?;
                println!(
                    "Device ID {:04x}:{:04x}",
                    dif.vendor(),
                    dif.product()
                );
                if dif.interface() > 0 {
                    // If the DFU interface is not the first, this is
                    // likely not a proper run-time descriptor set
                    println!(
                        "Run-Time device DFU version {:04x}",
                        dif.func_dfu().dfu_version()
                    );
                } else {
                    println!(
                        "Device DFU version {:04x}",
                        dif.func_dfu().dfu_version()
                    );
                }
                debug!(
                    "DFU attributes: (0x{:02x})",
                    dif.func_dfu().attributes()
                );
                debug!(
                    "Detach timeout {} ms",
                    dif.func_dfu().detach_timeout()
                );

                runtime_vendor = dif.vendor();
                runtime_product = dif.product();
                if dif.is_dfu_mode() {
                    // Already in DFU mode: the runtime IDs are whatever
                    // the user matched on, if anything
                    if let MatchValue::Only(v) = cfg.criteria.vendor {
                        runtime_vendor = v;
                    }
                    if let MatchValue::Only(p) = cfg.criteria.product {
                        runtime_product = p;
                    }
                    DriverState::DfuReady
                } else {
                    DriverState::RunTimeDetected
                }
            }

            DriverState::RunTimeDetected => {
                match enter_dfu_mode(&mut interfaces[0])? {
                    // Device was already in DFU mode despite the
                    // run-time descriptors
                    EntryOutcome::AlreadyDfu => DriverState::DfuReady,
                    EntryOutcome::Detached => {
                        // Keeping handles open might prevent
                        // re-enumeration
                        interfaces.clear();
                        if let Mode::Detach = cfg.mode {
                            return Ok(());
                        }
                        std::thread::sleep(cfg.detach_delay);
                        cfg.criteria.force_dfu_mode_only();
                        DriverState::WaitingForDfu
                    }
                }
            }

            DriverState::WaitingForDfu => {
                interfaces = probe_devices(&cfg.criteria)?;
                if interfaces.is_empty() {
                    return Err(CliError::Io(
                        "Lost device after RESET?".into(),
                    ));
                }
                if interfaces.len() > 1 {
                    // A bus reset renumbered the device; with several
                    // survivors the addressing would be ambiguous
                    return Err(CliError::Io(
                        "More than one DFU capable USB device found! \
                         Try `--list' and specify the serial number \
                         or disconnect all but one device"
                            .into(),
                    ));
                }
                if !interfaces[0].is_dfu_mode() {
                    return Err(CliError::Protocol(
                        "Device is not in DFU mode".into(),
                    ));
                }
                println!("Opening DFU USB Device...");
                interfaces[0].open()?;
                DriverState::DfuReady
            }

            DriverState::DfuReady => {
                let dif = &mut interfaces[0];
                println!("Claiming USB DFU Interface...");
                let c = dif.claim()?;
                if dif.has_multiple_alts() {
                    println!(
                        "Setting Alternate Interface #{} ...",
                        dif.alt_setting()
                    );
                    c.select_alt(dif.alt_setting())?;
                }
                normalize_status(&c)?;

                println!(
                    "DFU mode device DFU version {:04x}",
                    dif.func_dfu().dfu_version()
                );
                let is_dfuse = dif.func_dfu().is_dfuse();
                if cfg.dfuse_options.is_some() && !is_dfuse {
                    println!(
                        "Warning: DfuSe option used on non-DfuSe device"
                    );
                }
                xfer_size = negotiate_transfer_size(
                    dif.func_dfu(),
                    cfg.transfer_size,
                    dif.max_packet_size0(),
                )?;

                selected = Some(Selected {
                    vendor: dif.vendor(),
                    product: dif.product(),
                    serial: dif.serial_name().to_string(),
                    quirks: dif.quirks(),
                    alt_setting: dif.alt_setting(),
                    manifestation_tolerant: dif
                        .func_dfu()
                        .manifestation_tolerant(),
                    is_dfuse,
                });
                conn = Some(c);
                DriverState::Operating
            }

            DriverState::Operating => {
                let c = match &conn {
                    Some(c) => c,
                    None => {
                        return Err(CliError::Software(
                            "No DFU connection".into(),
                        ));
                    }
                };
                let sel = match &selected {
                    Some(sel) => sel,
                    None => {
                        return Err(CliError::Software(
                            "No interface selected".into(),
                        ));
                    }
                };
                operate(
                    &cfg,
                    c,
                    sel,
                    &mut interfaces,
                    file.as_ref(),
                    xfer_size,
                    runtime_vendor,
                    runtime_product,
                )?;
                if cfg.final_reset {
                    DriverState::ResettingOrLeaving
                } else {
                    DriverState::Done
                }
            }

            DriverState::ResettingOrLeaving => {
                if let Some(c) = &conn {
                    if let Err(err) = c.detach(DETACH_TIMEOUT_MS) {
                        // Carry on to leave the device in a known state
                        warn!("can't detach: {}", err);
                    }
                }
                println!(
                    "Resetting USB to switch back to Run-Time mode"
                );
                if let Err(err) = interfaces[0].usb_reset() {
                    // The device may already have left the bus
                    warn!("error resetting after download: {}", err);
                }
                DriverState::Done
            }

            DriverState::Done => return Ok(()),
        };
    }
}

/// Load the firmware file for a download and, when the user gave no
/// vendor/product, adopt the IDs from its DFU suffix.
fn load_download_file(
    cfg: &mut Config,
) -> Result<Option<DfuFile>, CliError> {
    let Mode::Download(Some(path)) = &cfg.mode else {
        return Ok(None);
    };
    let file = DfuFile::load(path).map_err(|err| {
        CliError::NoInput(format!(
            "Cannot open file {}: {}",
            path.display(),
            err
        ))
    })?;
    if cfg.criteria.vendor.is_any() && file.vendor != ID_ANY {
        println!("Match vendor ID from file: {:04x}", file.vendor);
        cfg.criteria.vendor = MatchValue::Only(file.vendor);
    }
    if cfg.criteria.product.is_any() && file.product != ID_ANY {
        println!("Match product ID from file: {:04x}", file.product);
        cfg.criteria.product = MatchValue::Only(file.product);
    }
    Ok(Some(file))
}

/// All entries are alternate settings of a single interface on a
/// single device.
fn same_single_interface(interfaces: &[DfuInterface]) -> bool {
    match interfaces.split_first() {
        Some((first, rest)) => {
            rest.iter().all(|i| first.same_interface(i))
        }
        None => false,
    }
}

enum EntryOutcome {
    Detached,
    AlreadyDfu,
}

/// Run-time to DFU transition: claim, read status, send DFU_DETACH and
/// reset (unless the device detaches itself).
fn enter_dfu_mode(
    dif: &mut DfuInterface,
) -> Result<EntryOutcome, CliError> {
    println!("Claiming USB DFU (Run-Time) Interface...");
    let conn = dif.claim()?;

    // Needed when the DFU interface is not the first, and safe with
    // multiple alt settings; otherwise skip the request since the
    // device might not support it
    if dif.interface() > 0 || dif.has_multiple_alts() {
        println!("Setting Alternate Interface zero...");
        conn.select_alt(0)?;
    }

    println!("Determining device status...");
    let status = match conn.get_status() {
        Err(err) if err.is_stall() => {
            println!(
                "Device does not implement get_status, assuming appIDLE"
            );
            DfuStatus::assumed_app_idle()
        }
        Err(err) => {
            return Err(CliError::Io(format!(
                "error get_status: {}",
                err
            )));
        }
        Ok(status) => {
            print_status(&status);
            status
        }
    };
    std::thread::sleep(Duration::from_millis(
        status.poll_timeout as u64,
    ));

    match status.state {
        DfuState::AppIdle | DfuState::AppDetach => {
            println!(
                "Device really in Run-Time Mode, send DFU detach request..."
            );
            if let Err(err) = conn.detach(DETACH_TIMEOUT_MS) {
                warn!("error detaching: {}", err);
            }
            if dif.func_dfu().will_detach() {
                println!("Device will detach and reattach...");
            } else {
                println!("Resetting USB...");
                if let Err(err) = dif.usb_reset() {
                    // The device has often already left the bus
                    warn!("error resetting after detach: {}", err);
                }
            }
            Ok(EntryOutcome::Detached)
        }
        DfuState::Error => {
            println!("dfuERROR, clearing status");
            conn.clear_status()?;
            warn!(
                "Device already in DFU mode? (bState={} {})",
                status.state.to_u8(),
                status.state.name()
            );
            Ok(EntryOutcome::AlreadyDfu)
        }
        other => {
            warn!(
                "Device already in DFU mode? (bState={} {})",
                other.to_u8(),
                other.name()
            );
            Ok(EntryOutcome::AlreadyDfu)
        }
    }
}

fn print_status(status: &DfuStatus) {
    println!(
        "DFU state({}) = {}, status({}) = {}",
        status.state.to_u8(),
        status.state.name(),
        status.status,
        dfu::status_to_string(status.status),
    );
}

/// Bring the DFU state machine to a clean dfuIDLE: clear a pending
/// error once, abort a stale transfer, bail out if the device claims
/// to still be in run-time mode.
fn normalize_status(
    conn: &dfu::DfuConnection<dfu::NusbTransport>,
) -> Result<(), CliError> {
    let status = loop {
        println!("Determining device status...");
        let status = conn.get_status().map_err(|err| {
            CliError::Io(format!("error get_status: {}", err))
        })?;
        print_status(&status);
        std::thread::sleep(Duration::from_millis(
            status.poll_timeout as u64,
        ));

        match status.state {
            DfuState::AppIdle | DfuState::AppDetach => {
                return Err(CliError::Protocol(
                    "Device still in Run-Time Mode!".into(),
                ));
            }
            DfuState::Error => {
                println!("Clearing status");
                conn.clear_status()?;
            }
            DfuState::DnloadIdle | DfuState::UploadIdle => {
                println!("Aborting previous incomplete transfer");
                conn.abort()?;
            }
            _ => break status,
        }
    };

    if !status.is_ok() {
        println!(
            "WARNING: DFU Status: '{}'",
            dfu::status_to_string(status.status)
        );
        // Clear our status and try again
        conn.clear_status()?;
        let status = conn.get_status()?;
        if !status.is_ok() {
            return Err(CliError::Protocol(format!(
                "Status is not OK: {}",
                status.status
            )));
        }
        std::thread::sleep(Duration::from_millis(
            status.poll_timeout as u64,
        ));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn operate(
    cfg: &Config,
    conn: &dfu::DfuConnection<dfu::NusbTransport>,
    sel: &Selected,
    interfaces: &mut [DfuInterface],
    file: Option<&DfuFile>,
    xfer_size: u16,
    runtime_vendor: u16,
    runtime_product: u16,
) -> Result<(), CliError> {
    let mut progress = ConsoleProgress::new();

    match &cfg.mode {
        Mode::Upload(path) => {
            // Open for "exclusive" writing
            let mut out = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|err| {
                    CliError::CantCreate(format!(
                        "Cannot open file {} for writing: {}",
                        path.display(),
                        err
                    ))
                })?;

            let bytes = if sel.is_dfuse || cfg.dfuse_options.is_some()
            {
                let mut dfuse = build_dfuse(
                    conn,
                    cfg.dfuse_options.clone().unwrap_or_default(),
                    sel,
                    interfaces,
                );
                dfuse.do_upload(xfer_size, &mut out, &mut progress)?
            } else {
                dfu::do_upload(
                    conn,
                    xfer_size,
                    cfg.upload_size,
                    &mut out,
                    &mut progress,
                )?
            };
            println!("Received a total of {} bytes", bytes);
        }

        Mode::Download(_) => {
            if let Some(file) = file {
                check_file_ids(
                    file,
                    runtime_vendor,
                    runtime_product,
                    sel,
                )?;
            }
            if sel.is_dfuse
                || cfg.dfuse_options.is_some()
                || file.is_some_and(|f| f.is_dfuse())
            {
                let mut dfuse = build_dfuse(
                    conn,
                    cfg.dfuse_options.clone().unwrap_or_default(),
                    sel,
                    interfaces,
                );
                dfuse.do_dnload(xfer_size, file, &mut progress)?;
            } else {
                let file = file.ok_or_else(|| {
                    CliError::Software(
                        "Download mode without a file".into(),
                    )
                })?;
                dfu::do_dnload(
                    conn,
                    xfer_size,
                    file.payload(),
                    sel.manifestation_tolerant,
                    &mut progress,
                )?;
            }
        }

        Mode::Detach => {
            if let Err(err) = conn.detach(DETACH_TIMEOUT_MS) {
                // Allow combination with a final reset
                warn!("can't detach: {}", err);
            }
        }

        Mode::List => {}
    }
    Ok(())
}

/// The file suffix must name either the run-time or the DFU-mode IDs
/// of the selected device, when it names any at all.
fn check_file_ids(
    file: &DfuFile,
    runtime_vendor: u16,
    runtime_product: u16,
    sel: &Selected,
) -> Result<(), CliError> {
    let runtime_mismatch = (file.vendor != ID_ANY
        && file.vendor != runtime_vendor)
        || (file.product != ID_ANY && file.product != runtime_product);
    let dfu_mismatch = (file.vendor != ID_ANY
        && file.vendor != sel.vendor)
        || (file.product != ID_ANY && file.product != sel.product);
    if runtime_mismatch && dfu_mismatch {
        return Err(CliError::Usage(format!(
            "Error: File ID {:04x}:{:04x} does not match device \
             ({:04x}:{:04x} or {:04x}:{:04x})",
            file.vendor,
            file.product,
            runtime_vendor,
            runtime_product,
            sel.vendor,
            sel.product,
        )));
    }
    Ok(())
}

/// Assemble the DfuSe engine over the claimed interface and every
/// sibling alternate setting, with their parsed memory layouts.
fn build_dfuse<'a>(
    conn: &'a dfu::DfuConnection<dfu::NusbTransport>,
    opts: DfuseOptions,
    sel: &Selected,
    interfaces: &mut [DfuInterface],
) -> Dfuse<'a, dfu::NusbTransport> {
    let mut alts = Vec::with_capacity(interfaces.len());
    for intf in interfaces.iter_mut() {
        let layout = intf.parse_layout().ok().cloned();
        alts.push(DfuseAlt {
            alt_setting: intf.alt_setting(),
            layout,
        });
    }
    Dfuse::new(
        conn,
        opts,
        DfuseDevice {
            vendor: sel.vendor,
            product: sel.product,
            serial: sel.serial.clone(),
            quirks: sel.quirks,
        },
        alts,
        sel.alt_setting,
    )
}
