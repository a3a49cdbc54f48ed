use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use clap_num::maybe_hex;
use log::LevelFilter;
use parse_size::parse_size;

use dfu::{DeviceMatch, DfuseOptions};

use driver::{Config, Mode};
use error::CliError;

mod driver;
mod error;
mod list;
mod progress;

#[derive(Parser)]
#[command(
    name = "dfu-tool",
    version,
    about = "Flash firmware into USB DFU and DfuSe devices"
)]
struct Cli {
    /// Print verbose debug statements (cumulative)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// List currently attached DFU capable devices
    #[arg(short = 'l', long)]
    list: bool,

    /// Detach currently attached DFU capable devices
    #[arg(short = 'e', long)]
    detach: bool,

    /// Time to wait before reopening a device after detach
    #[arg(
        short = 'E',
        long,
        value_name = "SECONDS",
        default_value_t = 5
    )]
    detach_delay: u64,

    /// Vendor/product ID(s) of DFU device
    #[arg(
        short = 'd',
        long,
        value_name = "VID:PID[,VID_DFU:PID_DFU]"
    )]
    device: Option<String>,

    /// USB path of DFU device
    #[arg(short = 'p', long, value_name = "BUS-PORT. ... .PORT")]
    path: Option<String>,

    /// Configuration value of DFU device
    #[arg(short = 'c', long = "cfg", value_name = "CONFIG_NR")]
    cfg: Option<u8>,

    /// DFU interface number
    #[arg(short = 'i', long = "intf", value_name = "INTF_NR")]
    intf: Option<usize>,

    /// Altsetting of the DFU interface, by name or by number
    #[arg(short = 'a', long = "alt", value_name = "ALT")]
    alt: Option<String>,

    /// Serial string of DFU device
    #[arg(
        short = 'S',
        long,
        value_name = "SERIAL[,SERIAL_DFU]"
    )]
    serial: Option<String>,

    /// Match given device number (devnum from --list)
    #[arg(short = 'n', long, value_name = "DNUM")]
    devnum: Option<u8>,

    /// Bytes per USB transfer
    #[arg(
        short = 't',
        long,
        value_name = "SIZE",
        value_parser = maybe_hex::<u16>
    )]
    transfer_size: Option<u16>,

    /// Read firmware from device into FILE
    #[arg(short = 'U', long, value_name = "FILE")]
    upload: Option<PathBuf>,

    /// Expected upload size, in bytes (ex: 64K, 2MB)
    #[arg(
        short = 'Z',
        long,
        value_name = "SIZE",
        value_parser = parse_length
    )]
    upload_size: Option<u64>,

    /// Write firmware from FILE into device
    #[arg(short = 'D', long, value_name = "FILE")]
    download: Option<PathBuf>,

    /// Issue USB reset signalling once we are finished
    #[arg(short = 'R', long)]
    reset: bool,

    /// Wait for the device to appear
    #[arg(short = 'w', long)]
    wait: bool,

    /// DfuSe mode string: target address for raw download or upload,
    /// plus options separated with ':' (force, leave, unprotect,
    /// mass-erase, will-reset, or an upload length)
    #[arg(
        short = 's',
        long = "dfuse-address",
        value_name = "ADDRESS[:OPTS]"
    )]
    dfuse_address: Option<String>,
}

fn parse_length(s: &str) -> Result<u64, String> {
    parse_size(s).map_err(|e| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .parse_default_env()
        .init();

    let result = build_config(cli).and_then(driver::run);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("dfu-tool: {}", err);
            ExitCode::from(err.exit_code())
        }
    }
}

fn build_config(cli: Cli) -> Result<Config, CliError> {
    let dfuse_options = cli
        .dfuse_address
        .as_deref()
        .map(str::parse::<DfuseOptions>)
        .transpose()
        .map_err(CliError::Usage)?;

    let mode = if cli.list {
        Mode::List
    } else if cli.detach {
        Mode::Detach
    } else if let Some(path) = cli.upload {
        Mode::Upload(path)
    } else if let Some(path) = cli.download {
        Mode::Download(Some(path))
    } else if dfuse_options.is_some() {
        // DfuSe special commands match any device
        Mode::Download(None)
    } else {
        return Err(CliError::Usage(
            "You need to specify one of -D or -U".into(),
        ));
    };

    let mut criteria = DeviceMatch::default();
    if let Some(spec) = &cli.device {
        criteria.set_vendor_product(spec);
    }
    if let Some(spec) = &cli.serial {
        criteria.set_serial(spec);
    }
    if let Some(config) = cli.cfg {
        criteria.set_config(config);
    }
    criteria.path = cli.path;
    criteria.iface_index = cli.intf;
    criteria.devnum = cli.devnum;
    if let Some(alt) = &cli.alt {
        match parse_alt(alt) {
            Some(index) => criteria.alt_index = Some(index),
            None => criteria.alt_name = Some(alt.clone()),
        }
    }

    Ok(Config {
        mode,
        criteria,
        transfer_size: cli.transfer_size,
        upload_size: cli.upload_size,
        final_reset: cli.reset,
        wait_device: cli.wait,
        detach_delay: Duration::from_secs(cli.detach_delay),
        dfuse_options,
    })
}

/// An `--alt` argument is an index when it parses fully as a number
/// (with optional 0x prefix), otherwise an alt-setting name.
fn parse_alt(s: &str) -> Option<u8> {
    if let Some(hex) =
        s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        u8::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}
