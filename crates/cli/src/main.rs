//! usbfs-tool
//!
//! Command-line front end for the usbfs engine: list devices, issue control
//! and bulk transfers, and manage interfaces on a device opened through
//! `/dev/bus/usb`.

mod commands;
mod config;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::setup_logging;
use config::ToolConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "usbfs-tool")]
#[command(
    author,
    version,
    about = "usbfs-tool - Talk to USB devices through Linux usbfs"
)]
#[command(long_about = "
Issues control and bulk requests to a USB device through the Linux usbfs
character device (/dev/bus/usb/BBB/DDD), without a kernel driver.

EXAMPLES:
    # List attached devices
    usbfs-tool list

    # Read the device descriptor
    usbfs-tool --vid-pid 0x1234:0x5678 descriptor

    # Read 64 bytes from bulk endpoint 0x81 on interface 0
    usbfs-tool --bus-dev 1:4 bulk-read 0x81 64 --interface 0

    # Same, through the asynchronous submission path
    usbfs-tool --bus-dev 1:4 bulk-read 0x81 64 --interface 0 --async

    # Write bytes to endpoint 0x02
    usbfs-tool --path /dev/bus/usb/001/004 bulk-write 0x02 \"de ad be ef\" --interface 0

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usbfs-tool/config.toml
    3. /etc/usbfs-tool/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// usbfs node to open
    #[arg(long, value_name = "PATH", conflicts_with_all = ["vid_pid", "bus_dev"])]
    path: Option<PathBuf>,

    /// Open the first device with this VID:PID
    #[arg(long, value_name = "VID:PID", conflicts_with = "bus_dev")]
    vid_pid: Option<String>,

    /// Open the device at BUS:ADDRESS
    #[arg(long, value_name = "BUS:ADDR", value_parser = commands::parse_bus_dev)]
    bus_dev: Option<(u8, u8)>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List USB devices
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read the device descriptor with GET_DESCRIPTOR
    Descriptor {
        /// Bytes to request
        #[arg(long, default_value_t = 18)]
        length: u16,
    },
    /// Issue a control transfer on endpoint 0
    Control {
        #[arg(value_parser = commands::parse_u8)]
        request_type: u8,
        #[arg(value_parser = commands::parse_u8)]
        request: u8,
        #[arg(value_parser = commands::parse_u16)]
        value: u16,
        #[arg(value_parser = commands::parse_u16)]
        index: u16,
        /// Bytes to read (device-to-host requests)
        #[arg(long, default_value_t = 0)]
        length: u16,
        /// Hex bytes to send (host-to-device requests)
        #[arg(long, value_parser = commands::parse_hex_bytes)]
        data: Option<commands::HexBytes>,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout: Option<u32>,
    },
    /// Read from a bulk IN endpoint
    BulkRead {
        #[arg(value_parser = commands::parse_u8)]
        endpoint: u8,
        length: u32,
        /// Interface to claim first
        #[arg(long)]
        interface: Option<u8>,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout: Option<u32>,
        /// Submit an asynchronous URB instead of a blocking request
        #[arg(long = "async")]
        use_async: bool,
    },
    /// Write to a bulk OUT endpoint
    BulkWrite {
        #[arg(value_parser = commands::parse_u8)]
        endpoint: u8,
        /// Hex bytes to send
        #[arg(value_parser = commands::parse_hex_bytes)]
        data: commands::HexBytes,
        /// Interface to claim first
        #[arg(long)]
        interface: Option<u8>,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout: Option<u32>,
    },
    /// Claim an interface
    Claim { interface: u8 },
    /// Release an interface
    Release { interface: u8 },
    /// Select a configuration
    SetConfig { configuration: u8 },
    /// Select an alternate setting of an interface
    SetInterface { interface: u8, alt_setting: u8 },
    /// Clear a halt condition on an endpoint
    ClearHalt {
        #[arg(value_parser = commands::parse_u8)]
        endpoint: u8,
    },
    /// Detach the kernel driver from an interface
    DetachDriver { interface: u8 },
    /// Let the kernel rebind a driver to an interface
    AttachDriver { interface: u8 },
    /// Port-reset the device
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ToolConfig::default();
        let path = args
            .config
            .as_deref()
            .map(config::expand_path)
            .unwrap_or_else(ToolConfig::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ToolConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ToolConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbfs-tool v{}", env!("CARGO_PKG_VERSION"));

    let command = args
        .command
        .ok_or_else(|| anyhow!("No command given, see --help"))?;

    if let Command::List { json } = command {
        return commands::list(json);
    }

    let selector = commands::DeviceSelector::resolve(
        args.path,
        args.vid_pid.as_deref(),
        args.bus_dev,
        &config,
    )?;
    let mut device = selector.open(&config)?;
    let timeout = |t: Option<u32>| t.unwrap_or(config.transfers.default_timeout_ms);

    let result = match command {
        Command::List { .. } => Ok(()),
        Command::Descriptor { length } => {
            commands::descriptor(&device, length, config.transfers.default_timeout_ms)
        }
        Command::Control {
            request_type,
            request,
            value,
            index,
            length,
            data,
            timeout: t,
        } => commands::control(
            &device,
            commands::ControlArgs {
                request_type,
                request,
                value,
                index,
                length,
                data: data.map(|d| d.0),
                timeout: timeout(t),
            },
        ),
        Command::BulkRead {
            endpoint,
            length,
            interface,
            timeout: t,
            use_async,
        } => {
            commands::bulk_read(&device, endpoint, length, interface, timeout(t), use_async).await
        }
        Command::BulkWrite {
            endpoint,
            data,
            interface,
            timeout: t,
        } => commands::bulk_write(&device, endpoint, data.0, interface, timeout(t)),
        Command::Claim { interface } => device
            .claim_interface(interface)
            .context("Failed to claim interface"),
        Command::Release { interface } => device
            .release_interface(interface)
            .context("Failed to release interface"),
        Command::SetConfig { configuration } => device
            .set_configuration(configuration)
            .context("Failed to set configuration"),
        Command::SetInterface {
            interface,
            alt_setting,
        } => device
            .set_interface(interface, alt_setting)
            .context("Failed to set interface"),
        Command::ClearHalt { endpoint } => {
            device.clear_halt(endpoint).context("Failed to clear halt")
        }
        Command::DetachDriver { interface } => device
            .disconnect_driver(interface)
            .context("Failed to detach kernel driver"),
        Command::AttachDriver { interface } => device
            .connect_driver(interface)
            .context("Failed to attach kernel driver"),
        Command::Reset => device.reset().context("Failed to reset device"),
    };

    device.close().context("Failed to close device")?;
    result
}
