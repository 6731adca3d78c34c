//! Command implementations and argument parsers

use crate::config::ToolConfig;
use anyhow::{Context, Result, anyhow};
use engine::{Transfer, UsbDevice};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Standard GET_DESCRIPTOR request for the device descriptor
const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_DEVICE: u16 = 0x0100;

/// How the device to open was chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Path(PathBuf),
    VidPid(u16, u16),
    BusDev(u8, u8),
}

impl DeviceSelector {
    /// Pick a selector from the command line, falling back to `[device] default`
    pub fn resolve(
        path: Option<PathBuf>,
        vid_pid: Option<&str>,
        bus_dev: Option<(u8, u8)>,
        config: &ToolConfig,
    ) -> Result<Self> {
        if let Some(path) = path {
            return Ok(DeviceSelector::Path(crate::config::expand_path(&path)));
        }
        if let Some(s) = vid_pid {
            let (vid, pid) = common::parse_vid_pid(s).context("Invalid --vid-pid")?;
            return Ok(DeviceSelector::VidPid(vid, pid));
        }
        if let Some((bus, addr)) = bus_dev {
            return Ok(DeviceSelector::BusDev(bus, addr));
        }
        match config.default_device()? {
            Some((vid, pid)) => Ok(DeviceSelector::VidPid(vid, pid)),
            None => Err(anyhow!(
                "No device selected: pass --path, --vid-pid or --bus-dev, or set [device] default"
            )),
        }
    }

    pub fn open(&self, config: &ToolConfig) -> Result<UsbDevice> {
        let engine_config = config.engine_config();
        let device = match self {
            DeviceSelector::Path(path) => UsbDevice::open_with_config(path, engine_config),
            DeviceSelector::VidPid(vid, pid) => UsbDevice::open_vid_pid(*vid, *pid, engine_config),
            DeviceSelector::BusDev(bus, addr) => {
                UsbDevice::open_bus_dev(*bus, *addr, engine_config)
            }
        };
        device.with_context(|| format!("Failed to open device {:?}", self))
    }
}

pub fn list(json: bool) -> Result<()> {
    info!("Listing USB devices...");
    let devices = common::list_devices().context("Failed to enumerate USB devices")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  Bus {:03} Device {:03}: ID {:04x}:{:04x} class {:#04x} {:?}",
            device.bus_number,
            device.device_address,
            device.vendor_id,
            device.product_id,
            device.class,
            device.speed
        );
        println!("      {}", device.devpath.display());
    }
    Ok(())
}

pub fn descriptor(device: &UsbDevice, length: u16, timeout: u32) -> Result<()> {
    let mut buffer = vec![0u8; usize::from(length)];
    let read = device
        .control_transfer(
            REQUEST_TYPE_STANDARD_IN,
            REQUEST_GET_DESCRIPTOR,
            DESCRIPTOR_DEVICE,
            0,
            length,
            timeout,
            &mut buffer,
        )
        .context("GET_DESCRIPTOR failed")?;

    print!("{}", hex_dump(&buffer[..read]));
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ControlArgs {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub data: Option<Vec<u8>>,
    pub timeout: u32,
}

pub fn control(device: &UsbDevice, args: ControlArgs) -> Result<()> {
    let device_to_host = args.request_type & 0x80 != 0;
    let (mut buffer, length) = match (device_to_host, args.data) {
        (true, Some(_)) => return Err(anyhow!("--data is only valid for host-to-device requests")),
        (true, None) => (vec![0u8; usize::from(args.length)], args.length),
        (false, Some(data)) => {
            let length = u16::try_from(data.len()).context("--data is longer than 65535 bytes")?;
            (data, length)
        }
        (false, None) => (Vec::new(), 0),
    };

    let transferred = device
        .control_transfer(
            args.request_type,
            args.request,
            args.value,
            args.index,
            length,
            args.timeout,
            &mut buffer,
        )
        .context("Control transfer failed")?;

    if device_to_host {
        print!("{}", hex_dump(&buffer[..transferred]));
    } else {
        println!("{} bytes sent", transferred);
    }
    Ok(())
}

pub async fn bulk_read(
    device: &UsbDevice,
    endpoint: u8,
    length: u32,
    interface: Option<u8>,
    timeout: u32,
    use_async: bool,
) -> Result<()> {
    if endpoint & 0x80 == 0 {
        return Err(anyhow!("Endpoint {:#04x} is not an IN endpoint", endpoint));
    }
    if let Some(interface) = interface {
        device
            .claim_interface(interface)
            .context("Failed to claim interface")?;
    }

    let buffer = vec![0u8; length as usize];
    let data = if use_async {
        let transfer = submit_and_wait(device, endpoint, length, timeout, buffer).await?;
        if let Some(errno) = transfer.errno() {
            return Err(anyhow!("Transfer {} failed: {}", transfer.id, errno));
        }
        transfer.into_data()
    } else {
        let mut buffer = buffer;
        let (_, data) = device
            .bulk_transfer(endpoint, length, timeout, &mut buffer)
            .context("Bulk read failed")?;
        data
    };

    print!("{}", hex_dump(&data));
    Ok(())
}

/// Submit asynchronously and wait, cancelling the URB once `timeout` passes
async fn submit_and_wait(
    device: &UsbDevice,
    endpoint: u8,
    length: u32,
    timeout: u32,
    buffer: Vec<u8>,
) -> Result<Transfer> {
    let (tx, mut rx) = oneshot::channel();
    let id = device
        .submit_bulk(endpoint, length, timeout, buffer, Some(tx))
        .context("Failed to submit bulk URB")?;

    if timeout > 0 {
        let deadline = Duration::from_millis(timeout.into());
        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(result) => return result.context("Completion signal dropped")?.map_err(Into::into),
            Err(_) => {
                warn!("Transfer {} timed out after {}ms, cancelling", id, timeout);
                device
                    .cancel_transfer(id)
                    .context("Failed to cancel transfer")?;
            }
        }
    }

    rx.await
        .context("Completion signal dropped")?
        .map_err(Into::into)
}

pub fn bulk_write(
    device: &UsbDevice,
    endpoint: u8,
    mut data: Vec<u8>,
    interface: Option<u8>,
    timeout: u32,
) -> Result<()> {
    if endpoint & 0x80 != 0 {
        return Err(anyhow!("Endpoint {:#04x} is not an OUT endpoint", endpoint));
    }
    if let Some(interface) = interface {
        device
            .claim_interface(interface)
            .context("Failed to claim interface")?;
    }

    let length = u32::try_from(data.len()).context("Payload too large")?;
    let (written, _) = device
        .bulk_transfer(endpoint, length, timeout, &mut data)
        .context("Bulk write failed")?;
    println!("{} bytes sent", written);
    Ok(())
}

/// Format bytes as offset, 16 hex bytes and printable ASCII per line
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}:", line * 16);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

/// Hex payload given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

/// Parse `"de ad be ef"`, `"deadbeef"` or `"0xde,0xad"` into bytes
pub fn parse_hex_bytes(s: &str) -> Result<HexBytes, String> {
    let digits: String = s
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();

    if digits.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits in '{}'", s));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("Invalid hex byte in '{}'", s))
        })
        .collect::<Result<Vec<u8>, String>>()
        .map(HexBytes)
}

fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("Invalid number '{}'", s))
}

/// Decimal or `0x`-prefixed hex byte
pub fn parse_u8(s: &str) -> Result<u8, String> {
    u8::try_from(parse_number(s)?).map_err(|_| format!("'{}' does not fit in 8 bits", s))
}

/// Decimal or `0x`-prefixed hex word
pub fn parse_u16(s: &str) -> Result<u16, String> {
    u16::try_from(parse_number(s)?).map_err(|_| format!("'{}' does not fit in 16 bits", s))
}

/// `BUS:ADDR` in decimal, as printed by `list`
pub fn parse_bus_dev(s: &str) -> Result<(u8, u8), String> {
    let (bus, addr) = s
        .split_once(':')
        .ok_or_else(|| format!("Invalid '{}', expected BUS:ADDR", s))?;
    let bus = bus
        .parse()
        .map_err(|_| format!("Invalid bus number '{}'", bus))?;
    let addr = addr
        .parse()
        .map_err(|_| format!("Invalid device address '{}'", addr))?;
    Ok((bus, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_device_descriptor;
    use engine::EngineConfig;
    use engine::test_utils::{KernelCall, MockKernel};
    use std::sync::Arc;

    fn mock_device() -> (Arc<MockKernel>, UsbDevice) {
        let kernel = Arc::new(MockKernel::new());
        let config = EngineConfig::default().with_poll_interval(Duration::from_millis(5));
        let device = UsbDevice::with_backend(kernel.clone(), config).unwrap();
        (kernel, device)
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u8("0x81"), Ok(0x81));
        assert_eq!(parse_u8("129"), Ok(129));
        assert!(parse_u8("0x100").is_err());
        assert_eq!(parse_u16("0x0100"), Ok(0x0100));
        assert!(parse_u16("abc").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        let expected = HexBytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex_bytes("de ad be ef"), Ok(expected.clone()));
        assert_eq!(parse_hex_bytes("deadbeef"), Ok(expected.clone()));
        assert_eq!(parse_hex_bytes("0xde,0xad,0xbe,0xef"), Ok(expected));
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
        assert_eq!(parse_hex_bytes(""), Ok(HexBytes(Vec::new())));
    }

    #[test]
    fn test_parse_bus_dev() {
        assert_eq!(parse_bus_dev("1:4"), Ok((1, 4)));
        assert_eq!(parse_bus_dev("003:012"), Ok((3, 12)));
        assert!(parse_bus_dev("1-4").is_err());
        assert!(parse_bus_dev("1:300").is_err());
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(b"Hello, usbfs!\x00\x01\x02\xff");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000: 48 65 6c 6c 6f"));
        assert!(lines[0].ends_with("|Hello, usbfs!...|"));
        assert!(lines[1].starts_with("0010: ff"));
        assert!(hex_dump(&[]).is_empty());
    }

    #[test]
    fn test_resolve_selector() {
        let config = ToolConfig::default();

        let sel = DeviceSelector::resolve(None, Some("0x1234:0x5678"), None, &config).unwrap();
        assert_eq!(sel, DeviceSelector::VidPid(0x1234, 0x5678));

        let sel = DeviceSelector::resolve(None, None, Some((1, 4)), &config).unwrap();
        assert_eq!(sel, DeviceSelector::BusDev(1, 4));

        let sel = DeviceSelector::resolve(
            Some(PathBuf::from("/dev/bus/usb/001/004")),
            None,
            None,
            &config,
        )
        .unwrap();
        assert_eq!(sel, DeviceSelector::Path(PathBuf::from("/dev/bus/usb/001/004")));

        assert!(DeviceSelector::resolve(None, None, None, &config).is_err());
    }

    #[test]
    fn test_resolve_falls_back_to_configured_default() {
        let mut config = ToolConfig::default();
        config.device.default = Some("04f9:0042".to_string());

        let sel = DeviceSelector::resolve(None, None, None, &config).unwrap();
        assert_eq!(sel, DeviceSelector::VidPid(0x04f9, 0x0042));
    }

    #[test]
    fn test_descriptor_reads_device_descriptor() {
        let (kernel, device) = mock_device();
        kernel.set_control_response(&create_mock_device_descriptor());

        descriptor(&device, 18, 1000).unwrap();
        assert_eq!(
            kernel.calls(),
            vec![KernelCall::Control {
                request_type: 0x80,
                request: 0x06,
                value: 0x0100,
                index: 0,
                length: 18,
                timeout: 1000,
            }]
        );
    }

    #[test]
    fn test_control_rejects_data_on_in_request() {
        let (kernel, device) = mock_device();
        let args = ControlArgs {
            request_type: 0xC0,
            request: 0x01,
            value: 0,
            index: 0,
            length: 4,
            data: Some(vec![1]),
            timeout: 100,
        };
        assert!(control(&device, args).is_err());
        assert_eq!(kernel.call_count(), 0);
    }

    #[test]
    fn test_bulk_write_claims_interface() {
        let (kernel, device) = mock_device();
        bulk_write(&device, 0x02, vec![1, 2, 3], Some(0), 500).unwrap();
        assert_eq!(
            kernel.calls(),
            vec![
                KernelCall::ClaimInterface(0),
                KernelCall::Bulk {
                    endpoint: 0x02,
                    length: 3,
                    timeout: 500
                },
            ]
        );
    }

    #[test]
    fn test_bulk_direction_is_checked() {
        let (kernel, device) = mock_device();
        assert!(bulk_write(&device, 0x81, vec![1], None, 0).is_err());
        assert_eq!(kernel.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_read_is_cancelled_after_timeout() {
        let (kernel, device) = mock_device();

        let err = bulk_read(&device, 0x81, 8, None, 20, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed"));

        let discarded = kernel
            .calls()
            .iter()
            .any(|c| matches!(c, KernelCall::DiscardUrb { .. }));
        assert!(discarded);
        assert_eq!(device.pending_count(), 0);
    }
}
