//! Descriptor walker: enumerate USB devices and collect every
//! DFU-capable alt-setting that passes the match criteria.

use log::warn;
use nusb::{
    MaybeFuture,
    descriptors::{ConfigurationDescriptor, InterfaceDescriptor},
    transfer::{ControlIn, ControlType, Recipient},
};

use crate::DEFAULT_TIMEOUT;
use crate::descriptor::{DfuDescriptor, DFU_DESC_LEN, DFU_DESC_TYPE};
use crate::error::DfuError;
use crate::interface::DfuInterface;
use crate::matching::DeviceMatch;
use crate::quirks::Quirks;

const DFU_CLASS: u8 = 0xfe;
const DFU_SUBCLASS: u8 = 0x01;

const USB_DT_DEVICE: u8 = 0x01;
const USB_DT_STRING: u8 = 0x03;
const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;

const UNKNOWN_NAME: &str = "UNKNOWN";

/// Walk all attached devices and return the matching DFU alt-settings
/// in discovery order.
pub fn probe_devices(
    criteria: &DeviceMatch,
) -> Result<Vec<DfuInterface>, DfuError> {
    let mut found = Vec::new();
    for info in nusb::list_devices().wait()? {
        if let Some(path) = &criteria.path {
            if device_path(&info) != *path {
                continue;
            }
        }
        if !info
            .interfaces()
            .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
        {
            continue;
        }
        let device = match info.open().wait() {
            Ok(device) => device,
            Err(err) => {
                warn!(
                    "Cannot open DFU device {:04x}:{:04x} found on devnum {} ({})",
                    info.vendor_id(),
                    info.product_id(),
                    info.device_address(),
                    err
                );
                continue;
            }
        };
        if let Err(err) =
            probe_configurations(&info, &device, criteria, &mut found)
        {
            warn!(
                "Error probing device {:04x}:{:04x}: {}",
                info.vendor_id(),
                info.product_id(),
                err
            );
        }
    }
    Ok(found)
}

/// USB path in `bus-port.port...` form, e.g. `3-2.1`.
pub fn device_path(info: &nusb::DeviceInfo) -> String {
    let bus = info.bus_id().trim_start_matches('0');
    let bus = if bus.is_empty() { "0" } else { bus };
    let ports: Vec<String> = info
        .port_chain()
        .iter()
        .map(|p| p.to_string())
        .collect();
    if ports.is_empty() {
        bus.to_string()
    } else {
        format!("{}-{}", bus, ports.join("."))
    }
}

fn is_dfu_alt(alt: &InterfaceDescriptor) -> bool {
    alt.class() == DFU_CLASS && alt.subclass() == DFU_SUBCLASS
}

fn probe_configurations(
    info: &nusb::DeviceInfo,
    device: &nusb::Device,
    criteria: &DeviceMatch,
    found: &mut Vec<DfuInterface>,
) -> Result<(), DfuError> {
    let desc = raw_device_descriptor(device)?;
    let max_packet_size0 = desc[7];
    let bcd_device = u16::from_le_bytes([desc[12], desc[13]]);
    let serial_index = desc[16];
    let quirks =
        Quirks::detect(info.vendor_id(), info.product_id(), bcd_device);

    for config in device.configurations() {
        if let Some(wanted) = criteria.config {
            if wanted != config.configuration_value() {
                continue;
            }
        }
        if !config.interface_alt_settings().any(|a| is_dfu_alt(&a)) {
            continue;
        }

        let func_dfu = locate_functional_descriptor(device, &config);

        for (iface_idx, group) in config.interfaces().enumerate() {
            if let Some(wanted) = criteria.iface_index {
                if wanted != iface_idx {
                    continue;
                }
            }
            let multiple_alt = group.alt_settings().count() > 1;

            for alt in group.alt_settings() {
                if !is_dfu_alt(&alt) {
                    continue;
                }
                let dfu_mode = detect_dfu_mode(
                    info,
                    &alt,
                    &func_dfu,
                    config.num_interfaces(),
                );

                if dfu_mode {
                    if let Some(wanted) = criteria.alt_index {
                        if wanted != alt.alternate_setting() {
                            continue;
                        }
                    }
                }
                let (vendor_ok, product_ok) = if dfu_mode {
                    (
                        criteria.vendor_dfu.matches(info.vendor_id()),
                        criteria.product_dfu.matches(info.product_id()),
                    )
                } else {
                    (
                        criteria.vendor.matches(info.vendor_id()),
                        criteria.product.matches(info.product_id()),
                    )
                };
                if !vendor_ok || !product_ok {
                    continue;
                }
                if let Some(devnum) = criteria.devnum {
                    if devnum != info.device_address() {
                        continue;
                    }
                }

                let alt_name = alt
                    .string_index()
                    .map(u8::from)
                    .filter(|idx| *idx != 0)
                    .and_then(|idx| {
                        ascii_string_descriptor(device, idx)
                    })
                    .unwrap_or_else(|| UNKNOWN_NAME.to_string());
                let serial_name = fetch_serial(
                    device,
                    serial_index,
                    quirks,
                )
                .unwrap_or_else(|| UNKNOWN_NAME.to_string());

                if dfu_mode {
                    if let Some(wanted) = &criteria.alt_name {
                        if *wanted != alt_name {
                            continue;
                        }
                    }
                }
                let serial_criterion = if dfu_mode {
                    &criteria.serial_dfu
                } else {
                    &criteria.serial
                };
                if let Some(wanted) = serial_criterion {
                    if *wanted != serial_name {
                        continue;
                    }
                }

                let mut func_dfu = func_dfu;
                if quirks.contains(Quirks::FORCE_DFU11) {
                    func_dfu.force_version(0x0110);
                }

                found.push(DfuInterface {
                    info: info.clone(),
                    device: None,
                    vendor: info.vendor_id(),
                    product: info.product_id(),
                    bcd_device,
                    configuration: config.configuration_value(),
                    interface: alt.interface_number(),
                    alt_setting: alt.alternate_setting(),
                    devnum: info.device_address(),
                    path: device_path(info),
                    max_packet_size0,
                    alt_name,
                    serial_name,
                    dfu_mode,
                    multiple_alt,
                    func_dfu,
                    quirks,
                    layout: None,
                });
            }
        }
    }
    Ok(())
}

/// Locate the DFU functional descriptor: first type-0x21 descriptor in
/// the configuration's descriptor stream (config-level extras come
/// before interface-level ones), then an explicit GET_DESCRIPTOR
/// request, then a synthesized DFU 1.0 descriptor.
fn locate_functional_descriptor(
    device: &nusb::Device,
    config: &ConfigurationDescriptor,
) -> DfuDescriptor {
    if let Some(raw) = config
        .descriptors()
        .find(|d| d.descriptor_type() == DFU_DESC_TYPE)
    {
        return DfuDescriptor::from_bytes(&raw);
    }
    // Not all devices support requesting non-standard types directly
    if let Some(raw) = get_descriptor(
        device,
        DFU_DESC_TYPE,
        0,
        0,
        DFU_DESC_LEN as u16,
    ) {
        if raw.len() >= 2 && raw[1] == DFU_DESC_TYPE {
            return DfuDescriptor::from_bytes(&raw);
        }
    }
    warn!("Device has DFU interface, but has no DFU functional descriptor");
    DfuDescriptor::runtime_fallback()
}

fn detect_dfu_mode(
    info: &nusb::DeviceInfo,
    alt: &InterfaceDescriptor,
    func_dfu: &DfuDescriptor,
    num_interfaces: u8,
) -> bool {
    let mut dfu_mode = alt.protocol() == 2;

    /* ST DfuSe devices often use bInterfaceProtocol 0 instead of 2 */
    if func_dfu.dfu_version() == 0x011a && alt.protocol() == 0 {
        dfu_mode = true;
    }

    /* LPC DFU bootloader uses bInterfaceProtocol 1 (Runtime) instead of 2 */
    if info.vendor_id() == 0x1fc9
        && info.product_id() == 0x000c
        && alt.protocol() == 1
    {
        dfu_mode = true;
    }

    /*
     * Old Jabra devices may have bInterfaceProtocol 0 instead of 2,
     * with the same runtime and DFU PID; in DFU mode the configuration
     * has only one interface.
     */
    if info.vendor_id() == 0x0b0e
        && alt.protocol() == 0
        && num_interfaces == 1
    {
        dfu_mode = true;
    }

    dfu_mode
}

fn get_descriptor(
    device: &nusb::Device,
    desc_type: u8,
    desc_index: u8,
    language_id: u16,
    length: u16,
) -> Option<Vec<u8>> {
    device
        .control_in(
            ControlIn {
                control_type: ControlType::Standard,
                recipient: Recipient::Device,
                request: USB_REQUEST_GET_DESCRIPTOR,
                value: (desc_type as u16) << 8 | desc_index as u16,
                index: language_id,
                length,
            },
            DEFAULT_TIMEOUT,
        )
        .wait()
        .ok()
}

fn raw_device_descriptor(
    device: &nusb::Device,
) -> Result<[u8; 18], DfuError> {
    let raw = get_descriptor(device, USB_DT_DEVICE, 0, 0, 18)
        .ok_or(DfuError::Data(
            "Cannot read device descriptor".into(),
        ))?;
    let mut desc = [0u8; 18];
    if raw.len() < desc.len() {
        return Err(DfuError::Data(
            "Short device descriptor".into(),
        ));
    }
    desc.copy_from_slice(&raw[..18]);
    Ok(desc)
}

fn fetch_serial(
    device: &nusb::Device,
    serial_index: u8,
    quirks: Quirks,
) -> Option<String> {
    if serial_index == 0 {
        return None;
    }
    if quirks.contains(Quirks::UTF8_SERIAL) {
        utf8_string_descriptor(device, serial_index)
    } else {
        ascii_string_descriptor(device, serial_index)
    }
}

/// Fetch a string descriptor, tolerating the truncated `bLength` some
/// bootloaders (e.g. the STM32F427 ROM) report, and return the payload
/// bytes after the two-byte header.
fn raw_string_descriptor(
    device: &nusb::Device,
    desc_index: u8,
) -> Option<Vec<u8>> {
    /* get the language IDs and pick the first one */
    let langs = get_descriptor(device, USB_DT_STRING, 0, 0, 255)?;
    if langs.len() < 4 || langs[0] < 4 || langs[1] != USB_DT_STRING {
        warn!("Broken LANGID string descriptor");
        return None;
    }
    let langid = u16::from_le_bytes([langs[2], langs[3]]);

    let buf =
        get_descriptor(device, USB_DT_STRING, desc_index, langid, 255)?;
    if buf.len() < 2 || buf[0] < 2 {
        warn!("String descriptor {} too short", desc_index);
        return None;
    }
    if buf[1] != USB_DT_STRING {
        warn!(
            "Malformed string descriptor {}, type = 0x{:02x}",
            desc_index, buf[1]
        );
        return None;
    }
    let mut blength = buf[0] as usize;
    if blength > buf.len() {
        warn!(
            "Patching string descriptor {} length (was {}, received {})",
            desc_index,
            blength,
            buf.len()
        );
        blength = buf.len();
    }
    Some(buf[2..blength].to_vec())
}

/// UTF-16LE to ASCII, mapping characters outside the low byte to '?'.
fn ascii_string_descriptor(
    device: &nusb::Device,
    desc_index: u8,
) -> Option<String> {
    let raw = raw_string_descriptor(device, desc_index)?;
    let out: String = raw
        .chunks_exact(2)
        .map(|pair| {
            if pair[1] != 0 {
                '?'
            } else {
                pair[0] as char
            }
        })
        .collect();
    if out.is_empty() { None } else { Some(out) }
}

/// Some devices (e.g. the GD32VF103) store the serial as raw UTF-8
/// instead of UTF-16, in violation of the USB specification.
fn utf8_string_descriptor(
    device: &nusb::Device,
    desc_index: u8,
) -> Option<String> {
    let raw = raw_string_descriptor(device, desc_index)?;
    if raw.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&raw).into_owned())
}
