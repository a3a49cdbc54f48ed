use dfu::DfuInterface;

pub(crate) fn print_dfu_interface(intf: &DfuInterface) {
    println!(
        "Found {}: [{:04x}:{:04x}] ver={:04x}, devnum={}, cfg={}, \
         intf={}, path=\"{}\", alt={}, name=\"{}\", serial=\"{}\"",
        if intf.is_dfu_mode() { "DFU" } else { "Runtime" },
        intf.vendor(),
        intf.product(),
        intf.bcd_device(),
        intf.devnum(),
        intf.configuration(),
        intf.interface(),
        intf.path(),
        intf.alt_setting(),
        intf.alt_name(),
        intf.serial_name(),
    );
}

/// Walk the probe results and print out DFU interfaces.
pub(crate) fn list_dfu_interfaces(interfaces: &[DfuInterface]) {
    for intf in interfaces {
        print_dfu_interface(intf);
    }
}
