//! User-supplied criteria deciding which discovered alt-settings survive.

/// One vendor or product criterion. `*` on the command line means match
/// anything, `-` means match nothing (used internally to exclude
/// run-time candidates after a detach).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchValue {
    #[default]
    Any,
    Only(u16),
    Impossible,
}

impl MatchValue {
    pub fn matches(self, value: u16) -> bool {
        match self {
            MatchValue::Any => true,
            MatchValue::Only(id) => id == value,
            MatchValue::Impossible => false,
        }
    }

    pub fn is_any(self) -> bool {
        self == MatchValue::Any
    }

    /// Parse one token of a `-d` specification. Absent or unparseable
    /// tokens keep the given default.
    fn parse(token: Option<&str>, default: MatchValue) -> MatchValue {
        match token {
            None | Some("") => default,
            Some(t) if t.starts_with('*') => MatchValue::Any,
            Some(t) if t.starts_with('-') => MatchValue::Impossible,
            Some(t) => u16::from_str_radix(t, 16)
                .map(MatchValue::Only)
                .unwrap_or(default),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeviceMatch {
    pub path: Option<String>,
    pub vendor: MatchValue,
    pub product: MatchValue,
    pub vendor_dfu: MatchValue,
    pub product_dfu: MatchValue,
    /// Matches `bConfigurationValue`. A user-supplied 0 (unconfigured
    /// device) is treated as absent.
    pub config: Option<u8>,
    /// Positional index of the interface within its configuration.
    pub iface_index: Option<usize>,
    pub alt_index: Option<u8>,
    pub alt_name: Option<String>,
    pub devnum: Option<u8>,
    pub serial: Option<String>,
    pub serial_dfu: Option<String>,
}

impl DeviceMatch {
    /// Apply a `vendor:product[,vendor_dfu:product_dfu]` specification.
    /// The second pair, when present, overrides for DFU-mode candidates;
    /// a leading comma excludes run-time candidates entirely.
    pub fn set_vendor_product(&mut self, spec: &str) {
        self.vendor = MatchValue::Any;
        self.product = MatchValue::Any;
        self.vendor_dfu = MatchValue::Any;
        self.product_dfu = MatchValue::Any;

        let (runtime, dfu) = match spec.split_once(',') {
            Some((r, d)) => (r, Some(d)),
            None => (spec, None),
        };

        if runtime.is_empty() && dfu.is_some() {
            // DFU mode vendor/product being specified without any
            // runtime specification: don't match any runtime device
            self.vendor = MatchValue::Impossible;
            self.product = MatchValue::Impossible;
        } else {
            let (v, p) = match runtime.split_once(':') {
                Some((v, p)) => (v, Some(p)),
                None => (runtime, None),
            };
            self.vendor = MatchValue::parse(Some(v), self.vendor);
            self.product = MatchValue::parse(p, self.product);
            if dfu.is_some() {
                // Both specifications given: DFU components default to
                // the runtime ones
                self.vendor_dfu = self.vendor;
                self.product_dfu = self.product;
            }
        }

        if let Some(dfu) = dfu {
            let (v, p) = match dfu.split_once(':') {
                Some((v, p)) => (v, Some(p)),
                None => (dfu, None),
            };
            self.vendor_dfu = MatchValue::parse(Some(v), self.vendor_dfu);
            self.product_dfu = MatchValue::parse(p, self.product_dfu);
        }
    }

    /// Apply a `serial[,serial_dfu]` specification. Empty components
    /// match anything.
    pub fn set_serial(&mut self, spec: &str) {
        let (runtime, dfu) = match spec.split_once(',') {
            Some((r, d)) => (r, d),
            None => (spec, spec),
        };
        self.serial = if runtime.is_empty() {
            None
        } else {
            Some(runtime.to_string())
        };
        self.serial_dfu = if dfu.is_empty() {
            None
        } else {
            Some(dfu.to_string())
        };
    }

    pub fn set_config(&mut self, config: u8) {
        // "-c 0" (unconfigured device) means don't care
        self.config = if config == 0 { None } else { Some(config) };
    }

    /// Force only DFU-mode candidates to match in the re-probe after a
    /// detach; a bus reset gives the device a new address, so run-time
    /// matches would be ambiguous.
    pub fn force_dfu_mode_only(&mut self) {
        self.vendor = MatchValue::Impossible;
        self.product = MatchValue::Impossible;
    }
}
