//! Device and package models parsed from ADB output.

use std::fmt;

/// Connection state of a device as seen by the ADB server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Not listed by the server
    Absent,
    /// Listed, but not usable (unauthorized, offline, missing permissions)
    Discovered,
    /// Listed and transitioning (authorizing, connecting, recovery, ...)
    Busy,
    /// Online and accepting commands
    Ready,
}

impl DeviceState {
    /// Map an ADB state word to a [`DeviceState`].
    pub fn from_adb(state: &str) -> Self {
        match state {
            "device" => DeviceState::Ready,
            "unauthorized" | "offline" | "no" | "host" => DeviceState::Discovered,
            "authorizing" | "connecting" | "recovery" | "rescue" | "sideload" | "bootloader" => {
                DeviceState::Busy
            }
            _ => DeviceState::Discovered,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Absent => "absent",
            DeviceState::Discovered => "discovered",
            DeviceState::Busy => "busy",
            DeviceState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// A device listed by `host:devices-l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Serial number, also used to select the transport
    pub serial: String,
    /// Product tag (`product:` field), e.g. `hollywood`
    pub product: Option<String>,
    /// Model name (`model:` field)
    pub model: Option<String>,
    /// Device codename (`device:` field)
    pub device: Option<String>,
    /// Transport id assigned by the server
    pub transport_id: Option<u64>,
    /// Connection state
    pub state: DeviceState,
}

impl Device {
    /// Create a ready device with the given serial and product tag.
    pub fn new(serial: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            product: Some(product.into()),
            model: None,
            device: None,
            transport_id: None,
            state: DeviceState::Ready,
        }
    }

    pub fn with_state(mut self, state: DeviceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Product tag, if the server reported one.
    pub fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == DeviceState::Ready
    }

    /// Parse one line of `devices -l` output.
    ///
    /// ```text
    /// 1WMHH000000000   device usb:1-1 product:hollywood model:Quest_2 device:hollywood transport_id:3
    /// ```
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let serial = tokens.next()?;
        let state = DeviceState::from_adb(tokens.next()?);

        let mut device = Device {
            serial: serial.to_string(),
            product: None,
            model: None,
            device: None,
            transport_id: None,
            state,
        };

        for token in tokens {
            let Some((key, value)) = token.split_once(':') else {
                continue;
            };
            match key {
                "product" => device.product = Some(value.to_string()),
                "model" => device.model = Some(value.to_string()),
                "device" => device.device = Some(value.to_string()),
                "transport_id" => device.transport_id = value.parse().ok(),
                _ => {}
            }
        }

        Some(device)
    }

    /// Parse a full `devices -l` listing.
    pub fn parse_list(listing: &str) -> Vec<Self> {
        listing
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter(|line| !line.starts_with("List of devices"))
            .filter_map(Self::parse_line)
            .collect()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.product {
            Some(product) => write!(f, "{} ({})", self.serial, product),
            None => f.write_str(&self.serial),
        }
    }
}

/// Installed package version as reported by `dumpsys package`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageVersion {
    pub version_code: u64,
    pub version_name: Option<String>,
}

impl PackageVersion {
    /// Extract the first `versionCode=`/`versionName=` pair from dumpsys output.
    ///
    /// Returns `None` when the package is not installed.
    pub fn parse_dumpsys(output: &str) -> Option<Self> {
        let mut version_code = None;
        let mut version_name = None;

        for line in output.lines().map(str::trim) {
            if version_code.is_none() {
                version_code = line
                    .split_whitespace()
                    .find_map(|token| token.strip_prefix("versionCode="))
                    .and_then(|code| code.parse::<u64>().ok());
            }
            if version_name.is_none() {
                if let Some(name) = line.strip_prefix("versionName=") {
                    version_name = Some(name.trim().to_string());
                }
            }
            if version_code.is_some() && version_name.is_some() {
                break;
            }
        }

        version_code.map(|version_code| Self {
            version_code,
            version_name,
        })
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_name {
            Some(name) => write!(f, "{} ({})", name, self.version_code),
            None => write!(f, "{}", self.version_code),
        }
    }
}
