//! Allow-list device discovery.
//!
//! Discovery polls the device list at a fixed interval until an allow-listed
//! device shows up. The wait can be bounded by a timeout or a poll budget and
//! is always abortable through a [`CancellationToken`].

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::AdbError;
use crate::traits::DeviceLink;

/// Product tags of supported headsets.
pub const DEFAULT_ALLOWED_PRODUCTS: [&str; 4] = [
    "vr_monterey", // Quest 1
    "hollywood",   // Quest 2
    "seacliff",    // Quest Pro
    "eureka",      // Quest 3
];

/// Discovery parameters.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Product tags that qualify a device
    pub allowed_products: Vec<String>,
    /// Sleep between two scans
    pub poll_interval: Duration,
    /// Give up after this long (`None` = wait indefinitely)
    pub timeout: Option<Duration>,
    /// Give up after this many scans (`None` = unbounded)
    pub max_polls: Option<u32>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            allowed_products: DEFAULT_ALLOWED_PRODUCTS.iter().map(|p| p.to_string()).collect(),
            poll_interval: Duration::from_secs(1),
            timeout: None,
            max_polls: None,
        }
    }
}

/// Why discovery stopped without a device.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no allow-listed device found after {polls} scans")]
    NotFound { polls: u32 },

    #[error("device discovery cancelled")]
    Cancelled,

    #[error(transparent)]
    Link(#[from] AdbError),
}

/// First ready device whose product tag is allow-listed.
pub fn select_device<'a>(devices: &'a [Device], allowed_products: &[String]) -> Option<&'a Device> {
    devices.iter().find(|device| {
        device.is_ready()
            && device
                .product()
                .is_some_and(|product| allowed_products.iter().any(|allowed| allowed == product))
    })
}

/// Poll `link` until an allow-listed device appears.
pub async fn discover_device<L>(
    link: &L,
    options: &DiscoveryOptions,
    cancel: &CancellationToken,
) -> Result<Device, DiscoveryError>
where
    L: DeviceLink + ?Sized,
{
    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let mut polls = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }

        let devices = link.list_devices().await?;
        polls += 1;

        if let Some(device) = select_device(&devices, &options.allowed_products) {
            info!(serial = %device.serial, product = ?device.product, polls, "Found device");
            return Ok(device.clone());
        }

        for device in devices.iter().filter(|d| !d.is_ready()) {
            debug!(serial = %device.serial, state = %device.state, "Device listed but not ready");
        }

        if options.max_polls.is_some_and(|max| polls >= max) {
            return Err(DiscoveryError::NotFound { polls });
        }

        let mut wake = Instant::now() + options.poll_interval;
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(DiscoveryError::NotFound { polls });
            }
            wake = wake.min(deadline);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(DiscoveryError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
