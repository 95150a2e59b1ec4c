//! Device link for the qpatch deployment pipeline.
//!
//! This crate talks to a local ADB server over its host protocol and exposes
//! the handful of device operations the pipeline needs:
//! - device listing and allow-list discovery
//! - shell command execution
//! - file push/pull over the sync sub-protocol
//! - package version queries, install and uninstall
//!
//! The [`DeviceLink`] trait is the seam between the pipeline and the device.
//! [`AdbClient`] implements it against a real server; [`MockDeviceLink`]
//! implements it in memory for tests.

pub mod client;
pub mod device;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod server;
mod sync;
pub mod testing;
pub mod traits;

pub use client::{AdbClient, AdbClientConfig, DEFAULT_ADB_HOST, DEFAULT_ADB_PORT};
pub use device::{Device, DeviceState, PackageVersion};
pub use discovery::{
    discover_device, select_device, DiscoveryError, DiscoveryOptions, DEFAULT_ALLOWED_PRODUCTS,
};
pub use error::AdbError;
pub use server::{locate_adb, AdbServer};
pub use testing::{MockDeviceLink, MockPackage};
pub use traits::{shell_quote, DeviceLink, DEFAULT_FILE_MODE, INSTALL_STAGING_DIR};
