//! Configuration structures for the deployment pipeline.
//!
//! Every field has a default, so an empty TOML file (or no file at all)
//! configures the stock Echo VR deployment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use qpatch_adb::{
    AdbClientConfig, DiscoveryOptions, DEFAULT_ADB_HOST, DEFAULT_ADB_PORT, DEFAULT_ALLOWED_PRODUCTS,
};
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveLayout;
use crate::config_doc::DEFAULT_HOST_FIELD;
use crate::error::PatcherError;
use crate::integrity::{Sha256Digest, TrustedSet};

/// Known-good digest of the stock application archive.
pub const STOCK_ARCHIVE_SHA256: &str =
    "21c7dc914dba2fa44f8daf019aedffa4a17e14186283ef05805217fc80d30eaf";

/// Known-good digest of the stock OBB data file.
pub const STOCK_DATA_BLOB_SHA256: &str =
    "8020d1791c8806b3c9592806d2476c9b9c9771cbfcbce112914b357b66180607";

/// Main pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Target package and archive layout
    #[serde(default)]
    pub package: PackageConfig,

    /// Trusted artifact digests
    #[serde(default)]
    pub trust: TrustConfig,

    /// Bundled native-library patches
    #[serde(default)]
    pub patch: PatchConfig,

    /// Device link and discovery
    #[serde(default)]
    pub device: DeviceConfig,

    /// Archive signing
    #[serde(default)]
    pub signing: SigningConfig,

    /// Local working files
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, PatcherError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PatcherError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), PatcherError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| PatcherError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PatcherError> {
        let fail = |message: &str| Err(PatcherError::Config(message.to_string()));

        if self.package.name.trim().is_empty() {
            return fail("package.name must not be empty");
        }
        if self.package.library_member.trim().is_empty() {
            return fail("package.library_member must not be empty");
        }
        if self.package.host_field.trim().is_empty() {
            return fail("package.host_field must not be empty");
        }
        if self.trust.archive.is_empty() {
            return fail("trust.archive must list at least one digest");
        }
        if self.trust.data_blob.is_empty() {
            return fail("trust.data_blob must list at least one digest");
        }
        if self.device.allowed_products.is_empty() {
            return fail("device.allowed_products must not be empty");
        }
        if self.device.poll_interval_ms == 0 {
            return fail("device.poll_interval_ms must be greater than zero");
        }
        if self.workspace.patched_archive == self.package.archive {
            return fail("workspace.patched_archive must differ from package.archive");
        }
        Ok(())
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            allowed_products: self.device.allowed_products.clone(),
            poll_interval: Duration::from_millis(self.device.poll_interval_ms),
            timeout: self.device.discovery_timeout_secs.map(Duration::from_secs),
            max_polls: self.device.max_polls,
        }
    }

    pub fn adb_client_config(&self) -> AdbClientConfig {
        AdbClientConfig {
            host: self.device.adb_host.clone(),
            port: self.device.adb_port,
            ..AdbClientConfig::default()
        }
    }

    pub fn archive_layout(&self) -> ArchiveLayout {
        ArchiveLayout {
            library_member: self.package.library_member.clone(),
            config_member: self.package.config_member.clone(),
            signing_dir: self.package.signing_dir.clone(),
            host_field: self.package.host_field.clone(),
            stored_members: self.package.stored_members.clone(),
        }
    }

    /// Directory the archive is extracted into.
    pub fn working_tree_dir(&self) -> PathBuf {
        self.workspace.dir.join("extractedapk")
    }

    /// Remote path of the OBB data file.
    pub fn remote_data_blob_path(&self) -> String {
        format!(
            "{}/{}",
            self.package.remote_data_dir.trim_end_matches('/'),
            file_name(&self.package.data_blob)
        )
    }

    /// Trusted library digests: sources of bundled patches plus extras.
    pub fn trusted_libraries(&self) -> TrustedSet {
        let mut trusted: TrustedSet = self.patch.bundled.iter().map(|p| p.source_hash).collect();
        trusted.extend(self.trust.extra_libraries.iter().copied());
        trusted
    }
}

/// File name component of `path` as a string.
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Target package and archive layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Android package name
    #[serde(default = "default_package_name")]
    pub name: String,

    /// Version code the bundled patches were built against
    #[serde(default = "default_version_code")]
    pub version_code: u64,

    /// Local path of the original archive
    #[serde(default = "default_archive")]
    pub archive: PathBuf,

    /// Local path of the OBB data file
    #[serde(default = "default_data_blob")]
    pub data_blob: PathBuf,

    /// Remote directory holding the OBB data file
    #[serde(default = "default_remote_data_dir")]
    pub remote_data_dir: String,

    /// Archive member receiving the binary patch
    #[serde(default = "default_library_member")]
    pub library_member: String,

    /// Archive member holding the config document
    #[serde(default = "default_config_member")]
    pub config_member: String,

    /// Config document field that receives the device serial
    #[serde(default = "default_host_field")]
    pub host_field: String,

    /// Signing metadata directory removed before repacking
    #[serde(default = "default_signing_dir")]
    pub signing_dir: String,

    /// Members written uncompressed
    #[serde(default = "default_stored_members")]
    pub stored_members: Vec<String>,

    /// Config document to inject instead of the bundled one
    #[serde(default)]
    pub config_document: Option<PathBuf>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: default_package_name(),
            version_code: default_version_code(),
            archive: default_archive(),
            data_blob: default_data_blob(),
            remote_data_dir: default_remote_data_dir(),
            library_member: default_library_member(),
            config_member: default_config_member(),
            host_field: default_host_field(),
            signing_dir: default_signing_dir(),
            stored_members: default_stored_members(),
            config_document: None,
        }
    }
}

/// Trusted artifact digests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Accepted digests of the original archive
    #[serde(default = "default_trusted_archive")]
    pub archive: TrustedSet,

    /// Accepted digests of the OBB data file
    #[serde(default = "default_trusted_data_blob")]
    pub data_blob: TrustedSet,

    /// Library digests accepted in addition to the bundled patch sources
    #[serde(default)]
    pub extra_libraries: TrustedSet,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            archive: default_trusted_archive(),
            data_blob: default_trusted_data_blob(),
            extra_libraries: TrustedSet::default(),
        }
    }
}

/// Bundled patches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchConfig {
    #[serde(default)]
    pub bundled: Vec<BundledPatch>,
}

/// One `[[patch.bundled]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundledPatch {
    /// Digest of the library the patch applies to
    pub source_hash: Sha256Digest,
    /// BSDIFF40 patch file, relative to the config file
    pub file: PathBuf,
    /// Digest of the patched library, when known
    #[serde(default)]
    pub target_hash: Option<Sha256Digest>,
}

/// Device link and discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// ADB executable (empty = `adb` from PATH)
    #[serde(default)]
    pub adb_path: Option<PathBuf>,

    #[serde(default = "default_adb_host")]
    pub adb_host: String,

    #[serde(default = "default_adb_port")]
    pub adb_port: u16,

    /// Product tags of supported headsets
    #[serde(default = "default_allowed_products")]
    pub allowed_products: Vec<String>,

    /// Delay between device scans in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up discovery after this many seconds (empty = wait forever)
    #[serde(default)]
    pub discovery_timeout_secs: Option<u64>,

    /// Give up discovery after this many scans
    #[serde(default)]
    pub max_polls: Option<u32>,

    /// Reinstall the original archive when installing the patched one fails
    #[serde(default = "default_true")]
    pub rollback_on_install_failure: bool,

    /// Remote directory for staged archives
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: None,
            adb_host: default_adb_host(),
            adb_port: default_adb_port(),
            allowed_products: default_allowed_products(),
            poll_interval_ms: default_poll_interval_ms(),
            discovery_timeout_secs: None,
            max_polls: None,
            rollback_on_install_failure: true,
            staging_dir: default_staging_dir(),
        }
    }
}

/// Archive signing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// `apksigner` executable
    #[serde(default = "default_apksigner")]
    pub apksigner: PathBuf,

    /// `zipalign` executable (empty = skip alignment)
    #[serde(default = "default_zipalign")]
    pub zipalign: Option<PathBuf>,

    /// Keystore (empty = the Android debug keystore)
    #[serde(default)]
    pub keystore: Option<PathBuf>,

    #[serde(default = "default_keystore_password")]
    pub keystore_password: String,

    #[serde(default = "default_key_alias")]
    pub key_alias: Option<String>,

    #[serde(default)]
    pub key_password: Option<String>,

    /// Run `apksigner verify` after signing
    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            apksigner: default_apksigner(),
            zipalign: default_zipalign(),
            keystore: None,
            keystore_password: default_keystore_password(),
            key_alias: default_key_alias(),
            key_password: None,
            verify: true,
        }
    }
}

impl SigningConfig {
    /// Configured keystore, or `~/.android/debug.keystore`.
    pub fn keystore_path(&self) -> Option<PathBuf> {
        self.keystore.clone().or_else(|| {
            directories::BaseDirs::new()
                .map(|dirs| dirs.home_dir().join(".android").join("debug.keystore"))
        })
    }
}

/// Local working files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Scratch directory
    #[serde(default = "default_workspace_dir")]
    pub dir: PathBuf,

    /// Output path of the patched archive
    #[serde(default = "default_patched_archive")]
    pub patched_archive: PathBuf,

    /// Keep the patched archive after a successful deployment
    #[serde(default)]
    pub keep_outputs: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace_dir(),
            patched_archive: default_patched_archive(),
            keep_outputs: false,
        }
    }
}

/// Log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter used when no CLI flag overrides it
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions

fn default_package_name() -> String {
    "com.readyatdawn.r15".to_string()
}

fn default_version_code() -> u64 {
    4987566
}

fn default_archive() -> PathBuf {
    PathBuf::from("r15_goldmaster_store.apk")
}

fn default_data_blob() -> PathBuf {
    PathBuf::from("main.4987566.com.readyatdawn.r15.obb")
}

fn default_remote_data_dir() -> String {
    "/sdcard/Android/obb/com.readyatdawn.r15".to_string()
}

fn default_library_member() -> String {
    "lib/arm64-v8a/libpnsovr.so".to_string()
}

fn default_config_member() -> String {
    "assets/_local/config.json".to_string()
}

fn default_host_field() -> String {
    DEFAULT_HOST_FIELD.to_string()
}

fn default_signing_dir() -> String {
    "META-INF".to_string()
}

fn default_stored_members() -> Vec<String> {
    vec!["resources.arsc".to_string()]
}

fn default_trusted_archive() -> TrustedSet {
    trusted_from_hex(STOCK_ARCHIVE_SHA256)
}

fn default_trusted_data_blob() -> TrustedSet {
    trusted_from_hex(STOCK_DATA_BLOB_SHA256)
}

fn trusted_from_hex(hex: &str) -> TrustedSet {
    hex.parse::<Sha256Digest>().into_iter().collect()
}

fn default_adb_host() -> String {
    DEFAULT_ADB_HOST.to_string()
}

fn default_adb_port() -> u16 {
    DEFAULT_ADB_PORT
}

fn default_allowed_products() -> Vec<String> {
    DEFAULT_ALLOWED_PRODUCTS.iter().map(|p| p.to_string()).collect()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_staging_dir() -> String {
    qpatch_adb::INSTALL_STAGING_DIR.to_string()
}

fn default_apksigner() -> PathBuf {
    PathBuf::from("apksigner")
}

fn default_zipalign() -> Option<PathBuf> {
    Some(PathBuf::from("zipalign"))
}

fn default_keystore_password() -> String {
    "android".to_string()
}

fn default_key_alias() -> Option<String> {
    Some("androiddebugkey".to_string())
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_patched_archive() -> PathBuf {
    PathBuf::from("r15_goldmaster_store_patched.apk")
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_true() -> bool {
    true
}
