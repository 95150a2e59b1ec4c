//! In-memory device link for tests.
//!
//! [`MockDeviceLink`] simulates one device's filesystem and package manager
//! well enough to drive the pipeline: it understands the shell commands the
//! [`DeviceLink`] provided methods issue and records every command it sees.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::device::Device;
use crate::error::AdbError;
use crate::traits::DeviceLink;

/// A package installed on the mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPackage {
    pub version_code: u64,
    pub version_name: Option<String>,
    pub apk_path: String,
}

struct ScriptedReply {
    prefix: String,
    output: String,
    remaining: Option<u32>,
}

#[derive(Default)]
struct MockState {
    device_lists: VecDeque<Vec<Device>>,
    listing_failure: Option<String>,
    polls: u32,
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    packages: HashMap<String, MockPackage>,
    install_target: Option<(String, u64)>,
    scripts: Vec<ScriptedReply>,
    push_failures: Vec<(String, String)>,
    commands: Vec<String>,
}

/// Mock device link.
pub struct MockDeviceLink {
    state: Mutex<MockState>,
}

impl MockDeviceLink {
    /// A link with no devices, files or packages.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Every scan returns `devices`.
    pub fn with_devices(self, devices: Vec<Device>) -> Self {
        {
            let mut state = self.state.lock();
            state.device_lists.clear();
            state.device_lists.push_back(devices);
        }
        self
    }

    /// Queue the result of one scan; the last queued list repeats.
    pub fn queue_devices(self, devices: Vec<Device>) -> Self {
        self.state.lock().device_lists.push_back(devices);
        self
    }

    /// Make every scan fail with a connection error.
    pub fn fail_listing(self, message: &str) -> Self {
        self.state.lock().listing_failure = Some(message.to_string());
        self
    }

    /// Pre-install `package` with the given archive bytes.
    pub fn with_package(self, package: &str, version_code: u64, apk: Vec<u8>) -> Self {
        {
            let mut state = self.state.lock();
            let apk_path = format!("/data/app/{package}-1/base.apk");
            state.files.insert(apk_path.clone(), apk);
            state.packages.insert(
                package.to_string(),
                MockPackage {
                    version_code,
                    version_name: Some(version_code.to_string()),
                    apk_path,
                },
            );
        }
        self
    }

    /// Place a file on the mock device.
    pub fn with_file(self, path: &str, contents: Vec<u8>) -> Self {
        self.state.lock().files.insert(path.to_string(), contents);
        self
    }

    /// Package name and version code that `pm install` registers.
    pub fn installs_as(self, package: &str, version_code: u64) -> Self {
        self.state.lock().install_target = Some((package.to_string(), version_code));
        self
    }

    /// Answer shell commands starting with `prefix` with `output`.
    pub fn script(self, prefix: &str, output: &str) -> Self {
        self.push_script(prefix, output, None)
    }

    /// Answer the next shell command starting with `prefix` with `output`.
    pub fn script_once(self, prefix: &str, output: &str) -> Self {
        self.push_script(prefix, output, Some(1))
    }

    fn push_script(self, prefix: &str, output: &str, remaining: Option<u32>) -> Self {
        self.state.lock().scripts.push(ScriptedReply {
            prefix: prefix.to_string(),
            output: output.to_string(),
            remaining,
        });
        self
    }

    /// Reject pushes to paths starting with `prefix`.
    pub fn fail_push(self, prefix: &str, message: &str) -> Self {
        self.state
            .lock()
            .push_failures
            .push((prefix.to_string(), message.to_string()));
        self
    }

    /// Number of device scans performed.
    pub fn polls(&self) -> u32 {
        self.state.lock().polls
    }

    /// Shell commands issued, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Contents of a file on the mock device.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(path)
    }

    pub fn package(&self, package: &str) -> Option<MockPackage> {
        self.state.lock().packages.get(package).cloned()
    }

    /// Archive bytes currently installed for `package`.
    pub fn installed_archive(&self, package: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let installed = state.packages.get(package)?;
        state.files.get(&installed.apk_path).cloned()
    }

    fn run_shell(&self, command: &str) -> String {
        let mut state = self.state.lock();
        state.commands.push(command.to_string());

        if let Some(index) = state
            .scripts
            .iter()
            .position(|script| command.starts_with(&script.prefix))
        {
            let output = state.scripts[index].output.clone();
            if let Some(remaining) = state.scripts[index].remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    state.scripts.remove(index);
                }
            }
            return output;
        }

        let args: Vec<String> = command
            .split_whitespace()
            .map(|arg| arg.trim_matches('\'').to_string())
            .collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        match args.as_slice() {
            ["mkdir", "-p", dir] => {
                state.dirs.insert(dir.to_string());
                String::new()
            }
            ["rm", "-f", path] => {
                state.files.remove(*path);
                String::new()
            }
            ["stat", "-c", "%s", path] => match state.files.get(*path) {
                Some(contents) => format!("{}\n", contents.len()),
                None => format!("stat: '{path}': No such file or directory\n"),
            },
            ["dumpsys", "package", package] => match state.packages.get(*package) {
                Some(installed) => format!(
                    "Packages:\n  Package [{package}] (1a2b3c):\n    versionCode={} minSdk=29 targetSdk=29\n    versionName={}\n",
                    installed.version_code,
                    installed.version_name.clone().unwrap_or_default()
                ),
                None => format!("Unable to find package: {package}\n"),
            },
            ["pm", "path", package] => match state.packages.get(*package) {
                Some(installed) => format!("package:{}\n", installed.apk_path),
                None => String::new(),
            },
            ["pm", "uninstall", package] => match state.packages.remove(*package) {
                Some(installed) => {
                    state.files.remove(&installed.apk_path);
                    "Success\n".to_string()
                }
                None => "Failure [DELETE_FAILED_INTERNAL_ERROR]\n".to_string(),
            },
            ["pm", "install", "-r", path] => {
                let Some(contents) = state.files.get(*path).cloned() else {
                    return format!("Failure [INSTALL_FAILED_INVALID_URI: {path}]\n");
                };
                let Some((package, version_code)) = state.install_target.clone() else {
                    return "Failure [INSTALL_PARSE_FAILED_NOT_APK]\n".to_string();
                };
                let apk_path = format!("/data/app/{package}-1/base.apk");
                state.files.insert(apk_path.clone(), contents);
                state.packages.insert(
                    package,
                    MockPackage {
                        version_code,
                        version_name: Some(version_code.to_string()),
                        apk_path,
                    },
                );
                "Success\n".to_string()
            }
            _ => String::new(),
        }
    }
}

impl Default for MockDeviceLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLink for MockDeviceLink {
    async fn server_version(&self) -> Result<u32, AdbError> {
        Ok(41)
    }

    async fn list_devices(&self) -> Result<Vec<Device>, AdbError> {
        let mut state = self.state.lock();
        if let Some(message) = &state.listing_failure {
            return Err(AdbError::Connect {
                addr: "mock".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, message.clone()),
            });
        }
        state.polls += 1;
        let devices = if state.device_lists.len() > 1 {
            state.device_lists.pop_front().unwrap_or_default()
        } else {
            state.device_lists.front().cloned().unwrap_or_default()
        };
        Ok(devices)
    }

    async fn shell(&self, _device: &Device, command: &str) -> Result<String, AdbError> {
        Ok(self.run_shell(command))
    }

    async fn push(
        &self,
        _device: &Device,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        _mode: u32,
    ) -> Result<u64, AdbError> {
        let mut contents = Vec::new();
        source.read_to_end(&mut contents).await?;

        let mut state = self.state.lock();
        if let Some((_, message)) = state
            .push_failures
            .iter()
            .find(|(prefix, _)| remote_path.starts_with(prefix.as_str()))
        {
            return Err(AdbError::Sync {
                path: remote_path.to_string(),
                message: message.clone(),
            });
        }
        let len = contents.len() as u64;
        state.files.insert(remote_path.to_string(), contents);
        Ok(len)
    }

    async fn pull(
        &self,
        _device: &Device,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, AdbError> {
        let contents = self.state.lock().files.get(remote_path).cloned();
        let Some(contents) = contents else {
            return Err(AdbError::Sync {
                path: remote_path.to_string(),
                message: "No such file or directory".to_string(),
            });
        };
        sink.write_all(&contents).await?;
        sink.flush().await?;
        Ok(contents.len() as u64)
    }
}
