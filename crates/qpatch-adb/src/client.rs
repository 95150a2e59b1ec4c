//! ADB host-protocol client.
//!
//! Every operation opens a fresh TCP connection to the server, which
//! matches how the server itself scopes most services to one socket.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::device::Device;
use crate::error::AdbError;
use crate::framing::{read_length_prefixed, read_status, write_request};
use crate::sync::{recv_file, send_file};
use crate::traits::DeviceLink;

/// Address the ADB server listens on by default.
pub const DEFAULT_ADB_HOST: &str = "127.0.0.1";

/// Well-known ADB server port.
pub const DEFAULT_ADB_PORT: u16 = 5037;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection settings for [`AdbClient`].
#[derive(Debug, Clone)]
pub struct AdbClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl Default for AdbClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_ADB_HOST.to_string(),
            port: DEFAULT_ADB_PORT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Client for a local ADB server.
#[derive(Debug, Clone)]
pub struct AdbClient {
    config: AdbClientConfig,
}

impl AdbClient {
    /// Client for the server on the default address.
    pub fn new() -> Self {
        Self::with_config(AdbClientConfig::default())
    }

    pub fn with_config(config: AdbClientConfig) -> Self {
        Self { config }
    }

    /// `host:port` the client connects to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    pub fn config(&self) -> &AdbClientConfig {
        &self.config
    }

    async fn connect(&self) -> Result<TcpStream, AdbError> {
        let addr = self.addr();
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(AdbError::Connect { addr, source }),
            Err(_) => Err(AdbError::Connect {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }

    /// Send a host service request and return the stream positioned after OKAY.
    async fn host_request(&self, service: &str) -> Result<TcpStream, AdbError> {
        let mut stream = self.connect().await?;
        trace!(service, "adb host request");
        write_request(&mut stream, service).await?;
        read_status(&mut stream).await?;
        Ok(stream)
    }

    /// Send a host query and read its length-prefixed reply.
    async fn host_query(&self, service: &str) -> Result<Vec<u8>, AdbError> {
        let mut stream = self.host_request(service).await?;
        read_length_prefixed(&mut stream).await
    }

    /// Open a device service on a stream bound to the device's transport.
    async fn device_service(&self, device: &Device, service: &str) -> Result<TcpStream, AdbError> {
        let mut stream = self
            .host_request(&format!("host:transport:{}", device.serial))
            .await?;
        trace!(serial = %device.serial, service, "adb device service");
        write_request(&mut stream, service).await?;
        read_status(&mut stream).await?;
        Ok(stream)
    }
}

impl Default for AdbClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLink for AdbClient {
    async fn server_version(&self) -> Result<u32, AdbError> {
        let reply = self.host_query("host:version").await?;
        let text = String::from_utf8_lossy(&reply);
        u32::from_str_radix(text.trim(), 16)
            .map_err(|_| AdbError::UnexpectedResponse(format!("version reply {text:?}")))
    }

    async fn list_devices(&self) -> Result<Vec<Device>, AdbError> {
        let reply = self.host_query("host:devices-l").await?;
        let devices = Device::parse_list(&String::from_utf8_lossy(&reply));
        debug!(count = devices.len(), "Listed devices");
        Ok(devices)
    }

    async fn shell(&self, device: &Device, command: &str) -> Result<String, AdbError> {
        let mut stream = self.device_service(device, &format!("shell:{command}")).await?;
        let mut output = Vec::new();
        stream.read_to_end(&mut output).await?;
        debug!(serial = %device.serial, command, bytes = output.len(), "Shell command finished");
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn push(
        &self,
        device: &Device,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        mode: u32,
    ) -> Result<u64, AdbError> {
        let mut stream = self.device_service(device, "sync:").await?;
        let sent = send_file(&mut stream, remote_path, mode, source).await?;
        debug!(serial = %device.serial, path = remote_path, bytes = sent, "Pushed file");
        Ok(sent)
    }

    async fn pull(
        &self,
        device: &Device,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, AdbError> {
        let mut stream = self.device_service(device, "sync:").await?;
        let received = recv_file(&mut stream, remote_path, sink).await?;
        debug!(serial = %device.serial, path = remote_path, bytes = received, "Pulled file");
        Ok(received)
    }
}
