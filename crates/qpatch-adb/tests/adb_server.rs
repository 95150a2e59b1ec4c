//! Integration tests for the ADB client against an in-process fake server.
//!
//! The fake server speaks just enough of the host protocol to cover version
//! queries, device listing, shell services and sync push/pull.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use qpatch_adb::framing::{SyncHeader, SYNC_DATA, SYNC_DONE, SYNC_RECV, SYNC_SEND};
use qpatch_adb::{
    discover_device, AdbClient, AdbClientConfig, AdbError, Device, DeviceLink, DiscoveryOptions,
    DEFAULT_FILE_MODE,
};

const LISTING: &str = "List of devices attached\n\
    R58M000000A      device usb:1-2 product:panther model:Pixel_7 device:panther transport_id:1\n\
    1WMHH000000000   device usb:1-1 product:hollywood model:Quest_2 device:hollywood transport_id:3\n";

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

struct FakeServer {
    port: u16,
    files: Files,
}

impl FakeServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let files: Files = Arc::default();

        let shared = files.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let files = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, files).await;
                });
            }
        });

        Self { port, files }
    }

    fn client(&self) -> AdbClient {
        AdbClient::with_config(AdbClientConfig {
            port: self.port,
            ..AdbClientConfig::default()
        })
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let len = usize::from_str_radix(std::str::from_utf8(&prefix).unwrap(), 16).unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(String::from_utf8(payload).unwrap())
}

async fn reply_payload(stream: &mut TcpStream, payload: &str) -> std::io::Result<()> {
    stream
        .write_all(format!("OKAY{:04x}{}", payload.len(), payload).as_bytes())
        .await
}

async fn reply_fail(stream: &mut TcpStream, message: &str) -> std::io::Result<()> {
    stream
        .write_all(format!("FAIL{:04x}{}", message.len(), message).as_bytes())
        .await
}

async fn serve(mut stream: TcpStream, files: Files) -> std::io::Result<()> {
    let request = read_request(&mut stream).await?;
    match request.as_str() {
        "host:version" => reply_payload(&mut stream, "0029").await,
        "host:devices-l" => reply_payload(&mut stream, LISTING).await,
        "host:transport:1WMHH000000000" => {
            stream.write_all(b"OKAY").await?;
            let service = read_request(&mut stream).await?;
            if let Some(command) = service.strip_prefix("shell:") {
                stream.write_all(b"OKAY").await?;
                let output = match command {
                    "getprop ro.product.name" => "hollywood\n".to_string(),
                    other => format!("/system/bin/sh: {other}: inaccessible or not found\n"),
                };
                stream.write_all(output.as_bytes()).await?;
                stream.shutdown().await
            } else if service == "sync:" {
                stream.write_all(b"OKAY").await?;
                serve_sync(&mut stream, files).await
            } else {
                reply_fail(&mut stream, "unknown service").await
            }
        }
        other if other.starts_with("host:transport:") => {
            reply_fail(&mut stream, "device not found").await
        }
        _ => reply_fail(&mut stream, "unknown host service").await,
    }
}

async fn serve_sync(stream: &mut TcpStream, files: Files) -> std::io::Result<()> {
    let header = SyncHeader::read(stream).await.map_err(to_io)?;
    let mut target = vec![0u8; header.len as usize];
    stream.read_exact(&mut target).await?;
    let target = String::from_utf8(target).unwrap();

    match header.id {
        SYNC_SEND => {
            let (path, _mode) = target.rsplit_once(',').unwrap();
            let mut contents = Vec::new();
            loop {
                let packet = SyncHeader::read(stream).await.map_err(to_io)?;
                match packet.id {
                    SYNC_DATA => {
                        let mut chunk = vec![0u8; packet.len as usize];
                        stream.read_exact(&mut chunk).await?;
                        contents.extend_from_slice(&chunk);
                    }
                    SYNC_DONE => break,
                    _ => return Ok(()),
                }
            }
            files.lock().insert(path.to_string(), contents);
            stream.write_all(b"OKAY\0\0\0\0").await
        }
        SYNC_RECV => {
            let contents = files.lock().get(&target).cloned();
            match contents {
                Some(contents) => {
                    for chunk in contents.chunks(1000) {
                        SyncHeader::new(SYNC_DATA, chunk.len() as u32)
                            .write(stream)
                            .await
                            .map_err(to_io)?;
                        stream.write_all(chunk).await?;
                    }
                    SyncHeader::new(SYNC_DONE, 0).write(stream).await.map_err(to_io)
                }
                None => {
                    let message = b"No such file or directory";
                    stream.write_all(b"FAIL").await?;
                    stream.write_all(&(message.len() as u32).to_le_bytes()).await?;
                    stream.write_all(message).await
                }
            }
        }
        _ => Ok(()),
    }
}

fn to_io(e: AdbError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

fn quest() -> Device {
    Device::new("1WMHH000000000", "hollywood")
}

#[tokio::test]
async fn integration_server_version() {
    let server = FakeServer::start().await;
    assert_eq!(server.client().server_version().await.unwrap(), 0x29);
}

#[tokio::test]
async fn integration_list_devices() {
    let server = FakeServer::start().await;
    let devices = server.client().list_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1].serial, "1WMHH000000000");
    assert_eq!(devices[1].product(), Some("hollywood"));
    assert_eq!(devices[1].transport_id, Some(3));
}

#[tokio::test]
async fn integration_discovery_skips_non_headset() {
    let server = FakeServer::start().await;
    let device = discover_device(
        &server.client(),
        &DiscoveryOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(device.serial, "1WMHH000000000");
}

#[tokio::test]
async fn integration_shell_reads_until_close() {
    let server = FakeServer::start().await;
    let output = server
        .client()
        .shell(&quest(), "getprop ro.product.name")
        .await
        .unwrap();
    assert_eq!(output, "hollywood\n");
}

#[tokio::test]
async fn integration_unknown_device_is_refused() {
    let server = FakeServer::start().await;
    let stranger = Device::new("NOPE", "hollywood");
    let result = server.client().shell(&stranger, "true").await;
    match result {
        Err(AdbError::Refused(message)) => assert_eq!(message, "device not found"),
        other => panic!("expected Refused, got {:?}", other),
    }
}

#[tokio::test]
async fn integration_push_then_pull() {
    let server = FakeServer::start().await;
    let client = server.client();
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i * 7 % 256) as u8).collect();

    let mut source: &[u8] = &payload;
    let sent = client
        .push(&quest(), "/sdcard/Android/obb/blob.obb", &mut source, DEFAULT_FILE_MODE)
        .await
        .unwrap();
    assert_eq!(sent, payload.len() as u64);
    assert_eq!(
        server.files.lock().get("/sdcard/Android/obb/blob.obb"),
        Some(&payload)
    );

    let mut sink = Vec::new();
    let received = client
        .pull(&quest(), "/sdcard/Android/obb/blob.obb", &mut sink)
        .await
        .unwrap();
    assert_eq!(received, payload.len() as u64);
    assert_eq!(sink, payload);
}

#[tokio::test]
async fn integration_pull_missing_file() {
    let server = FakeServer::start().await;
    let mut sink = Vec::new();
    let result = server
        .client()
        .pull(&quest(), "/sdcard/missing.apk", &mut sink)
        .await;
    assert!(matches!(result, Err(AdbError::Sync { .. })));
    assert!(sink.is_empty());
}
