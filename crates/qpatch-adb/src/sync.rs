//! File transfer over the ADB sync sub-protocol.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::AdbError;
use crate::framing::{
    SyncHeader, SYNC_DATA, SYNC_DATA_MAX, SYNC_DONE, SYNC_PATH_MAX, SYNC_QUIT, SYNC_RECV,
    SYNC_SEND, FAIL, OKAY,
};

/// Send `source` to `remote_path` on a stream already switched to `sync:`.
pub(crate) async fn send_file<S, R>(
    stream: &mut S,
    remote_path: &str,
    mode: u32,
    source: &mut R,
) -> Result<u64, AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin + ?Sized,
{
    let path_mode = format!("{remote_path},{mode}");
    if path_mode.len() > SYNC_PATH_MAX {
        return Err(AdbError::Framing(format!("remote path too long: {remote_path}")));
    }

    SyncHeader::new(SYNC_SEND, path_mode.len() as u32).write(stream).await?;
    stream.write_all(path_mode.as_bytes()).await?;

    let mut buffer = vec![0u8; SYNC_DATA_MAX];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        SyncHeader::new(SYNC_DATA, n as u32).write(stream).await?;
        stream.write_all(&buffer[..n]).await?;
        total += n as u64;
        trace!(path = remote_path, sent = total, "sync DATA");
    }

    SyncHeader::new(SYNC_DONE, unix_mtime()).write(stream).await?;
    stream.flush().await?;

    let reply = SyncHeader::read(stream).await?;
    match reply.id {
        OKAY => {}
        FAIL => {
            let message = read_message(stream, reply.len).await?;
            return Err(AdbError::Sync {
                path: remote_path.to_string(),
                message,
            });
        }
        _ => {
            return Err(AdbError::UnexpectedResponse(format!(
                "sync reply {} after SEND",
                reply.id_str()
            )))
        }
    }

    quit(stream).await;
    Ok(total)
}

/// Receive `remote_path` into `sink` on a stream already switched to `sync:`.
pub(crate) async fn recv_file<S, W>(
    stream: &mut S,
    remote_path: &str,
    sink: &mut W,
) -> Result<u64, AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    if remote_path.len() > SYNC_PATH_MAX {
        return Err(AdbError::Framing(format!("remote path too long: {remote_path}")));
    }

    SyncHeader::new(SYNC_RECV, remote_path.len() as u32)
        .write(stream)
        .await?;
    stream.write_all(remote_path.as_bytes()).await?;
    stream.flush().await?;

    let mut buffer = vec![0u8; SYNC_DATA_MAX];
    let mut total = 0u64;
    loop {
        let header = SyncHeader::read(stream).await?;
        match header.id {
            SYNC_DATA => {
                let len = header.len as usize;
                if len > SYNC_DATA_MAX {
                    return Err(AdbError::Framing(format!(
                        "sync DATA chunk too large: {len} bytes"
                    )));
                }
                stream.read_exact(&mut buffer[..len]).await?;
                sink.write_all(&buffer[..len]).await?;
                total += len as u64;
            }
            SYNC_DONE => break,
            FAIL => {
                let message = read_message(stream, header.len).await?;
                return Err(AdbError::Sync {
                    path: remote_path.to_string(),
                    message,
                });
            }
            _ => {
                return Err(AdbError::UnexpectedResponse(format!(
                    "sync packet {} during RECV",
                    header.id_str()
                )))
            }
        }
    }

    sink.flush().await?;
    quit(stream).await;
    Ok(total)
}

async fn read_message<S>(stream: &mut S, len: u32) -> Result<String, AdbError>
where
    S: AsyncRead + Unpin,
{
    let len = (len as usize).min(SYNC_DATA_MAX);
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(String::from_utf8_lossy(&message).into_owned())
}

/// Best-effort QUIT; the server closes the socket either way.
async fn quit<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let _ = SyncHeader::new(SYNC_QUIT, 0).write(stream).await;
    let _ = stream.flush().await;
}

fn unix_mtime() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
