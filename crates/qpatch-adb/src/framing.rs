//! ADB smart-socket framing.
//!
//! Host requests are a 4-digit hex length followed by the service name.
//! Replies start with a 4-byte status (`OKAY` or `FAIL`); a `FAIL` is
//! followed by a hex length-prefixed message. The sync sub-protocol uses
//! 8-byte headers: a 4-byte id and a little-endian u32 length.

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::AdbError;

/// Largest payload a hex length prefix can describe.
pub const MAX_REQUEST_LEN: usize = 0xFFFF;

/// Largest DATA chunk the sync service accepts.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Longest remote path accepted by the sync service.
pub const SYNC_PATH_MAX: usize = 1024;

pub const OKAY: [u8; 4] = *b"OKAY";
pub const FAIL: [u8; 4] = *b"FAIL";

pub const SYNC_SEND: [u8; 4] = *b"SEND";
pub const SYNC_RECV: [u8; 4] = *b"RECV";
pub const SYNC_DATA: [u8; 4] = *b"DATA";
pub const SYNC_DONE: [u8; 4] = *b"DONE";
pub const SYNC_QUIT: [u8; 4] = *b"QUIT";

/// Reply status of a host request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Okay,
    Fail,
}

/// Encode a host request: hex length || service.
pub fn encode_request(service: &str) -> Result<Vec<u8>, AdbError> {
    let payload = service.as_bytes();
    if payload.len() > MAX_REQUEST_LEN {
        return Err(AdbError::Framing(format!(
            "request too large: {} bytes (max: {})",
            payload.len(),
            MAX_REQUEST_LEN
        )));
    }

    let mut encoded = Vec::with_capacity(4 + payload.len());
    encoded.extend_from_slice(format!("{:04x}", payload.len()).as_bytes());
    encoded.extend_from_slice(payload);
    Ok(encoded)
}

/// Decode a 4-digit hex length prefix.
pub fn decode_hex_len(prefix: &[u8; 4]) -> Result<usize, AdbError> {
    let text = std::str::from_utf8(prefix)
        .map_err(|_| AdbError::Framing(format!("non-ascii length prefix {prefix:?}")))?;
    usize::from_str_radix(text, 16)
        .map_err(|_| AdbError::Framing(format!("invalid length prefix {text:?}")))
}

/// Parse a reply status word.
pub fn parse_status(word: &[u8; 4]) -> Result<Status, AdbError> {
    match *word {
        OKAY => Ok(Status::Okay),
        FAIL => Ok(Status::Fail),
        other => Err(AdbError::UnexpectedResponse(format!(
            "expected OKAY or FAIL, got {:?}",
            String::from_utf8_lossy(&other)
        ))),
    }
}

/// Write a host request to the stream.
pub async fn write_request<W>(writer: &mut W, service: &str) -> Result<(), AdbError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let request = encode_request(service)?;
    writer.write_all(&request).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a reply status; a FAIL is turned into [`AdbError::Refused`].
pub async fn read_status<R>(reader: &mut R) -> Result<(), AdbError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut word = [0u8; 4];
    reader.read_exact(&mut word).await?;
    match parse_status(&word)? {
        Status::Okay => Ok(()),
        Status::Fail => {
            let message = read_length_prefixed(reader).await?;
            Err(AdbError::Refused(String::from_utf8_lossy(&message).into_owned()))
        }
    }
}

/// Read a hex length-prefixed payload.
pub async fn read_length_prefixed<R>(reader: &mut R) -> Result<Vec<u8>, AdbError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = decode_hex_len(&prefix)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Header of a sync sub-protocol packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHeader {
    pub id: [u8; 4],
    pub len: u32,
}

impl SyncHeader {
    pub fn new(id: [u8; 4], len: u32) -> Self {
        Self { id, len }
    }

    /// Encode as id || len (4 bytes LE)
    pub fn encode(&self) -> [u8; 8] {
        let mut encoded = [0u8; 8];
        let mut buf = &mut encoded[..];
        buf.put_slice(&self.id);
        buf.put_u32_le(self.len);
        encoded
    }

    pub fn decode(raw: &[u8; 8]) -> Self {
        let mut buf = &raw[..];
        let mut id = [0u8; 4];
        buf.copy_to_slice(&mut id);
        let len = buf.get_u32_le();
        Self { id, len }
    }

    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    pub async fn read<R>(reader: &mut R) -> Result<Self, AdbError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut raw = [0u8; 8];
        reader.read_exact(&mut raw).await?;
        Ok(Self::decode(&raw))
    }

    pub async fn write<W>(&self, writer: &mut W) -> Result<(), AdbError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_request() {
        let encoded = encode_request("host:version").unwrap();
        assert_eq!(encoded, b"000chost:version");
    }

    #[test]
    fn test_encode_request_too_large() {
        let service = "x".repeat(MAX_REQUEST_LEN + 1);
        let result = encode_request(&service);
        assert!(matches!(result, Err(AdbError::Framing(_))));
    }

    #[test]
    fn test_decode_hex_len() {
        assert_eq!(decode_hex_len(b"0029").unwrap(), 0x29);
        assert_eq!(decode_hex_len(b"ffff").unwrap(), 0xFFFF);
        assert!(decode_hex_len(b"zz00").is_err());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"OKAY").unwrap(), Status::Okay);
        assert_eq!(parse_status(b"FAIL").unwrap(), Status::Fail);
        assert!(matches!(
            parse_status(b"WHAT"),
            Err(AdbError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_sync_header_layout() {
        let header = SyncHeader::new(SYNC_DATA, 0x0102_0304);
        assert_eq!(&header.encode(), b"DATA\x04\x03\x02\x01");
    }

    #[tokio::test]
    async fn test_read_status_fail_carries_message() {
        let mut reply: &[u8] = b"FAIL0010device not found";
        match read_status(&mut reply).await {
            Err(AdbError::Refused(message)) => assert_eq!(message, "device not found"),
            other => panic!("expected Refused, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_length_prefixed_truncated() {
        let mut reply: &[u8] = b"0010short";
        let result = read_length_prefixed(&mut reply).await;
        assert!(matches!(result, Err(AdbError::Io(_))));
    }

    proptest! {
        #[test]
        fn prop_sync_header_decode_inverts_encode(
            id in prop::array::uniform4(any::<u8>()),
            len in any::<u32>(),
        ) {
            let header = SyncHeader::new(id, len);
            prop_assert_eq!(SyncHeader::decode(&header.encode()), header);
        }
    }
}
