//! Request/response chunk codec
//!
//! Every payload travels as `[u32 BE compressed length][compressed bytes]`.
//! A response chunk is one result-code byte followed by such a payload: the
//! typed object on success, a UTF-8 message otherwise. Reading the code first
//! lets the caller fail fast without decoding a payload that isn't there.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CrawlerError, Result};

/// Largest payload accepted in either direction (compressed or not)
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// Error strings are truncated to this many bytes
pub const MAX_ERROR_MESSAGE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    InvalidRequest,
    ServerError,
    Unknown(u8),
}

impl ResultCode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => ResultCode::Success,
            1 => ResultCode::InvalidRequest,
            2 => ResultCode::ServerError,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ResultCode::Success => 0,
            ResultCode::InvalidRequest => 1,
            ResultCode::ServerError => 2,
            ResultCode::Unknown(b) => b,
        }
    }
}

/// Payload compression scheme; its tag is the last protocol id segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Identity,
}

impl Compression {
    pub fn encoding(&self) -> &'static str {
        match self {
            Compression::Gzip => "bincode_gzip",
            Compression::Identity => "bincode",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Identity => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompress, refusing output larger than `limit`
    pub fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compression::Identity => data.to_vec(),
            Compression::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data)
                    .take(limit as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| CrawlerError::Decode(format!("decompress: {}", e)))?;
                out
            }
        };
        if out.len() > limit {
            return Err(CrawlerError::Protocol(format!(
                "payload exceeds {} bytes after decompression",
                limit
            )));
        }
        Ok(out)
    }
}

/// Write one length-delimited, compressed payload
pub async fn write_payload<W>(writer: &mut W, compression: Compression, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CrawlerError::Protocol(format!(
            "payload of {} bytes exceeds {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let data = compression.compress(payload)?;
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    Ok(())
}

/// Read one length-delimited, compressed payload. A stream that ends early is
/// a decode error, never an empty payload.
pub async fn read_payload<R>(reader: &mut R, compression: Compression) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await.map_err(truncated)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(CrawlerError::Protocol(format!(
            "declared payload length {} exceeds {}",
            len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(truncated)?;
    compression.decompress(&data, MAX_PAYLOAD_SIZE)
}

fn truncated(e: std::io::Error) -> CrawlerError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CrawlerError::Decode("truncated payload".to_string())
    } else {
        CrawlerError::Io(e)
    }
}

/// Write a result code followed by its payload
pub async fn write_chunk<W>(
    writer: &mut W,
    code: ResultCode,
    compression: Compression,
    payload: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[code.to_byte()]).await?;
    write_payload(writer, compression, payload).await
}

/// Write an error chunk carrying a (truncated) UTF-8 message
pub async fn write_error_chunk<W>(
    writer: &mut W,
    code: ResultCode,
    compression: Compression,
    message: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut end = message.len().min(MAX_ERROR_MESSAGE_LEN);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    write_chunk(writer, code, compression, message[..end].as_bytes()).await
}

/// Read the result code of a response chunk
pub async fn read_result_code<R>(reader: &mut R) -> Result<ResultCode>
where
    R: AsyncRead + Unpin,
{
    let mut code = [0u8; 1];
    reader.read_exact(&mut code).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CrawlerError::Protocol("stream closed before result code".to_string())
        } else {
            CrawlerError::Io(e)
        }
    })?;
    Ok(ResultCode::from_byte(code[0]))
}

/// Read an error message payload
pub async fn read_error_message<R>(reader: &mut R, compression: Compression) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_payload(reader, compression).await?;
    let end = bytes.len().min(MAX_ERROR_MESSAGE_LEN);
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}
