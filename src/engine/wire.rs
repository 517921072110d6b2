//! Wire format of the local engine.
//!
//! Each frame is a big-endian `u32` length followed by a JSON message. A
//! connection opens with `Hello`; the server answers `Welcome` only if it
//! serves the requested discovery key. File content moves in ranged reads of
//! at most [`READ_CHUNK`] bytes, so one reply always fits in a frame.

use super::content::FileEntry;
use super::traits::{EngineError, EngineResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Default size of one ranged read. Hex doubles it on the wire.
pub const READ_CHUNK: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Hello { discovery_key: String },
    Manifest,
    Read { path: String, offset: u64, len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Welcome,
    Manifest { files: Vec<FileEntry>, version: u64 },
    /// Hex-encoded slice of a file and the file's total length.
    Data { hex: String, total: u64 },
    Error { message: String },
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> EngineResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).map_err(|e| EngineError::Protocol(e.to_string()))?;
    if body.len() > MAX_FRAME {
        return Err(EngineError::Protocol(format!("frame too large: {}", body.len())));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> EngineResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(EngineError::Protocol(format!("frame too large: {}", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| EngineError::Protocol(e.to_string()))
}
