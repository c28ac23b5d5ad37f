//! Boundary channel framing.
//!
//! Each message is a UTF-8 JSON object preceded by its byte length as a
//! 4-byte unsigned integer in native byte order:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (ne)  | len bytes of JSON         |
//! +----------------+---------------------------+
//! ```
//!
//! A clean end of stream on the length prefix means the controller went away
//! and is a normal shutdown.

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;
use crate::profile::{BackendKind, ConnectionProfile};

/// Largest frame accepted in either direction (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors that make the channel unusable.
#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),
    /// Stream ended inside a frame.
    Truncated,
    FrameTooLarge(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "I/O error: {e}"),
            ProtocolError::Truncated => write!(f, "Stream ended mid-frame"),
            ProtocolError::FrameTooLarge(n) => {
                write!(f, "Frame of {n} bytes exceeds limit of {MAX_FRAME_LEN}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    }
}

/// Read one frame. `Ok(None)` on clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_ne_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Serialize `message` and write it as one frame, flushing afterwards.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Value,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(message).map_err(|e| {
        ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    #[allow(clippy::cast_possible_truncation)]
    let prefix = (body.len() as u32).to_ne_bytes();
    writer.write_all(&prefix).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// One controller request.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default, rename = "pingHost")]
    pub ping_host: Option<String>,
    #[serde(default, rename = "webCheckUrl")]
    pub web_check_url: Option<String>,
    /// `getLogs` / `clearLogs` target.
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub conn_type: Option<String>,
}

impl Request {
    pub fn decode(frame: &[u8]) -> Result<Self, TunnelError> {
        serde_json::from_slice(frame)
            .map_err(|e| TunnelError::Configuration(format!("Invalid request: {e}")))
    }

    /// Decode `config` into a profile.
    pub fn profile(&self) -> Result<ConnectionProfile, TunnelError> {
        let Some(config) = self.config.clone() else {
            return Err(TunnelError::Configuration(
                "Request has no connection config".into(),
            ));
        };
        serde_json::from_value(config)
            .map_err(|e| TunnelError::Configuration(format!("Invalid connection config: {e}")))
    }

    /// Log target from `identifier` + `conn_type`, falling back to `config`.
    pub fn log_target(&self) -> Result<Option<(BackendKind, String)>, TunnelError> {
        if let (Some(id), Some(kind)) = (self.identifier.as_deref(), self.conn_type.as_deref()) {
            return Ok(Some((kind.parse()?, id.to_string())));
        }
        if self.config.is_some() {
            let profile = self.profile()?;
            return Ok(Some((profile.kind(), profile.identifier)));
        }
        Ok(None)
    }
}
