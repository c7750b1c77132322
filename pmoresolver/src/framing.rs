//! Trames JSON préfixées par leur longueur
//!
//! Chaque message : longueur sur 4 octets big-endian, puis autant d'octets de
//! JSON UTF-8. Une longueur `0` ou `0xFFFFFFFF`, ou la fin du flux, termine
//! la conversation.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{ResolverError, Result};

/// Taille maximale acceptée pour un message entrant
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Lit la trame suivante ; `None` signale la fin de la conversation
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len);
    if len == 0 || len == u32::MAX {
        trace!(len, "End-of-conversation frame");
        return Ok(None);
    }
    if len > MAX_FRAME_SIZE {
        return Err(ResolverError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(String::from_utf8_lossy(&payload).into_owned()))
}

pub async fn write_frame<W>(writer: &mut W, json: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(json.len()).map_err(|_| ResolverError::FrameTooLarge(u32::MAX))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Sérialise `message` et l'écrit comme une trame
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(message)?;
    trace!(%json, "Sending frame");
    write_frame(writer, &json).await
}
