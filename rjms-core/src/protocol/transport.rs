//! Length-prefixed Unix-domain-socket transport (§4.5, §6, §10).
//!
//! 32-bit little-endian byte length followed by a UTF-8 payload, one send then one
//! matching receive per round-trip. No crate in the retrieval pack depends on
//! `tokio-util`'s length-delimited codec, so this is hand-rolled directly on
//! `tokio::io::{AsyncReadExt, AsyncWriteExt}`, grounded on `send_message` in
//! `original_source/src/protocol.cpp` (one blocking write, one blocking read).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::SimError;

/// Reads one length-prefixed frame from `stream`.
pub async fn read_frame(stream: &mut UnixStream) -> Result<String, SimError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| SimError::protocol(format!("failed to read frame length: {e}")))?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| SimError::protocol(format!("failed to read frame payload: {e}")))?;

    String::from_utf8(payload).map_err(|e| SimError::protocol(format!("frame payload not utf-8: {e}")))
}

/// Writes one length-prefixed frame to `stream`.
pub async fn write_frame(stream: &mut UnixStream, payload: &str) -> Result<(), SimError> {
    let len = payload.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| SimError::protocol(format!("failed to write frame length: {e}")))?;
    stream
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| SimError::protocol(format!("failed to write frame payload: {e}")))?;
    Ok(())
}

/// Performs exactly one request/reply round-trip: writes `request`, then reads and
/// returns one reply frame. Socket discipline (§5 "exactly one request/reply in
/// flight at a time") is enforced by the caller via `ready_flag`, not here.
pub async fn request_reply(stream: &mut UnixStream, request: &str) -> Result<String, SimError> {
    write_frame(stream, request).await?;
    read_frame(stream).await
}
