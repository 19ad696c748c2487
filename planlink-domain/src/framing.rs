//! Wire framing for [`LinkMessage`]s.
//!
//! Every message travels as one frame: a fixed-size binary preamble
//! followed by a JSON payload.
//!
//! ```text
//! +-------+-------+-------------------+-----------------------------+
//! | magic | ver   | payload_len (u32) | payload (payload_len bytes) |
//! | 0x50  | 0x01  | big-endian        | UTF-8 JSON                  |
//! +-------+-------+-------------------+-----------------------------+
//!   1 byte  1 byte      4 bytes          variable
//!                  ← fixed 6 bytes →
//! ```
//!
//! Message-delimited channels (radio packets, UDP datagrams) carry one
//! frame per packet and use [`encode_frame`] / [`decode_frame`]. Byte
//! streams use [`write_frame`] / [`read_frame`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ---

use super::error::{PlanLinkError, Result};
use super::message::LinkMessage;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic byte — 'P' for PlanLink. Lets the receiver detect misaligned reads.
pub const MAGIC: u8 = 0x50;

/// Wire format version. Bump when the fixed header layout changes.
pub const VERSION: u8 = 0x01;

/// Fixed header size in bytes: magic(1) + ver(1) + payload_len(4).
pub const FIXED_HEADER_LEN: usize = 6;

/// Upper bound on a single payload. Small-payload links never come close;
/// anything larger is a corrupt length field.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// encode_frame / decode_frame
// ---------------------------------------------------------------------------

/// Serialize `msg` into a complete frame.
pub fn encode_frame(msg: &LinkMessage) -> Result<Vec<u8>> {
    // ---
    let payload = serde_json::to_vec(msg)
        .map_err(|e| PlanLinkError::Framing(format!("serialize error: {e}")))?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(PlanLinkError::Framing(format!(
            "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(FIXED_HEADER_LEN + payload.len());
    frame.push(MAGIC);
    frame.push(VERSION);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

// ---

/// Decode one complete frame. Trailing bytes are an error.
pub fn decode_frame(frame: &[u8]) -> Result<LinkMessage> {
    // ---
    if frame.len() < FIXED_HEADER_LEN {
        return Err(PlanLinkError::Framing(format!(
            "short frame: {} bytes",
            frame.len()
        )));
    }

    let payload_len = check_header(&frame[..FIXED_HEADER_LEN])?;
    let payload = &frame[FIXED_HEADER_LEN..];

    if payload.len() != payload_len {
        return Err(PlanLinkError::Framing(format!(
            "length mismatch: header says {payload_len}, frame carries {}",
            payload.len()
        )));
    }

    serde_json::from_slice(payload)
        .map_err(|e| PlanLinkError::Framing(format!("deserialize error: {e}")))
}

// ---------------------------------------------------------------------------
// write_frame / read_frame
// ---------------------------------------------------------------------------

/// Write `msg` as one frame to a byte stream.
pub async fn write_frame<W>(stream: &mut W, msg: &LinkMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| PlanLinkError::Transport(format!("frame write: {e}")))?;
    Ok(())
}

// ---

/// Read one frame from a byte stream.
pub async fn read_frame<R>(stream: &mut R) -> Result<LinkMessage>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    stream
        .read_exact(&mut fixed)
        .await
        .map_err(|e| PlanLinkError::Transport(format!("frame read header: {e}")))?;

    let payload_len = check_header(&fixed)?;

    let mut payload = vec![0u8; payload_len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| PlanLinkError::Transport(format!("frame read payload: {e}")))?;

    serde_json::from_slice(&payload)
        .map_err(|e| PlanLinkError::Framing(format!("deserialize error: {e}")))
}

// ---

/// Validate magic and version; return the payload length.
fn check_header(fixed: &[u8]) -> Result<usize> {
    // ---
    if fixed[0] != MAGIC {
        return Err(PlanLinkError::Framing(format!(
            "bad magic: expected 0x{MAGIC:02X}, got 0x{:02X}",
            fixed[0]
        )));
    }

    if fixed[1] != VERSION {
        return Err(PlanLinkError::Framing(format!(
            "unsupported version: expected {VERSION}, got {}",
            fixed[1]
        )));
    }

    let payload_len = u32::from_be_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(PlanLinkError::Framing(format!(
            "declared payload of {payload_len} bytes exceeds {MAX_PAYLOAD_LEN}"
        )));
    }

    Ok(payload_len)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
