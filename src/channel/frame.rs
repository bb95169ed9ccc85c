//! Message framing: 8-byte little-endian length header + JSON payload.

use std::io::{Read, Write};

use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// stream cleanly before a new header began.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader.read(&mut header[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "frame header truncated",
            )
            .into());
        }
        read += n;
    }

    let length = u64::from_le_bytes(header);
    let length = usize::try_from(length).map_err(|_| FrameError::FrameLengthInvalid {
        reason: "frame length exceeds usize".to_string(),
    })?;
    if length == 0 {
        return Err(FrameError::FrameLengthInvalid {
            reason: "frame length cannot be zero".to_string(),
        });
    }
    if length > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: length,
        });
    }

    let mut body = vec![0u8; length];
    let mut read_body = 0usize;
    while read_body < length {
        let n = reader.read(&mut body[read_body..])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "frame body truncated",
            )
            .into());
        }
        read_body += n;
    }

    Ok(Some(body))
}

pub fn write_frame<W: Write>(
    writer: &mut W,
    payload: &[u8],
    max_frame_bytes: usize,
) -> Result<(), FrameError> {
    let frame = encode_frame(payload, max_frame_bytes)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::FrameLengthInvalid {
            reason: "frame length cannot be zero".to_string(),
        });
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}
