//! Length-prefixed frame I/O over a byte stream.
//!
//! Every data message is exactly two frames: (0) the 16 raw bytes of the
//! sender's connection GUID, (1) the serialized payload. Each frame is
//! written as a `u32` big-endian length followed by that many bytes.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::errors::TransportError;

pub(crate) const GUID_FRAME_LEN: usize = 16;

/// Writes one length-prefixed frame.
pub fn write_frame<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<BigEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Reads one length-prefixed frame. Returns `Ok(None)` on a clean EOF at the
/// frame boundary (no bytes read yet); any other I/O error, including a
/// partial frame, propagates.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = match r.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// Writes a two-frame data message: `{connection_guid, payload}`.
pub fn write_message<W: Write>(w: &mut W, guid: Uuid, payload: &[u8]) -> io::Result<()> {
    write_frame(w, guid.as_bytes())?;
    write_frame(w, payload)?;
    w.flush()
}

/// Reads a two-frame data message. Returns `Ok(None)` if the stream is
/// cleanly closed between messages.
pub fn read_message<R: Read>(r: &mut R) -> Result<Option<(Uuid, Vec<u8>)>, TransportError> {
    let guid_frame = match read_frame(r)? {
        Some(f) => f,
        None => return Ok(None),
    };
    if guid_frame.len() != GUID_FRAME_LEN {
        return Err(TransportError::Framing(format!(
            "expected a 16-byte connection GUID frame, got {} bytes",
            guid_frame.len()
        )));
    }
    let mut guid_bytes = [0u8; GUID_FRAME_LEN];
    guid_bytes.copy_from_slice(&guid_frame);
    let guid = Uuid::from_bytes(guid_bytes);

    let payload = match read_frame(r)? {
        Some(f) => f,
        None => {
            return Err(TransportError::Framing(
                "connection closed after the GUID frame but before the payload frame".into(),
            ))
        }
    };
    Ok(Some((guid, payload)))
}

/// Outcome of scanning a byte buffer for one length-prefixed frame without
/// blocking I/O.
pub enum FrameScan {
    /// The buffer doesn't yet hold a complete frame.
    Incomplete,
    /// A complete frame was found; `consumed` bytes should be dropped from
    /// the front of the buffer.
    Complete { consumed: usize, bytes: Vec<u8> },
}

fn scan_frame(buf: &[u8]) -> FrameScan {
    if buf.len() < 4 {
        return FrameScan::Incomplete;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return FrameScan::Incomplete;
    }
    FrameScan::Complete {
        consumed: 4 + len,
        bytes: buf[4..4 + len].to_vec(),
    }
}

/// Scans a byte buffer (accumulated from one or more non-blocking reads) for
/// one complete two-frame data message. Returns `Ok(None)` if the buffer is
/// incomplete so far; the caller should keep accumulating.
pub fn try_scan_message(buf: &[u8]) -> Result<Option<(usize, Uuid, Vec<u8>)>, TransportError> {
    let (guid_consumed, guid_bytes) = match scan_frame(buf) {
        FrameScan::Incomplete => return Ok(None),
        FrameScan::Complete { consumed, bytes } => (consumed, bytes),
    };
    if guid_bytes.len() != GUID_FRAME_LEN {
        return Err(TransportError::Framing(format!(
            "expected a 16-byte connection GUID frame, got {} bytes",
            guid_bytes.len()
        )));
    }
    let (payload_consumed, payload_bytes) = match scan_frame(&buf[guid_consumed..]) {
        FrameScan::Incomplete => return Ok(None),
        FrameScan::Complete { consumed, bytes } => (consumed, bytes),
    };
    let mut guid_arr = [0u8; GUID_FRAME_LEN];
    guid_arr.copy_from_slice(&guid_bytes);
    Ok(Some((
        guid_consumed + payload_consumed,
        Uuid::from_bytes(guid_arr),
        payload_bytes,
    )))
}
