//! Wire framing: `[type: u32 LE][size: u32 LE][body: size bytes]`.
//!
//! Read is blocking-until-complete (partial reads are looped); size is
//! bounded by [`MAX_BODY_SIZE`]. The channel works over any `Read + Write`
//! so it can be exercised over an in-memory cursor in tests without a
//! live socket.

use std::io::{self, Read, Write};

use crate::error::AllKorrectError;

/// Largest frame body the daemon will accept before terminating the session.
pub const MAX_BODY_SIZE: u32 = 100 * 1024 * 1024;

/// Dense wire tags, in the order pinned by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum MessageType {
    EXIT = 0,
    EXEC = 1,
    EXEC_REPLY = 2,
    PUT_BLOB = 3,
    OK = 4,
    GET_BLOB = 5,
    GET_BLOB_REPLY = 6,
    MOVE_BLOB2FILE = 7,
    MOVE_BLOB2BLOB = 8,
    MOVE_FILE2FILE = 9,
    MOVE_FILE2BLOB = 10,
    COPY_BLOB2FILE = 11,
    COPY_BLOB2BLOB = 12,
    COPY_FILE2FILE = 13,
    COPY_FILE2BLOB = 14,
    HAS_BLOB = 15,
    HAS_FILE = 16,
    HAS_BLOB_REPLY = 17,
    HAS_FILE_REPLY = 18,
}

impl TryFrom<u32> for MessageType {
    type Error = AllKorrectError;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match n {
            0 => EXIT,
            1 => EXEC,
            2 => EXEC_REPLY,
            3 => PUT_BLOB,
            4 => OK,
            5 => GET_BLOB,
            6 => GET_BLOB_REPLY,
            7 => MOVE_BLOB2FILE,
            8 => MOVE_BLOB2BLOB,
            9 => MOVE_FILE2FILE,
            10 => MOVE_FILE2BLOB,
            11 => COPY_BLOB2FILE,
            12 => COPY_BLOB2BLOB,
            13 => COPY_FILE2FILE,
            14 => COPY_FILE2BLOB,
            15 => HAS_BLOB,
            16 => HAS_FILE,
            17 => HAS_BLOB_REPLY,
            18 => HAS_FILE_REPLY,
            other => {
                return Err(AllKorrectError::ProtocolError(format!(
                    "unknown message type tag {other}"
                )));
            }
        })
    }
}

/// A decoded frame: a type tag plus its raw body.
#[derive(Debug)]
pub struct Frame {
    pub ty: MessageType,
    pub body: Vec<u8>,
}

impl Frame {
    /// Construct an empty-body frame (`OK`, `EXIT`).
    pub fn empty(ty: MessageType) -> Self {
        Frame {
            ty,
            body: Vec::new(),
        }
    }

    /// Construct a frame with the given body.
    pub fn with_body(ty: MessageType, body: Vec<u8>) -> Self {
        Frame { ty, body }
    }
}

fn read_exact_or_fault(r: &mut impl Read, buf: &mut [u8]) -> Result<(), AllKorrectError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            AllKorrectError::TransportFault("peer closed before frame completed".into())
        }
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            AllKorrectError::TransportFault("socket read timed out".into())
        }
        _ => AllKorrectError::TransportFault(format!("recv failed: {e}")),
    })
}

/// Read one complete frame from `r`, looping over partial reads.
pub fn read_frame(r: &mut impl Read) -> Result<Frame, AllKorrectError> {
    let mut header = [0u8; 8];
    read_exact_or_fault(r, &mut header)?;
    let ty_tag = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let size = u32::from_le_bytes(header[4..8].try_into().unwrap());

    if size > MAX_BODY_SIZE {
        return Err(AllKorrectError::ProtocolError(format!(
            "frame body of {size} bytes exceeds the {MAX_BODY_SIZE} byte limit"
        )));
    }

    let ty = MessageType::try_from(ty_tag)?;
    let mut body = vec![0u8; size as usize];
    if size > 0 {
        read_exact_or_fault(r, &mut body)?;
    }
    Ok(Frame { ty, body })
}

/// Write one complete frame to `w`.
pub fn write_frame(w: &mut impl Write, frame: &Frame) -> Result<(), AllKorrectError> {
    let mut header = [0u8; 8];
    header[0..4].copy_from_slice(&(frame.ty as u32).to_le_bytes());
    header[4..8].copy_from_slice(&(frame.body.len() as u32).to_le_bytes());

    w.write_all(&header)
        .and_then(|_| w.write_all(&frame.body))
        .map_err(|e| AllKorrectError::TransportFault(format!("send failed: {e}")))
}
