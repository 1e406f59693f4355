//! Blocking primitive reads with timeout/EOF classification.

use std::io::{self, ErrorKind, Read};

use thiserror::Error;

use crate::protocol::{MessageType, MAX_PAYLOAD_LEN};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("timed out waiting for the simulator")]
    Timeout,
    #[error("connection lost: {0}")]
    ConnectionLost(io::Error),
    #[error("io error: {0}")]
    Io(io::Error),
    #[error("unknown message tag: {0}")]
    UnknownTag(i32),
    #[error("unexpected message: {0:?}")]
    Unexpected(MessageType),
    #[error("stream truncated mid-message: got {got} of {want} bytes")]
    Truncated { got: usize, want: usize },
    #[error("negative length prefix: {0}")]
    NegativeLength(i32),
    #[error("payload too large: {len} > {max}")]
    TooLarge { len: u64, max: u32 },
    #[error("invalid boolean byte: {0}")]
    BadBool(u8),
    #[error("command text is not valid utf-8")]
    InvalidUtf8,
    #[error("frame delivered without an outstanding frame request")]
    UnrequestedFrame,
}

impl WireError {
    /// Map a write-side io error.
    pub fn from_write(e: io::Error) -> Self {
        if is_timeout(&e) {
            WireError::Timeout
        } else {
            classify_io(e)
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn classify_io(e: io::Error) -> WireError {
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => WireError::ConnectionLost(e),
        _ => WireError::Io(e),
    }
}

pub fn check_len(len: i32) -> Result<usize, WireError> {
    if len < 0 {
        return Err(WireError::NegativeLength(len));
    }
    if len as u32 > MAX_PAYLOAD_LEN {
        return Err(WireError::TooLarge {
            len: len as u64,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(len as usize)
}

/// Reads one message from a stream.
///
/// A timeout before any byte of the message arrived is a plain `Timeout`
/// (nothing was consumed, the session is still in sync). Once part of the
/// message has been read, a timeout becomes `Truncated`.
pub struct MessageReader<'a, R: Read> {
    r: &'a mut R,
    consumed: usize,
}

impl<'a, R: Read> MessageReader<'a, R> {
    pub fn new(r: &'a mut R) -> Self {
        Self { r, consumed: 0 }
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        let mut off = 0usize;
        while off < buf.len() {
            match self.r.read(&mut buf[off..]) {
                Ok(0) => {
                    return Err(WireError::ConnectionLost(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "simulator closed the connection",
                    )))
                }
                Ok(n) => {
                    off += n;
                    self.consumed += n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) => {
                    return Err(if self.consumed == 0 {
                        WireError::Timeout
                    } else {
                        WireError::Truncated {
                            got: off,
                            want: buf.len(),
                        }
                    });
                }
                Err(e) => return Err(classify_io(e)),
            }
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(WireError::BadBool(b)),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(f32::from_le_bytes(b))
    }

    /// Tag, rejecting values outside the closed enumeration.
    pub fn read_tag(&mut self) -> Result<MessageType, WireError> {
        let t = self.read_i32()?;
        MessageType::from_i32(t).ok_or(WireError::UnknownTag(t))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, WireError> {
        let mut out = vec![0u8; len];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// `i32` length prefix, then exactly that many bytes.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, WireError> {
        let len = check_len(self.read_i32()?)?;
        self.read_bytes(len)
    }
}
