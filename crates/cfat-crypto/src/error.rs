use cfat_core::CfatError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Authentication tag mismatch: the chunk was tampered with, truncated,
    /// or sealed under another key/IV.
    #[error("corrupt ciphertext in chunk {chunk}")]
    Corrupt { chunk: u64 },

    /// Length or hash was requested before `close()`.
    #[error("stream not closed")]
    NotClosed,

    /// Write after `close()`.
    #[error("stream already closed")]
    Closed,

    #[error("seek to {offset} outside [0, {len}]")]
    InvalidSeek { offset: i128, len: u64 },

    #[error("sealing chunk {chunk} failed")]
    Seal { chunk: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Recover a codec error that travelled through an `io::Error`, e.g. when
    /// a [`StreamReader`](crate::StreamReader) was driven by `serde_json`.
    pub fn from_io(err: std::io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<CodecError>()) {
            return CodecError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<CodecError>()) {
            Some(Ok(codec)) => *codec,
            _ => CodecError::Io(std::io::Error::other("codec error payload lost")),
        }
    }
}

impl From<CodecError> for std::io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => io,
            CodecError::InvalidSeek { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<CodecError> for CfatError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Corrupt { .. } => CfatError::CorruptData(err.to_string()),
            CodecError::Io(io) => CfatError::Backend(io),
            CodecError::InvalidSeek { offset, len } => CfatError::illegal(
                "seek",
                offset,
                format!("offset outside [0, {len}]"),
            ),
            other => CfatError::illegal("stream", "codec", other.to_string()),
        }
    }
}
