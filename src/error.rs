//! Crate-wide error types.
//!
//! Mirrors the shape of the teacher's `mod_params::RadioError`: one flat
//! enum per concern, `Debug`-derivable. Unlike the teacher (which targets
//! `no_std` and leans on `defmt::Format` alone), this crate runs on a host
//! with `std`, so each variant also gets `thiserror::Error` for a real
//! `Display`/`std::error::Error` implementation.

use thiserror::Error;

/// Errors produced while decoding a frame from the wire. Never raised by
/// encoding: well-formed in-memory messages always encode successfully.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    #[error("frame too short: need at least {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unknown message type tag {0}")]
    UnknownType(u8),
    #[error("nick or text field is not valid UTF-8")]
    InvalidUtf8,
    #[error("encoded frame of {len} bytes exceeds the maximum frame size of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Errors from keychain-based authenticated encryption/decryption.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum KeychainError {
    #[error("no key named {0:?} in the keychain")]
    NoSuchKey(String),
    #[error("plaintext frame too short to encrypt (need at least 14 bytes, got {0})")]
    PlaintextTooShort(usize),
    #[error("ciphertext too short to be a valid encrypted frame")]
    CiphertextTooShort,
    #[error("no key in the chain could authenticate this frame")]
    NoMatchingKey,
}

/// Errors raised by [`crate::journal::Journal`].
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum JournalError {
    #[error("record of {len} bytes exceeds the fixed record size of {max}")]
    RecordTooLarge { len: usize, max: usize },
    #[error("I/O error accessing journal file: {0}")]
    Io(String),
}

/// Top-level error type threaded through engine-facing `Result`s.
#[derive(Debug, Error)]
pub enum FreakMeshError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Keychain(#[from] KeychainError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("send queue is full")]
    QueueFull,
    #[error("radio error: {0}")]
    Radio(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::Io(e.to_string())
    }
}
