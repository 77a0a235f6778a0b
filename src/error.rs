//! Stable error taxonomy for the cube subsystem.
//!
//! Every variant carries a discriminant name so callers (and tests) can
//! match on `kind()` rather than parsing Display strings.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    InvalidSize,
    InvalidTlvType,
    TruncatedField,
    MalformedFraming,
    SpecialNotFirst,
    Overflow,
    UnsupportedVersion,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("codec error: {kind:?}")]
pub struct CodecError {
    pub kind: CodecErrorKind,
}

impl CodecError {
    pub fn new(kind: CodecErrorKind) -> Self {
        Self { kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityErrorKind {
    DifficultyUnmet,
    BadSignature,
    FingerprintMismatch,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("integrity error: {kind:?}")]
pub struct IntegrityError {
    pub kind: IntegrityErrorKind,
}

impl IntegrityError {
    pub fn new(kind: IntegrityErrorKind) -> Self {
        Self { kind }
    }
}

/// Errors produced while decoding or validating a block. Mirrors spec §7:
/// codec and integrity failures are distinguished so a caller can tell a
/// malformed buffer from one that is well-formed but under-mined.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl BlockError {
    pub fn codec(kind: CodecErrorKind) -> Self {
        Self::Codec(CodecError::new(kind))
    }

    pub fn integrity(kind: IntegrityErrorKind) -> Self {
        Self::Integrity(IntegrityError::new(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    UnknownMessageClass,
    CountOverflow,
    ShortFrame,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("protocol error: {kind:?}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind) -> Self {
        Self { kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    HandshakeTimeout,
    Closed,
    SendFailed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transport error: {kind:?}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind) -> Self {
        Self { kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceErrorKind {
    StoreFull,
    Duplicate,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("resource error: {kind:?}")]
pub struct ResourceError {
    pub kind: ResourceErrorKind,
}

impl ResourceError {
    pub fn new(kind: ResourceErrorKind) -> Self {
        Self { kind }
    }
}
