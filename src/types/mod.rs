//! Core domain types shared across the worker.
//!
//! These newtypes keep the different identifier spaces apart (a parent-chosen
//! session id is not a serial, a serial is not a digest) and validate their
//! wire representations at the boundary.

use std::fmt;

use thiserror::Error;

/// Identifier the parent process assigns to one in-flight repository sync.
///
/// Opaque to the worker; every control message carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(n: u64) -> Self {
        SessionId(n)
    }
}

/// Error returned when parsing an invalid SHA-256 digest attribute.
#[derive(Debug, Clone, Error)]
#[error("invalid digest: expected 64 hex characters, got {len} bytes: {preview}")]
pub struct InvalidDigest {
    len: usize,
    preview: String,
}

/// A SHA-256 digest (32 bytes).
///
/// RRDP hash attributes are 64 hex digits in either case; construction is
/// only possible via [`Digest::parse`] or from a finalized hash context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Parses a 64-character hex string as a digest.
    pub fn parse(s: &str) -> Result<Self, InvalidDigest> {
        let mut bytes = [0u8; 32];
        if s.len() == 64 && hex::decode_to_slice(s, &mut bytes).is_ok() {
            Ok(Digest(bytes))
        } else {
            Err(InvalidDigest {
                len: s.len(),
                preview: s.chars().take(20).collect(),
            })
        }
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// What the parent should do with one emitted file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// Write a new object; no prior version expected.
    Add,
    /// Replace an object whose current content matches the expected digest.
    Update,
    /// Remove an object whose current content matches the expected digest.
    Withdraw,
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileAction::Add => write!(f, "add"),
            FileAction::Update => write!(f, "update"),
            FileAction::Withdraw => write!(f, "withdraw"),
        }
    }
}

/// The persisted per-repository sync state.
///
/// Created on the first successful sync and replaced atomically after every
/// successful one. A `serial` of 0 together with an empty `session_id` means
/// no prior state exists and the repository must be bootstrapped from a
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepositoryState {
    /// Upstream-chosen token identifying a continuous lineage of serials.
    pub session_id: String,

    /// Last serial this cache caught up to within the session.
    pub serial: u64,

    /// `Last-Modified` value of the notification fetch that produced this
    /// state, replayed as `If-Modified-Since` on the next sync.
    pub last_modified: Option<String>,
}

impl RepositoryState {
    /// Returns true if no prior sync has completed for this repository.
    pub fn is_empty(&self) -> bool {
        self.session_id.is_empty() || self.serial == 0
    }
}
