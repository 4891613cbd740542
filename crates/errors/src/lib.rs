//! Error classification shared across the indexing core.
//!
//! Per-request errors are plain values attached to an `anyhow::Error` chain
//! via [`ErrorMetadata`] rather than a sprawling enum of concrete error
//! types — callers that need to branch on the kind of failure match on
//! [`ErrorCode`]; callers that just want to propagate use `?` like any other
//! `anyhow::Result`. Engine-fatal failures are a different animal: once an
//! engine is `Failed` there is no request left to attach metadata to, so
//! those live in [`FatalEngineError`] instead.

use std::borrow::Cow;

mod metadata_ext;

pub use metadata_ext::ErrorMetadataAnyhowExt;

/// A tag attached to an `anyhow::Error` chain classifying a per-request
/// failure. Attach with `.context(ErrorMetadata::version_conflict(...))`.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Stable, ScreamingCamelCase tag usable in tests for string matching.
    pub short_msg: Cow<'static, str>,
    /// Developer-facing, descriptive message.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Optimistic concurrency rejection (version or seqNo/term CAS mismatch).
    VersionConflict,
    /// Document failed to parse or did not match the expected shape.
    MappingOrParseError,
    /// The engine is not writable (closing, closed, or failed).
    EngineClosed,
    /// Write attempted with a term lower than the engine's current term.
    StalePrimary,
    /// Caller-supplied configuration value was out of bounds.
    InvalidConfig,
    /// Transient resource exhaustion that does not indicate corruption.
    ResourceExhausted,
}

impl ErrorMetadata {
    pub fn version_conflict(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::VersionConflict,
            short_msg: Cow::Borrowed("VersionConflict"),
            msg: msg.into(),
        }
    }

    pub fn mapping_or_parse(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::MappingOrParseError,
            short_msg: Cow::Borrowed("MappingOrParseError"),
            msg: msg.into(),
        }
    }

    pub fn engine_closed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::EngineClosed,
            short_msg: Cow::Borrowed("EngineClosed"),
            msg: msg.into(),
        }
    }

    pub fn stale_primary(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::StalePrimary,
            short_msg: Cow::Borrowed("StalePrimary"),
            msg: msg.into(),
        }
    }

    pub fn invalid_config(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::InvalidConfig,
            short_msg: Cow::Borrowed("InvalidConfig"),
            msg: msg.into(),
        }
    }

    pub fn resource_exhausted(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::ResourceExhausted,
            short_msg: Cow::Borrowed("ResourceExhausted"),
            msg: msg.into(),
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        self.code == ErrorCode::VersionConflict
    }
}

/// Engine-fatal failures. These are not per-request errors: once raised, the
/// engine transitions to `Failed` and every subsequent call returns
/// `ErrorCode::EngineClosed` with this value cached behind `lastFailure()`.
#[derive(thiserror::Error, Clone, Debug)]
pub enum FatalEngineError {
    #[error("translog corruption in generation {generation}: {detail}")]
    TranslogCorruption { generation: u64, detail: String },

    #[error("translog uuid mismatch: expected {expected}, found {found}")]
    TranslogMissing { expected: String, found: String },

    #[error("segment store commit failed: {0}")]
    CommitFailure(String),

    #[error("io error during {during}: {detail}")]
    IoError { during: &'static str, detail: String },
}
