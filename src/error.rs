//! Failure taxonomy for the ISO assembly pipeline.
//!
//! Every variant is fatal and never retried: all inputs are local and
//! deterministic, so an automatic retry would reproduce the same failure.
//! The variants exist so callers and tests can distinguish invariant
//! violations (ambiguous payload, corrupt padding) from plain tool
//! failures. Errors are carried inside `anyhow::Error`; downcast with
//! `err.downcast_ref::<AssembleError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssembleError {
    /// The source commit layout was unexpected or a payload file is
    /// missing. Usually indicates a corrupt or incompatible build.
    #[error("commit payload extraction failed: {0}")]
    Extraction(String),

    /// The external compressor or archiver failed while building the
    /// live root filesystem payload.
    #[error("live payload build failed: {0}")]
    PayloadBuild(String),

    /// ISO introspection found zero or multiple candidate payload
    /// entries where exactly one is required.
    #[error("expected exactly one '{name}' in ISO, found {count}")]
    AmbiguousPayload { name: String, count: usize },

    /// The reserved configuration slot is not all-zero. Never
    /// auto-corrected; overwriting would risk shipping an ISO with a
    /// corrupted configuration slot.
    #[error("config slot at offset {offset} is not zeroed (first nonzero byte at +{at})")]
    CorruptPadding { offset: u64, at: u64 },

    /// An invoked tool exited nonzero. The tool's diagnostic output is
    /// propagated verbatim.
    #[error("{tool} failed with {status}: {stderr}")]
    ExternalTool {
        tool: String,
        status: String,
        stderr: String,
    },
}
