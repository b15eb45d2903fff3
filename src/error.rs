//! Error taxonomy for the forecasting core.
//!
//! Each component owns one error type. Most of them are recoverable at the
//! pipeline level and end up as a missing-data note on the answer rather
//! than a failed request:
//!
//! | Error | Raised by | Recovery |
//! |-------|-----------|----------|
//! | [`AcquisitionError`] | [`crate::acquire`] | answer without document-grounded content |
//! | [`ExtractionError`] | [`crate::extract`] | skip the document |
//! | [`IndexError::EmptyIndex`] | [`crate::index`] | answer states no indexed context is available |
//! | [`SchemaError`] | [`crate::synth`] | bounded retry, then the deterministic fallback |
//! | [`QuoteUnavailable`] | [`crate::market`] | market field marked unavailable |
//! | [`ServiceError`] | [`crate::pipeline`] | surfaced to the caller (invalid requests only) |

use thiserror::Error;

/// No usable documents could be obtained from a source page.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("invalid source url '{0}'")]
    InvalidUrl(String),

    #[error("source page {url} unreachable: {reason}")]
    SourceUnreachable { url: String, reason: String },

    #[error("no document links found on {url}")]
    NoDocumentLinks { url: String },

    #[error("all {attempted} candidate documents from {url} were stale or failed to download")]
    NothingAcquired { url: String, attempted: usize },

    #[error("working directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a document could not be turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionErrorKind {
    /// Every strategy failed or produced near-empty text.
    Unreadable,
    /// The document's bytes were already released or never loaded.
    MissingContent,
}

#[derive(Debug, Error)]
#[error("cannot extract text from {document} ({kind:?}): {}", .attempts.join("; "))]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub document: String,
    /// One entry per strategy attempted, `"<strategy>: <reason>"`.
    pub attempts: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk size must be > 0")]
    ZeroSize,
    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no indexed context available: the index is empty")]
    EmptyIndex,

    #[error("embedding dimensionality mismatch: index holds {stored}, active model produces {active}")]
    DimensionMismatch { stored: usize, active: usize },

    #[error("index was built with the '{stored}' embedding provider, active provider is '{active}'; run `fcast reset` to rebuild")]
    ProviderMismatch { stored: String, active: String },

    #[error("unsupported index format version {found} (expected {expected}); run `fcast reset` to rebuild")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("embedder returned {returned} vectors for {expected} chunks")]
    CountMismatch { expected: usize, returned: usize },

    #[error("embedding failed: {0}")]
    Embedding(anyhow::Error),

    #[error("index storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt index metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Model output did not conform to the answer schema after every retry.
#[derive(Debug, Clone, Error)]
#[error("answer failed schema validation after {attempts} attempt(s): {}", .violations.join("; "))]
pub struct SchemaError {
    pub violations: Vec<String>,
    pub attempts: u32,
}

/// Failure of a synthesis step: either the model could not be reached or
/// its output never validated.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("language model call failed: {0}")]
    Model(anyhow::Error),
}

/// The market-quote collaborator could not provide a price.
#[derive(Debug, Clone, Error)]
#[error("quote unavailable for {symbol}: {reason}")]
pub struct QuoteUnavailable {
    pub symbol: String,
    pub reason: String,
}

/// Failures surfaced to the caller of the pipeline. Everything past
/// request validation ends in a (possibly partial) answer instead.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
