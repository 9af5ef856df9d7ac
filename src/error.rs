//! Error kinds shared across the storage layer and collector.
//!
//! Hot-path writes (C3 `inc`/`set`/`observe`) never propagate these: a
//! [`CoreError`] raised there is logged and counted by the caller, then
//! dropped. Setup-time and scrape-time callers are free to propagate via
//! `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The store cannot be contacted, or the multiprocess directory isn't writable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A read yielded bytes that don't decode to a valid record.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// File-backed growth failed (disk full, remap failure, etc.).
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A configuration option failed validation on first access.
    #[error("invalid configuration for `{option}`: {message} (example: {example})")]
    ConfigurationInvalid {
        option: String,
        message: String,
        example: String,
    },

    /// `decode_sid` was given bytes that aren't a valid encoding.
    #[error("malformed storage key: {0}")]
    MalformedKey(String),

    /// A scrape exceeded its deadline before finishing iteration.
    #[error("scrape truncated after {elapsed_ms}ms")]
    ScrapeTruncated { elapsed_ms: u128 },
}
