//! Error types used throughout this crate.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Returned when two scalar fields sampled at different resolutions are
    /// correlated against each other.
    #[error("field resolutions differ: {lhs} vs {rhs}")]
    ResolutionMismatch {
        /// Resolution of the field the operation was called on.
        lhs: u32,
        /// Resolution of the other field.
        rhs: u32,
    },
    /// Returned when a bin's assigned resolution disagrees with the field it
    /// is measured on.
    #[error("bin resolution {bin} does not match field resolution {field}")]
    BinResolutionMismatch {
        /// Resolution assigned to the bin.
        bin: u32,
        /// Resolution of the field.
        field: u32,
    },
    /// Returned by region-aware operations when no regions have been
    /// initialized on the footprint or the object itself.
    #[error("no regions have been initialized")]
    NoRegions,
    /// An error that originates in this crate.
    #[error("{0}")]
    General(String),
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Type alias for `Result` with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
