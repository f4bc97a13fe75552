//! Error types for the filter core.
//!
//! Only recoverable conditions are represented here. Corrupted internal state
//! (mismatched vector lengths, use of a released ancestry node) panics instead.

use thiserror::Error;

/// Errors surfaced by the filter and its collaborators.
#[derive(Error, Debug)]
pub enum SlamError {
    /// Weight normalization or resampling was requested on zero particles.
    #[error("particle set is empty")]
    EmptyParticleSet,

    /// Log weights could not be turned into a probability vector (NaN, all
    /// `-inf`, or a vanishing normalizer).
    #[error("degenerate particle weights: {0}")]
    DegenerateWeights(String),

    /// The scan matcher could not produce a pose estimate or score.
    #[error("scan matcher failure: {0}")]
    Matcher(String),

    /// Registering a scan into a particle map failed.
    #[error("map update failure: {0}")]
    MapUpdate(String),

    /// Invalid filter configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A previous step failed after the ancestry tree had been modified.
    #[error("filter state is poisoned by an earlier failed step")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, SlamError>;
