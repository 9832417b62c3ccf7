//! Error and result types shared by the pipeline stages.

use thiserror::Error;

/// Failure kinds produced by the simulation pipeline.
///
/// The numerical core (Cholesky, regularisation) reports problems through
/// status values; everything that reaches this enum is fatal for the stage
/// that produced it. Warnings are counted by
/// [`Diagnostics`](crate::context::Diagnostics) instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown or ill-formed configuration options.
    #[error("configuration: {0}")]
    Config(String),
    /// Missing or malformed spectra or field lists.
    #[error("input: {0}")]
    Input(String),
    /// A mathematical domain violation: non-positive gaussianisation
    /// argument, negative variance, or a correlation outside [-1, 1].
    #[error("domain: {0}")]
    Domain(String),
    /// A matrix that is not positive definite, or a regularisation that ran
    /// out of steps.
    #[error("numerical: {0}")]
    Numerical(String),
    /// Allocation or I/O failure.
    #[error("resource: {0}")]
    Resource(#[from] std::io::Error),
}

/// Shorthand for results carrying [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;
