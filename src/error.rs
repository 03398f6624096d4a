use thiserror::Error;

/// Error type for the sampling core.
///
/// Usage errors (wrong dimensionality, too few chains, asking for prerun
/// results before a prerun ran) are reported through this enum. Invariant
/// violations that indicate a bug rather than bad input -- e.g. the
/// R-value sanity guard in [`crate::rvalue::gelman_rubin`] -- panic instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("chain means ({means}) and chain variances ({variances}) are not aligned")]
    UnalignedChainStatistics { means: usize, variances: usize },

    #[error("need at least two chains to compute an R-value, got {0}")]
    TooFewChains(usize),

    #[error("parameter index {index} out of range for {dimension} dimensions")]
    ParameterIndexOutOfRange { index: usize, dimension: usize },

    #[error("parameter '{name}' = {value} outside its allowed range [{min}, {max}]")]
    PointOutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{0} must lie in [0, 1]")]
    InvalidFraction(&'static str),

    #[error("cannot compute statistics for an empty sequence")]
    EmptyHistory,

    #[error("prerun info requested, but no prerun has completed")]
    NoPreRun,

    #[error("non-finite log-posterior ratio ({0}); check the density for NaN values")]
    NonFiniteAcceptanceRatio(f64),

    /// Wraps the failure type of a [`Density`](crate::density::Density)
    /// implementation; the chain aborts its run and passes this through
    /// unchanged.
    #[error("density evaluation failed: {0}")]
    Density(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("sample sink failed: {0}")]
    Sink(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
