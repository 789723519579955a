use thiserror::Error;

/// Failures of the numeric core. None of these are recoverable for the run
/// in progress, they abort the optimization and reach the caller as is.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
    #[error("Covariance needs at least 2 return rows in the window, got {rows}")]
    InsufficientData { rows: usize },
    #[error("Cannot project a vector whose absolute components sum to `{sum}` onto the simplex")]
    DegenerateVector { sum: f64 },
    #[error("Quadratic form wᵗΣw is negative (`{variance}`), the covariance matrix is invalid")]
    NegativeVariance { variance: f64 },
    #[error("Portfolio volatility is zero, fitness is undefined")]
    ZeroVolatility,
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Asset `{0}` appears more than once in the universe")]
    DuplicateAsset(String),
    #[error("Asset `{0}` has no column in the return matrix")]
    UnknownAsset(String),
    #[error("The asset universe is empty")]
    EmptyUniverse,
    #[error("The {what} contains non-finite values")]
    NonFiniteInput { what: &'static str },
}
