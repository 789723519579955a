/// Tolerance used when checking the simplex invariant and matrix symmetry.
pub const FLOAT_COMPARISON_EPSILON: f64 = 1e-9;

// Defaults for `GeneticConfig`
pub const DEFAULT_POPULATION_SIZE: usize = 1000;
pub const DEFAULT_F: f64 = 2.0;
pub const DEFAULT_CR: f64 = 0.2;
pub const DEFAULT_N_ITERATIONS: usize = 1000;
pub const DEFAULT_ANNUALIZATION_FACTOR: usize = 60;

// Implied returns calibration
pub const DEFAULT_CALIBRATION_ANNUALIZATION_FACTOR: usize = 252;
pub const DEFAULT_DERIVATIVE_STEP: f64 = 1e-6;
