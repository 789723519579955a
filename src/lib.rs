pub mod consts;
pub mod docs;
pub mod errors;
pub mod evolution;
pub mod handlers;
pub mod portfolio;
pub mod returns;
pub mod web_app;

pub use errors::PortfolioError;
pub use evolution::implied_returns::{
    CalibrationConfig, CalibrationError, CalibrationRecord, ImpliedReturnsCalibrator,
    SelectionCriterion,
};
pub use evolution::objective::{FitnessEvaluator, Objective};
pub use evolution::portfolio_evolution::{
    generate_population, AssetView, EvolutionError, EvolutionResult, GeneticConfig,
    GeneticPortfolio, MutationSource, OptimizerState,
};
pub use portfolio::Chromosome;
pub use returns::{estimate_covariance, DateWindow, ReturnMatrix, ReturnRow};
