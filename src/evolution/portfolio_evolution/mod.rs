use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use utoipa::ToSchema;

use crate::consts::{
    DEFAULT_ANNUALIZATION_FACTOR, DEFAULT_CR, DEFAULT_F, DEFAULT_N_ITERATIONS,
    DEFAULT_POPULATION_SIZE,
};
use crate::errors::PortfolioError;
use crate::portfolio::Chromosome;

pub mod differential;
pub mod operators;

pub use differential::{GeneticPortfolio, OptimizerState};

#[derive(Error, Debug)]
pub enum EvolutionError {
    #[error("Invalid population parameters were passed: {0}")]
    BadPopulationParameter(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Optimizer construction failed: {0}")]
    Construction(#[source] PortfolioError),
    #[error("Seeding the initial population failed: {0}")]
    Seeding(#[source] PortfolioError),
    #[error("Generation {generation} failed: {source}")]
    Generation {
        generation: usize,
        #[source]
        source: PortfolioError,
    },
    #[error("Run cancelled after {completed_generations} completed generations")]
    Cancelled { completed_generations: usize },
    #[error("Optimizer has not been seeded yet")]
    NotSeeded,
    #[error("Optimizer has already converged")]
    AlreadyConverged,
    #[error("Optimizer has not converged yet")]
    NotConverged,
    #[error("Optimizer run already failed or was cancelled and cannot be resumed")]
    Failed,
    #[error("Failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

fn default_max_concurrency() -> usize {
    num_cpus::get()
}
fn default_population_size() -> usize {
    DEFAULT_POPULATION_SIZE
}
fn default_f() -> f64 {
    DEFAULT_F
}
fn default_cr() -> f64 {
    DEFAULT_CR
}
fn default_n_iterations() -> usize {
    DEFAULT_N_ITERATIONS
}
fn default_annualization_factor() -> usize {
    DEFAULT_ANNUALIZATION_FACTOR
}

/// Where mutation takes the replacement gene from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ToSchema)]
pub enum MutationSource {
    /// Every mutated gene takes the value of the best chromosome's *first* gene.
    /// This is the historical behaviour and the one existing fixtures depend on.
    #[default]
    FirstGene,
    /// Gene `i` takes the value of the best chromosome's gene `i`.
    Positional,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct GeneticConfig {
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Differential scale factor applied to `member_a - member_b`.
    #[serde(default = "default_f")]
    pub f: f64,
    /// Per-gene mutation probability.
    #[serde(default = "default_cr")]
    pub cr: f64,
    #[serde(default = "default_n_iterations")]
    pub n_iterations: usize,
    /// Periods per year used to annualize the covariance matrix.
    #[serde(default = "default_annualization_factor")]
    pub annualization_factor: usize,
    /// Seed of the random source. Drawn from the OS (and reported back) when absent.
    #[serde(default)]
    pub global_seed: Option<u64>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub mutation_source: MutationSource,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        GeneticConfig {
            population_size: DEFAULT_POPULATION_SIZE,
            f: DEFAULT_F,
            cr: DEFAULT_CR,
            n_iterations: DEFAULT_N_ITERATIONS,
            annualization_factor: DEFAULT_ANNUALIZATION_FACTOR,
            global_seed: None,
            max_concurrency: default_max_concurrency(),
            mutation_source: MutationSource::default(),
        }
    }
}

impl GeneticConfig {
    pub fn validate(&self) -> Result<(), EvolutionError> {
        if self.population_size == 0 {
            return Err(EvolutionError::BadPopulationParameter(
                "Population size cannot be zero".into(),
            ));
        }
        if !(self.f.is_finite() && self.f >= 0.) {
            return Err(EvolutionError::InvalidConfig(format!(
                "F must be a finite non-negative number, got {}",
                self.f
            )));
        }
        if !(0.0..=1.0).contains(&self.cr) {
            return Err(EvolutionError::InvalidConfig(format!(
                "CR must lie in [0, 1], got {}",
                self.cr
            )));
        }
        if self.n_iterations == 0 {
            return Err(EvolutionError::InvalidConfig(
                "Number of iterations cannot be zero".into(),
            ));
        }
        if self.annualization_factor == 0 {
            return Err(EvolutionError::InvalidConfig(
                "Annualization factor cannot be zero".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EvolutionError::InvalidConfig(
                "Max concurrency cannot be zero".into(),
            ));
        }
        Ok(())
    }
}

/// An externally supplied expected return for one asset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct AssetView {
    pub asset: String,
    pub expected_return: f64,
}

impl AssetView {
    pub fn new(asset: impl Into<String>, expected_return: f64) -> Self {
        AssetView {
            asset: asset.into(),
            expected_return,
        }
    }
}

/// Produces `population_size` independent random chromosomes of `genes` genes each.
pub fn generate_population<R: Rng + ?Sized>(
    population_size: usize,
    genes: usize,
    rng: &mut R,
) -> Result<Vec<Chromosome>, PortfolioError> {
    (0..population_size)
        .map(|_| Chromosome::random(genes, rng))
        .collect()
}

/// Rejects an empty universe and repeated asset identifiers.
pub(crate) fn check_universe(assets: &[String]) -> Result<(), PortfolioError> {
    if assets.is_empty() {
        return Err(PortfolioError::EmptyUniverse);
    }
    let mut seen = HashSet::with_capacity(assets.len());
    for asset in assets {
        if !seen.insert(asset.as_str()) {
            return Err(PortfolioError::DuplicateAsset(asset.clone()));
        }
    }
    Ok(())
}

pub(crate) fn check_finite_views(expected_returns: &[f64]) -> Result<(), PortfolioError> {
    if expected_returns.iter().any(|view| !view.is_finite()) {
        return Err(PortfolioError::NonFiniteInput {
            what: "expected return vector",
        });
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct EvolutionResult {
    /// Final weight per asset.
    pub best_portfolio: BTreeMap<String, f64>,
    /// Final weights in asset universe order.
    pub best_weights: Vec<f64>,
    pub best_fitness: f64,
    pub best_expected_return: f64,
    pub best_volatility: f64,
    /// Best fitness after seeding, then after every generation.
    pub fitness_trace: Vec<f64>,
    /// Mean fitness of the retained slot contributions, aligned with `fitness_trace`.
    pub average_fitness_per_generation: Vec<f64>,
    pub covariance_rows: usize,
    pub covariance_cols: usize,
    /// Seed the run was started with, when the optimizer owns its random source.
    pub seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_default_config_values() {
        let config = GeneticConfig::default();
        assert_eq!(config.population_size, 1000);
        assert_eq!(config.f, 2.);
        assert_eq!(config.cr, 0.2);
        assert_eq!(config.n_iterations, 1000);
        assert_eq!(config.annualization_factor, 60);
        assert_eq!(config.mutation_source, MutationSource::FirstGene);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: GeneticConfig =
            serde_json::from_str(r#"{"population_size": 10, "global_seed": 3}"#).unwrap();
        assert_eq!(config.population_size, 10);
        assert_eq!(config.global_seed, Some(3));
        assert_eq!(config.n_iterations, DEFAULT_N_ITERATIONS);
        assert!(config.max_concurrency >= 1);
    }

    #[test]
    fn test_config_validation() {
        let base = GeneticConfig::default();
        let cases = [
            GeneticConfig {
                population_size: 0,
                ..base.clone()
            },
            GeneticConfig {
                f: -1.,
                ..base.clone()
            },
            GeneticConfig {
                f: f64::NAN,
                ..base.clone()
            },
            GeneticConfig {
                cr: 1.5,
                ..base.clone()
            },
            GeneticConfig {
                n_iterations: 0,
                ..base.clone()
            },
            GeneticConfig {
                annualization_factor: 0,
                ..base.clone()
            },
            GeneticConfig {
                max_concurrency: 0,
                ..base.clone()
            },
        ];
        for config in cases.iter() {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
        assert!(matches!(
            cases[0].validate(),
            Err(EvolutionError::BadPopulationParameter(_))
        ));
    }

    #[test]
    fn test_generate_population_shape_and_feasibility() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let population = generate_population(25, 4, &mut rng).unwrap();
        assert_eq!(population.len(), 25);
        for chromosome in population.iter() {
            assert_eq!(chromosome.genes(), 4);
            assert!(chromosome.is_feasible());
        }
        assert_ne!(population[0], population[1], "members are independent draws");
    }
}
