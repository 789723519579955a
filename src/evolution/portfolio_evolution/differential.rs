use nalgebra::{DMatrix, DVector};
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::operators::{mutate, recombine};
use super::{
    check_finite_views, check_universe, generate_population, AssetView, EvolutionError,
    EvolutionResult, GeneticConfig,
};
use crate::errors::PortfolioError;
use crate::evolution::objective::FitnessEvaluator;
use crate::portfolio::Chromosome;
use crate::returns::{estimate_covariance, DateWindow, ReturnMatrix};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub enum OptimizerState {
    Uninitialized,
    Seeded,
    Converged,
    /// A seeding or generation error, or a cancellation, ended the run. Terminal.
    Failed,
}

/// What one population slot contributes to the generation's reduction.
struct SlotOutcome {
    chromosome: Chromosome,
    fitness: f64,
}

/// Differential-evolution style search for the allocation maximizing expected return
/// over volatility.
///
/// Each generation draws a fresh random population; every member is recombined and
/// mutated towards the best candidate known at the start of the generation, and the
/// fitter of member and candidate is compared against the global best. Slots are
/// evaluated in parallel, the best/trace update is a sequential fold in slot order, so
/// a given seed yields the same run for any `max_concurrency`.
pub struct GeneticPortfolio<R: RngCore = ChaCha8Rng> {
    assets: Vec<String>,
    evaluator: FitnessEvaluator,
    config: GeneticConfig,
    rng: R,
    seed: Option<u64>,
    pool: rayon::ThreadPool,
    state: OptimizerState,
    best: Option<Chromosome>,
    best_fitness: f64,
    fitness_trace: Vec<f64>,
    average_fitness_per_generation: Vec<f64>,
}

impl GeneticPortfolio<ChaCha8Rng> {
    /// Builds the optimizer from the views and the returns inside `window`, seeding a
    /// `ChaCha8Rng` from `config.global_seed` (or OS entropy when absent).
    pub fn new(
        views: &[AssetView],
        returns: &ReturnMatrix,
        window: &DateWindow,
        config: GeneticConfig,
    ) -> Result<Self, EvolutionError> {
        let seed = config.global_seed.unwrap_or_else(|| OsRng.next_u64());
        let mut optimizer =
            Self::with_rng(views, returns, window, config, ChaCha8Rng::seed_from_u64(seed))?;
        optimizer.seed = Some(seed);
        Ok(optimizer)
    }
}

impl<R: RngCore> GeneticPortfolio<R> {
    pub fn with_rng(
        views: &[AssetView],
        returns: &ReturnMatrix,
        window: &DateWindow,
        config: GeneticConfig,
        rng: R,
    ) -> Result<Self, EvolutionError> {
        config.validate()?;
        let assets = views
            .iter()
            .map(|view| view.asset.clone())
            .collect::<Vec<String>>();
        let expected_returns = views
            .iter()
            .map(|view| view.expected_return)
            .collect::<Vec<f64>>();
        check_universe(&assets).map_err(EvolutionError::Construction)?;

        let windowed = returns
            .windowed(&assets, window)
            .map_err(EvolutionError::Construction)?;
        let covariance = estimate_covariance(&windowed, config.annualization_factor)
            .map_err(EvolutionError::Construction)?;

        Self::from_covariance(assets, covariance, expected_returns, config, rng)
    }

    /// Builds the optimizer from an already annualized covariance matrix.
    pub fn from_covariance(
        assets: Vec<String>,
        covariance: DMatrix<f64>,
        expected_returns: Vec<f64>,
        config: GeneticConfig,
        rng: R,
    ) -> Result<Self, EvolutionError> {
        config.validate()?;
        check_universe(&assets).map_err(EvolutionError::Construction)?;
        if expected_returns.len() != assets.len() {
            return Err(EvolutionError::Construction(
                PortfolioError::DimensionMismatch {
                    what: "expected return vector",
                    expected: assets.len(),
                    actual: expected_returns.len(),
                },
            ));
        }
        check_finite_views(&expected_returns).map_err(EvolutionError::Construction)?;
        if covariance.iter().any(|entry| !entry.is_finite()) {
            return Err(EvolutionError::Construction(
                PortfolioError::NonFiniteInput {
                    what: "covariance matrix",
                },
            ));
        }

        let evaluator = FitnessEvaluator::new(covariance, DVector::from_vec(expected_returns))
            .map_err(EvolutionError::Construction)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency)
            .build()?;

        Ok(GeneticPortfolio {
            assets,
            evaluator,
            config,
            rng,
            seed: None,
            pool,
            state: OptimizerState::Uninitialized,
            best: None,
            best_fitness: f64::NEG_INFINITY,
            fitness_trace: Vec::new(),
            average_fitness_per_generation: Vec::new(),
        })
    }

    pub fn state(&self) -> OptimizerState {
        self.state
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn config(&self) -> &GeneticConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &FitnessEvaluator {
        &self.evaluator
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn covariance_shape(&self) -> (usize, usize) {
        self.evaluator.covariance().shape()
    }

    /// Generations completed since seeding.
    pub fn completed_generations(&self) -> usize {
        self.fitness_trace.len().saturating_sub(1)
    }

    pub fn fitness_trace(&self) -> &[f64] {
        &self.fitness_trace
    }

    pub fn average_fitness_per_generation(&self) -> &[f64] {
        &self.average_fitness_per_generation
    }

    /// Best chromosome found so far, available once seeded.
    pub fn best_chromosome(&self) -> Option<&Chromosome> {
        self.best.as_ref()
    }

    pub fn best_fitness(&self) -> Option<f64> {
        self.best.as_ref().map(|_| self.best_fitness)
    }

    pub fn best_weights(&self) -> Option<&[f64]> {
        self.best.as_ref().map(|best| best.weights())
    }

    /// Final allocation per asset. Only exposed once the run has converged.
    pub fn best_portfolio(&self) -> Result<BTreeMap<String, f64>, EvolutionError> {
        match (&self.state, &self.best) {
            (OptimizerState::Converged, Some(best)) => Ok(self
                .assets
                .iter()
                .cloned()
                .zip(best.weights().iter().copied())
                .collect()),
            (OptimizerState::Failed, _) => Err(EvolutionError::Failed),
            _ => Err(EvolutionError::NotConverged),
        }
    }

    /// Uninitialized -> Seeded: scores an initial random population and keeps its best.
    /// Any error moves the optimizer to `Failed`.
    pub fn seed_population(&mut self) -> Result<(), EvolutionError> {
        match self.state {
            OptimizerState::Uninitialized => {}
            OptimizerState::Seeded => return Ok(()),
            OptimizerState::Converged => return Err(EvolutionError::AlreadyConverged),
            OptimizerState::Failed => return Err(EvolutionError::Failed),
        }
        let outcome = self.score_initial_population();
        if outcome.is_err() {
            self.state = OptimizerState::Failed;
        }
        outcome
    }

    fn score_initial_population(&mut self) -> Result<(), EvolutionError> {
        let population = generate_population(
            self.config.population_size,
            self.evaluator.genes(),
            &mut self.rng,
        )
        .map_err(EvolutionError::Seeding)?;

        let evaluator = &self.evaluator;
        let fitnesses = self
            .pool
            .install(|| {
                population
                    .par_iter()
                    .map(|chromosome| evaluator.fitness(chromosome.weights()))
                    .collect::<Result<Vec<f64>, PortfolioError>>()
            })
            .map_err(EvolutionError::Seeding)?;

        let mut best_index = 0;
        for (index, fitness) in fitnesses.iter().enumerate().skip(1) {
            if *fitness > fitnesses[best_index] {
                best_index = index;
            }
        }

        self.best_fitness = fitnesses[best_index];
        self.best = Some(population[best_index].clone());
        self.fitness_trace.push(self.best_fitness);
        self.average_fitness_per_generation
            .push(fitnesses.iter().mean());
        self.state = OptimizerState::Seeded;

        info!(
            "Seeded {} chromosomes over {} assets, best fitness {:.6}",
            population.len(),
            self.assets.len(),
            self.best_fitness
        );
        Ok(())
    }

    /// Seeded -> Seeded (or Converged after the last generation): runs one generation.
    /// Any error moves the optimizer to `Failed`.
    pub fn step(&mut self) -> Result<(), EvolutionError> {
        match self.state {
            OptimizerState::Uninitialized => return Err(EvolutionError::NotSeeded),
            OptimizerState::Seeded => {}
            OptimizerState::Converged => return Err(EvolutionError::AlreadyConverged),
            OptimizerState::Failed => return Err(EvolutionError::Failed),
        }
        let outcome = self.run_generation();
        if outcome.is_err() {
            self.state = OptimizerState::Failed;
        }
        outcome
    }

    fn run_generation(&mut self) -> Result<(), EvolutionError> {
        let generation = self.completed_generations() + 1;
        let best = self.best.clone().ok_or(EvolutionError::NotSeeded)?;

        // every random draw of the master source happens here, in a fixed order
        let population = generate_population(
            self.config.population_size,
            self.evaluator.genes(),
            &mut self.rng,
        )
        .map_err(|source| EvolutionError::Generation { generation, source })?;
        let slot_seeds = (0..population.len())
            .map(|_| self.rng.next_u64())
            .collect::<Vec<u64>>();

        let evaluator = &self.evaluator;
        let config = &self.config;
        let outcomes = self
            .pool
            .install(|| {
                population
                    .par_iter()
                    .zip(slot_seeds.par_iter())
                    .map(|(member, seed)| {
                        evolve_slot(member, &population, &best, evaluator, config, *seed)
                    })
                    .collect::<Result<Vec<SlotOutcome>, PortfolioError>>()
            })
            .map_err(|source| EvolutionError::Generation { generation, source })?;

        let average_fitness = outcomes.iter().map(|outcome| outcome.fitness).mean();
        for outcome in outcomes {
            if outcome.fitness > self.best_fitness {
                self.best_fitness = outcome.fitness;
                self.best = Some(outcome.chromosome);
            }
        }
        self.fitness_trace.push(self.best_fitness);
        self.average_fitness_per_generation.push(average_fitness);

        debug!(
            "Generation {}/{}: best fitness {:.6}, average fitness {:.6}",
            generation, self.config.n_iterations, self.best_fitness, average_fitness
        );

        if generation >= self.config.n_iterations {
            self.state = OptimizerState::Converged;
            info!(
                "Converged after {} generations, best fitness {:.6}",
                generation, self.best_fitness
            );
        }
        Ok(())
    }

    /// Runs the whole search to convergence.
    pub fn fit(&mut self) -> Result<(), EvolutionError> {
        self.fit_with_cancel(&AtomicBool::new(false))
    }

    /// Like [`fit`](Self::fit), but checks `cancel` before every generation. A cancelled
    /// run is terminal: it returns an error, exposes no portfolio and cannot be resumed.
    pub fn fit_with_cancel(&mut self, cancel: &AtomicBool) -> Result<(), EvolutionError> {
        match self.state {
            OptimizerState::Converged => return Err(EvolutionError::AlreadyConverged),
            OptimizerState::Failed => return Err(EvolutionError::Failed),
            OptimizerState::Uninitialized | OptimizerState::Seeded => {}
        }
        info!(
            "Starting run: population {}, F {}, CR {}, {} generations, seed {:?}",
            self.config.population_size,
            self.config.f,
            self.config.cr,
            self.config.n_iterations,
            self.seed
        );
        self.seed_population()?;

        while self.state == OptimizerState::Seeded {
            if cancel.load(Ordering::Relaxed) {
                let completed_generations = self.completed_generations();
                warn!("Run cancelled after {} generations", completed_generations);
                self.state = OptimizerState::Failed;
                return Err(EvolutionError::Cancelled {
                    completed_generations,
                });
            }
            self.step()?;
        }
        Ok(())
    }

    pub fn into_result(self) -> Result<EvolutionResult, EvolutionError> {
        let best_portfolio = self.best_portfolio()?;
        let best = self.best.ok_or(EvolutionError::NotConverged)?;
        let best_expected_return = self
            .evaluator
            .expected_return(best.weights())
            .map_err(EvolutionError::Construction)?;
        let best_volatility = self
            .evaluator
            .volatility(best.weights())
            .map_err(EvolutionError::Construction)?;
        let (covariance_rows, covariance_cols) = self.evaluator.covariance().shape();

        Ok(EvolutionResult {
            best_portfolio,
            best_weights: best.into_weights(),
            best_fitness: self.best_fitness,
            best_expected_return,
            best_volatility,
            fitness_trace: self.fitness_trace,
            average_fitness_per_generation: self.average_fitness_per_generation,
            covariance_rows,
            covariance_cols,
            seed: self.seed,
        })
    }
}

/// Recombines then mutates one member and keeps the fitter of member and candidate.
fn evolve_slot(
    member: &Chromosome,
    population: &[Chromosome],
    best: &Chromosome,
    evaluator: &FitnessEvaluator,
    config: &GeneticConfig,
    seed: u64,
) -> Result<SlotOutcome, PortfolioError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let recombined = recombine(member, population, config.f, &mut rng)?;
    let candidate = mutate(&recombined, best, config.cr, config.mutation_source, &mut rng)?;

    let fitness_not_mutated = evaluator.fitness(member.weights())?;
    let fitness_mutated = evaluator.fitness(candidate.weights())?;

    if fitness_mutated > fitness_not_mutated {
        Ok(SlotOutcome {
            chromosome: candidate,
            fitness: fitness_mutated,
        })
    } else {
        Ok(SlotOutcome {
            chromosome: member.clone(),
            fitness: fitness_not_mutated,
        })
    }
}
