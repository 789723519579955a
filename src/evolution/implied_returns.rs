//! Consistency check between views and portfolio risk.
//!
//! For a portfolio on the efficient frontier, each asset's expected return is proportional
//! to its marginal contribution to volatility. Anchoring on the asset whose view is held
//! with the most confidence fixes the proportionality constant, which then implies a
//! return for every other asset. Sampling random portfolios and comparing the implied
//! returns with the views gives a cheap way to find allocations the views agree with.
use nalgebra::DVector;
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::consts::{DEFAULT_CALIBRATION_ANNUALIZATION_FACTOR, DEFAULT_DERIVATIVE_STEP};
use crate::errors::PortfolioError;
use crate::evolution::objective::{FitnessEvaluator, Objective};
use crate::evolution::portfolio_evolution::{check_finite_views, check_universe, AssetView};
use crate::portfolio::Chromosome;
use crate::returns::{estimate_covariance, DateWindow, ReturnMatrix};

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid calibration configuration: {0}")]
    InvalidConfig(String),
    #[error("Anchor asset `{0}` is not part of the views")]
    UnknownAnchor(String),
    #[error("Calibrator construction failed: {0}")]
    Construction(#[source] PortfolioError),
    #[error("Iteration {iteration} failed: {source}")]
    Numeric {
        iteration: usize,
        #[source]
        source: PortfolioError,
    },
    #[error("Volatility does not move with the anchor weight at iteration {iteration}")]
    FlatAnchor { iteration: usize },
    #[error("No calibration history, run `calibrate` first")]
    NotCalibrated,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub enum SelectionCriterion {
    /// Highest expected return over volatility.
    Sharpe,
    /// Lowest mean absolute gap between implied returns and views.
    Error,
}

fn default_epsilon() -> f64 {
    DEFAULT_DERIVATIVE_STEP
}
fn default_annualization_factor() -> usize {
    DEFAULT_CALIBRATION_ANNUALIZATION_FACTOR
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct CalibrationConfig {
    pub n_iterations: usize,
    /// Forward-difference step for the volatility derivatives.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_annualization_factor")]
    pub annualization_factor: usize,
    #[serde(default)]
    pub global_seed: Option<u64>,
}

impl CalibrationConfig {
    pub fn new(n_iterations: usize) -> Self {
        CalibrationConfig {
            n_iterations,
            epsilon: DEFAULT_DERIVATIVE_STEP,
            annualization_factor: DEFAULT_CALIBRATION_ANNUALIZATION_FACTOR,
            global_seed: None,
        }
    }

    fn validate(&self) -> Result<(), CalibrationError> {
        if self.n_iterations == 0 {
            return Err(CalibrationError::InvalidConfig(
                "Number of iterations cannot be zero".into(),
            ));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.) {
            return Err(CalibrationError::InvalidConfig(format!(
                "Derivative step must be positive, got {}",
                self.epsilon
            )));
        }
        if self.annualization_factor == 0 {
            return Err(CalibrationError::InvalidConfig(
                "Annualization factor cannot be zero".into(),
            ));
        }
        Ok(())
    }
}

/// One sampled portfolio and what it implies about returns.
#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct CalibrationRecord {
    pub weights: Vec<f64>,
    /// view(anchor) / dVol/dw(anchor)
    pub constant: f64,
    pub implied_returns: Vec<f64>,
    /// Mean absolute gap between implied returns and views over the non-anchor assets.
    pub error: f64,
    pub sharpe: f64,
}

pub struct ImpliedReturnsCalibrator<R: RngCore = ChaCha8Rng> {
    assets: Vec<String>,
    views: Vec<f64>,
    anchor: usize,
    evaluator: FitnessEvaluator,
    config: CalibrationConfig,
    rng: R,
    history: Vec<CalibrationRecord>,
}

impl ImpliedReturnsCalibrator<ChaCha8Rng> {
    pub fn new(
        views: &[AssetView],
        anchor: &str,
        returns: &ReturnMatrix,
        window: &DateWindow,
        config: CalibrationConfig,
    ) -> Result<Self, CalibrationError> {
        let seed = config.global_seed.unwrap_or_else(|| OsRng.next_u64());
        Self::with_rng(
            views,
            anchor,
            returns,
            window,
            config,
            ChaCha8Rng::seed_from_u64(seed),
        )
    }
}

impl<R: RngCore> ImpliedReturnsCalibrator<R> {
    pub fn with_rng(
        views: &[AssetView],
        anchor: &str,
        returns: &ReturnMatrix,
        window: &DateWindow,
        config: CalibrationConfig,
        rng: R,
    ) -> Result<Self, CalibrationError> {
        config.validate()?;
        let assets = views
            .iter()
            .map(|view| view.asset.clone())
            .collect::<Vec<String>>();
        check_universe(&assets).map_err(CalibrationError::Construction)?;
        let anchor = assets
            .iter()
            .position(|asset| asset == anchor)
            .ok_or_else(|| CalibrationError::UnknownAnchor(anchor.to_string()))?;
        let expected = views
            .iter()
            .map(|view| view.expected_return)
            .collect::<Vec<f64>>();
        check_finite_views(&expected).map_err(CalibrationError::Construction)?;

        let windowed = returns
            .windowed(&assets, window)
            .map_err(CalibrationError::Construction)?;
        let covariance = estimate_covariance(&windowed, config.annualization_factor)
            .map_err(CalibrationError::Construction)?;
        let evaluator = FitnessEvaluator::new(covariance, DVector::from_column_slice(&expected))
            .map_err(CalibrationError::Construction)?;

        Ok(ImpliedReturnsCalibrator {
            assets,
            views: expected,
            anchor,
            evaluator,
            config,
            rng,
            history: Vec::new(),
        })
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn history(&self) -> &[CalibrationRecord] {
        &self.history
    }

    /// Samples `n_iterations` random portfolios, appending one record per sample.
    pub fn calibrate(&mut self) -> Result<&[CalibrationRecord], CalibrationError> {
        info!(
            "Calibrating implied returns over {} samples, anchored on `{}`",
            self.config.n_iterations, self.assets[self.anchor]
        );
        for iteration in 0..self.config.n_iterations {
            let chromosome = Chromosome::random(self.assets.len(), &mut self.rng)
                .map_err(|source| CalibrationError::Numeric { iteration, source })?;
            let record = self.assess(iteration, &chromosome)?;
            debug!(
                "Sample {}: constant {:.6}, error {:.6}, sharpe {:.6}",
                iteration, record.constant, record.error, record.sharpe
            );
            self.history.push(record);
        }
        Ok(&self.history)
    }

    fn assess(
        &self,
        iteration: usize,
        chromosome: &Chromosome,
    ) -> Result<CalibrationRecord, CalibrationError> {
        let weights = chromosome.weights();
        let marginal_volatility = self
            .evaluator
            .gradient(Objective::Volatility, weights, self.config.epsilon)
            .map_err(|source| CalibrationError::Numeric { iteration, source })?;

        let anchor_derivative = marginal_volatility[self.anchor];
        if anchor_derivative == 0. || !anchor_derivative.is_finite() {
            return Err(CalibrationError::FlatAnchor { iteration });
        }
        let constant = self.views[self.anchor] / anchor_derivative;
        let implied_returns = marginal_volatility
            .iter()
            .map(|derivative| constant * derivative)
            .collect::<Vec<f64>>();

        let gaps = implied_returns
            .iter()
            .zip(self.views.iter())
            .enumerate()
            .filter(|(index, _)| *index != self.anchor)
            .map(|(_, (implied, view))| (implied - view).abs())
            .collect::<Vec<f64>>();
        let error = if gaps.is_empty() {
            0.
        } else {
            gaps.iter().sum::<f64>() / gaps.len() as f64
        };

        let sharpe = self
            .evaluator
            .fitness(weights)
            .map_err(|source| CalibrationError::Numeric { iteration, source })?;

        Ok(CalibrationRecord {
            weights: weights.to_vec(),
            constant,
            implied_returns,
            error,
            sharpe,
        })
    }

    /// The first record that is best under `criterion`.
    pub fn select(
        &self,
        criterion: SelectionCriterion,
    ) -> Result<&CalibrationRecord, CalibrationError> {
        let mut records = self.history.iter();
        let mut chosen = records.next().ok_or(CalibrationError::NotCalibrated)?;
        for record in records {
            let better = match criterion {
                SelectionCriterion::Sharpe => record.sharpe > chosen.sharpe,
                SelectionCriterion::Error => record.error < chosen.error,
            };
            if better {
                chosen = record;
            }
        }
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::returns::ReturnRow;
    use chrono::NaiveDate;

    fn fixture() -> (Vec<AssetView>, ReturnMatrix, DateWindow) {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let series = [
            [0.010, 0.002, -0.004],
            [-0.006, 0.011, 0.003],
            [0.004, -0.007, 0.009],
            [0.012, 0.001, -0.002],
            [-0.003, 0.005, 0.006],
            [0.007, -0.002, 0.001],
        ];
        let rows = series
            .iter()
            .enumerate()
            .map(|(offset, values)| ReturnRow {
                date: start + chrono::Days::new(offset as u64),
                values: values.iter().map(|v| Some(*v)).collect(),
            })
            .collect();
        let matrix =
            ReturnMatrix::new(vec!["A".into(), "B".into(), "C".into()], rows).unwrap();
        let views = vec![
            AssetView::new("A", 0.08),
            AssetView::new("B", 0.05),
            AssetView::new("C", 0.03),
        ];
        let window = DateWindow::new(start, NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
        (views, matrix, window)
    }

    fn calibrator(n_iterations: usize) -> ImpliedReturnsCalibrator {
        let (views, matrix, window) = fixture();
        let config = CalibrationConfig {
            global_seed: Some(9),
            ..CalibrationConfig::new(n_iterations)
        };
        ImpliedReturnsCalibrator::new(&views, "A", &matrix, &window, config).unwrap()
    }

    #[test]
    fn test_anchor_implied_return_matches_its_view() {
        let mut calibrator = calibrator(20);
        let history = calibrator.calibrate().unwrap();
        assert_eq!(history.len(), 20);
        for record in history.iter() {
            assert!((record.implied_returns[0] - 0.08).abs() < 1e-9);
            assert!(record.error >= 0.);
            assert!(record.sharpe.is_finite());
        }
    }

    #[test]
    fn test_select_by_criterion() {
        let mut calibrator = calibrator(30);
        assert!(matches!(
            calibrator.select(SelectionCriterion::Sharpe),
            Err(CalibrationError::NotCalibrated)
        ));
        calibrator.calibrate().unwrap();

        let best_sharpe = calibrator.select(SelectionCriterion::Sharpe).unwrap();
        assert!(calibrator
            .history()
            .iter()
            .all(|record| record.sharpe <= best_sharpe.sharpe));

        let lowest_error = calibrator.select(SelectionCriterion::Error).unwrap();
        assert!(calibrator
            .history()
            .iter()
            .all(|record| record.error >= lowest_error.error));
    }

    #[test]
    fn test_unknown_anchor_is_rejected() {
        let (views, matrix, window) = fixture();
        let result =
            ImpliedReturnsCalibrator::new(&views, "Z", &matrix, &window, CalibrationConfig::new(1));
        assert!(matches!(result, Err(CalibrationError::UnknownAnchor(_))));
    }

    #[test]
    fn test_views_are_checked_like_the_optimizer_does() {
        let (mut views, matrix, window) = fixture();
        views[1].expected_return = f64::NAN;
        let non_finite =
            ImpliedReturnsCalibrator::new(&views, "A", &matrix, &window, CalibrationConfig::new(1));
        assert!(matches!(
            non_finite,
            Err(CalibrationError::Construction(
                PortfolioError::NonFiniteInput { .. }
            ))
        ));

        let (mut views, matrix, window) = fixture();
        views[2].asset = "B".into();
        let duplicate =
            ImpliedReturnsCalibrator::new(&views, "A", &matrix, &window, CalibrationConfig::new(1));
        assert!(matches!(
            duplicate,
            Err(CalibrationError::Construction(PortfolioError::DuplicateAsset(_)))
        ));

        let empty =
            ImpliedReturnsCalibrator::new(&[], "A", &matrix, &window, CalibrationConfig::new(1));
        assert!(matches!(
            empty,
            Err(CalibrationError::Construction(PortfolioError::EmptyUniverse))
        ));
    }
}
