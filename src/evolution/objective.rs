use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::consts::FLOAT_COMPARISON_EPSILON;
use crate::errors::PortfolioError;

/// The quantities the evaluator can report for a weight vector.
#[derive(PartialEq, Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub enum Objective {
    ExpectedReturn,
    Volatility,
    Fitness,
}

/// Scores weight vectors against an annualized covariance matrix and a vector of views.
#[derive(Debug, Clone)]
pub struct FitnessEvaluator {
    covariance: DMatrix<f64>,
    expected_returns: DVector<f64>,
}

impl FitnessEvaluator {
    pub fn new(
        covariance: DMatrix<f64>,
        expected_returns: DVector<f64>,
    ) -> Result<Self, PortfolioError> {
        if !covariance.is_square() {
            return Err(PortfolioError::DimensionMismatch {
                what: "covariance columns",
                expected: covariance.nrows(),
                actual: covariance.ncols(),
            });
        }
        if covariance.nrows() != expected_returns.len() {
            return Err(PortfolioError::DimensionMismatch {
                what: "expected return vector",
                expected: covariance.nrows(),
                actual: expected_returns.len(),
            });
        }
        if let Some(variance) = covariance
            .diagonal()
            .iter()
            .copied()
            .find(|variance| *variance < -FLOAT_COMPARISON_EPSILON)
        {
            return Err(PortfolioError::NegativeVariance { variance });
        }

        Ok(FitnessEvaluator {
            covariance,
            expected_returns,
        })
    }

    pub fn genes(&self) -> usize {
        self.expected_returns.len()
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn expected_returns(&self) -> &DVector<f64> {
        &self.expected_returns
    }

    fn as_vector(&self, weights: &[f64]) -> Result<DVector<f64>, PortfolioError> {
        if weights.len() != self.genes() {
            return Err(PortfolioError::DimensionMismatch {
                what: "weight vector",
                expected: self.genes(),
                actual: weights.len(),
            });
        }
        Ok(DVector::from_column_slice(weights))
    }

    /// `sqrt(wᵗ Σ w)`. Accepts any real vector, not only simplex points.
    pub fn volatility(&self, weights: &[f64]) -> Result<f64, PortfolioError> {
        let w = self.as_vector(weights)?;
        let variance = w.dot(&(&self.covariance * &w));
        if variance < -FLOAT_COMPARISON_EPSILON || variance.is_nan() {
            return Err(PortfolioError::NegativeVariance { variance });
        }
        // rounding noise around zero
        Ok(variance.max(0.).sqrt())
    }

    pub fn expected_return(&self, weights: &[f64]) -> Result<f64, PortfolioError> {
        let w = self.as_vector(weights)?;
        Ok(self.expected_returns.dot(&w))
    }

    /// Expected return over volatility. A zero volatility is an error, not 0 or infinity.
    pub fn fitness(&self, weights: &[f64]) -> Result<f64, PortfolioError> {
        let volatility = self.volatility(weights)?;
        if volatility == 0. {
            return Err(PortfolioError::ZeroVolatility);
        }
        Ok(self.expected_return(weights)? / volatility)
    }

    pub fn compute(&self, objective: Objective, weights: &[f64]) -> Result<f64, PortfolioError> {
        match objective {
            Objective::ExpectedReturn => self.expected_return(weights),
            Objective::Volatility => self.volatility(weights),
            Objective::Fitness => self.fitness(weights),
        }
    }

    /// Forward-difference estimate of d(objective)/d(w_index). The perturbed vector is not
    /// renormalized, so it generally leaves the simplex.
    pub fn partial_derivative(
        &self,
        objective: Objective,
        weights: &[f64],
        index: usize,
        epsilon: f64,
    ) -> Result<f64, PortfolioError> {
        let base = self.compute(objective, weights)?;
        let mut perturbed = weights.to_vec();
        perturbed[index] += epsilon;
        let bumped = self.compute(objective, &perturbed)?;
        Ok((bumped - base) / epsilon)
    }

    pub fn gradient(
        &self,
        objective: Objective,
        weights: &[f64],
        epsilon: f64,
    ) -> Result<Vec<f64>, PortfolioError> {
        (0..weights.len())
            .map(|index| self.partial_derivative(objective, weights, index, epsilon))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> FitnessEvaluator {
        // two uncorrelated assets with variances 0.04 and 0.09
        let covariance = DMatrix::from_row_slice(2, 2, &[0.04, 0., 0., 0.09]);
        let expected_returns = DVector::from_column_slice(&[0.1, 0.2]);
        FitnessEvaluator::new(covariance, expected_returns).unwrap()
    }

    #[test]
    fn test_single_asset_metrics() {
        let evaluator = evaluator();
        let all_in_first = [1., 0.];
        let volatility = evaluator.volatility(&all_in_first).unwrap();
        let expected_return = evaluator.expected_return(&all_in_first).unwrap();
        let fitness = evaluator.fitness(&all_in_first).unwrap();
        assert!((volatility - 0.2).abs() < FLOAT_COMPARISON_EPSILON);
        assert!((expected_return - 0.1).abs() < FLOAT_COMPARISON_EPSILON);
        assert!((fitness - 0.5).abs() < FLOAT_COMPARISON_EPSILON);
    }

    #[test]
    fn test_mixed_portfolio_fitness() {
        let evaluator = evaluator();
        let weights = [0.5, 0.5];
        // variance = 0.25 * 0.04 + 0.25 * 0.09
        let expected_vol = (0.0325f64).sqrt();
        let vol = evaluator.volatility(&weights).unwrap();
        assert!((vol - expected_vol).abs() < FLOAT_COMPARISON_EPSILON);
        let fitness = evaluator.fitness(&weights).unwrap();
        assert!((fitness - 0.15 / expected_vol).abs() < FLOAT_COMPARISON_EPSILON);
    }

    #[test]
    fn test_zero_volatility_is_an_error() {
        let evaluator = FitnessEvaluator::new(
            DMatrix::zeros(2, 2),
            DVector::from_column_slice(&[0.1, 0.1]),
        )
        .unwrap();
        assert_eq!(
            evaluator.fitness(&[0.5, 0.5]),
            Err(PortfolioError::ZeroVolatility)
        );
    }

    #[test]
    fn test_negative_quadratic_form_is_an_error() {
        // not positive semi-definite, but diagonal is fine
        let covariance = DMatrix::from_row_slice(2, 2, &[1., 2., 2., 1.]);
        let evaluator =
            FitnessEvaluator::new(covariance, DVector::from_column_slice(&[0.1, 0.1])).unwrap();
        assert!(matches!(
            evaluator.volatility(&[1., -1.]),
            Err(PortfolioError::NegativeVariance { .. })
        ));
    }

    #[test]
    fn test_dimension_checks() {
        let mismatch = FitnessEvaluator::new(
            DMatrix::identity(3, 3),
            DVector::from_column_slice(&[0.1, 0.1]),
        );
        assert!(matches!(
            mismatch,
            Err(PortfolioError::DimensionMismatch {
                expected: 3,
                actual: 2,
                ..
            })
        ));

        let negative_diagonal = FitnessEvaluator::new(
            DMatrix::from_row_slice(1, 1, &[-1.]),
            DVector::from_column_slice(&[0.1]),
        );
        assert!(matches!(
            negative_diagonal,
            Err(PortfolioError::NegativeVariance { .. })
        ));

        assert!(evaluator().fitness(&[1., 0., 0.]).is_err());
    }

    #[test]
    fn test_volatility_gradient_matches_analytic() {
        let evaluator = evaluator();
        let weights = [0.5, 0.5];
        let vol = evaluator.volatility(&weights).unwrap();
        let gradient = evaluator
            .gradient(Objective::Volatility, &weights, 1e-7)
            .unwrap();
        // d vol / d w_i = (Σ w)_i / vol
        let analytic = [0.04 * 0.5 / vol, 0.09 * 0.5 / vol];
        for (g, a) in gradient.iter().zip(analytic.iter()) {
            assert!((g - a).abs() < 1e-5, "numeric {} vs analytic {}", g, a);
        }
    }
}
