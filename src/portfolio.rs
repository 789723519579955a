use rand::distributions::Uniform;
use rand::Rng;
use serde::Serialize;

use crate::consts::FLOAT_COMPARISON_EPSILON;
use crate::errors::PortfolioError;

/// A candidate allocation: non-negative weights summing to one.
///
/// The only ways to build one are [`Chromosome::random`] and [`Chromosome::project`],
/// so every value of this type satisfies the simplex constraint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Chromosome {
    weights: Vec<f64>,
}

impl Chromosome {
    /// Draws `genes` independent U(0, 1) values and projects them onto the simplex.
    pub fn random<R: Rng + ?Sized>(genes: usize, rng: &mut R) -> Result<Self, PortfolioError> {
        let uniform = Uniform::new(0., 1.);
        let raw = (0..genes).map(|_| rng.sample(uniform)).collect::<Vec<f64>>();
        Self::project(&raw)
    }

    /// Folds every component to its absolute value, then divides by the sum.
    ///
    /// Negative components keep their magnitude instead of being clipped to zero.
    /// Fails when the magnitudes sum to zero (or overflow), since nothing can be normalized.
    pub fn project(vector: &[f64]) -> Result<Self, PortfolioError> {
        let magnitude = vector.iter().map(|gene| gene.abs()).sum::<f64>();
        if !(magnitude > 0.) || !magnitude.is_finite() {
            return Err(PortfolioError::DegenerateVector { sum: magnitude });
        }

        Ok(Chromosome {
            weights: vector.iter().map(|gene| gene.abs() / magnitude).collect(),
        })
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn genes(&self) -> usize {
        self.weights.len()
    }

    pub fn into_weights(self) -> Vec<f64> {
        self.weights
    }

    pub fn is_feasible(&self) -> bool {
        let total = self.weights.iter().sum::<f64>();
        self.weights.iter().all(|w| *w >= 0.) && (total - 1.).abs() <= FLOAT_COMPARISON_EPSILON
    }
}

impl AsRef<[f64]> for Chromosome {
    fn as_ref(&self) -> &[f64] {
        &self.weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_project_folds_negatives() {
        let projected = Chromosome::project(&[-1., 2., 1.]).unwrap();
        let expected = [0.25, 0.5, 0.25];
        for (w, e) in projected.weights().iter().zip(expected.iter()) {
            assert!((w - e).abs() < FLOAT_COMPARISON_EPSILON, "got {:?}", projected);
        }
    }

    #[test]
    fn test_project_zero_vector_is_degenerate() {
        assert_eq!(
            Chromosome::project(&[0., 0., 0.]),
            Err(PortfolioError::DegenerateVector { sum: 0. })
        );
        assert!(Chromosome::project(&[]).is_err());
        assert!(Chromosome::project(&[f64::INFINITY, 1.]).is_err());
        assert!(Chromosome::project(&[f64::NAN, 1.]).is_err());
    }

    #[test]
    fn test_random_chromosomes_are_feasible() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for genes in 1..20 {
            let chromosome = Chromosome::random(genes, &mut rng).unwrap();
            assert_eq!(chromosome.genes(), genes);
            assert!(chromosome.is_feasible(), "{:?}", chromosome);
        }
    }

    #[test]
    fn test_projection_is_idempotent() {
        let once = Chromosome::project(&[0.3, -0.2, 0.9, 0.0]).unwrap();
        let twice = Chromosome::project(once.weights()).unwrap();
        for (a, b) in once.weights().iter().zip(twice.weights()) {
            assert!((a - b).abs() < FLOAT_COMPARISON_EPSILON);
        }
    }
}
