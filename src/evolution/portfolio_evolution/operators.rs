use itertools::izip;
use rand::seq::SliceRandom;
use rand::Rng;

use super::MutationSource;
use crate::errors::PortfolioError;
use crate::portfolio::Chromosome;

/// Differential recombination: `chromosome + f * (member_a - member_b)`, projected back
/// onto the simplex. Both members are drawn with replacement, so they may coincide
/// (and the step is then a no-op).
pub fn recombine<R: Rng + ?Sized>(
    chromosome: &Chromosome,
    population: &[Chromosome],
    f: f64,
    rng: &mut R,
) -> Result<Chromosome, PortfolioError> {
    let (Some(member_a), Some(member_b)) = (population.choose(rng), population.choose(rng)) else {
        return Ok(chromosome.clone());
    };

    let combined = izip!(chromosome.weights(), member_a.weights(), member_b.weights())
        .map(|(gene, a, b)| gene + f * (a - b))
        .collect::<Vec<f64>>();

    Chromosome::project(&combined)
}

/// Replaces each gene with probability `cr` by a gene of `best`, then re-projects.
pub fn mutate<R: Rng + ?Sized>(
    chromosome: &Chromosome,
    best: &Chromosome,
    cr: f64,
    source: MutationSource,
    rng: &mut R,
) -> Result<Chromosome, PortfolioError> {
    let best_weights = best.weights();
    let mut genes = chromosome.weights().to_vec();

    for (position, gene) in genes.iter_mut().enumerate() {
        // strict comparison: cr = 0 never fires, cr = 1 always does
        if rng.gen::<f64>() < cr {
            let replacement = match source {
                MutationSource::FirstGene => best_weights.first(),
                MutationSource::Positional => best_weights.get(position),
            };
            if let Some(value) = replacement {
                *gene = *value;
            }
        }
    }

    Chromosome::project(&genes)
}
