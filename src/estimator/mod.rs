//! # Density estimation methods
//!
//! Turns a set of Poisson count samples (count over a known solid angle at a
//! known position) into a per-cell rate array on a [`HealpixGrid`]. Two
//! families are available through the [`EstimationMethod`] dispatcher:
//!
//! * [`map_estimate`] – the per-cell maximum-likelihood rate `Σcounts/Σareas`
//!   with a configurable fill policy for cells no sample fell into;
//! * [`neighbor`] – nonparametric neighbor regression (k-nearest or fixed
//!   radius, uniform or inverse-distance weights) with hyperparameters chosen
//!   by held-out mean Poisson deviance.
//!
//! Estimated rates are always finite and non-negative; an empty sample set is
//! rejected with [`XmatchError::InsufficientData`].

pub mod map_estimate;
pub mod neighbor;

use serde::{Deserialize, Serialize};

use crate::constants::{Radian, Steradian};
use crate::healpix::HealpixGrid;
use crate::xmatch_errors::XmatchError;

pub use neighbor::{NeighborConfig, Neighborhood, Weighting};

/// One training point for an estimator: a count observed over a known area.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSample {
    pub lon: Radian,
    pub lat: Radian,
    pub count: u64,
    pub area: Steradian,
}

impl RateSample {
    /// Empirical rate of the sample, objects per steradian.
    pub fn rate(&self) -> f64 {
        self.count as f64 / self.area
    }
}

/// What a cell without any sample receives in the MAP estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmptyCellPolicy {
    /// Leave the cell at zero rate.
    Zero,
    /// Fill with the pooled all-sky rate `Σcounts / Σareas`.
    #[default]
    GlobalMean,
}

/// A density estimation method, dispatched by [`EstimationMethod::estimate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EstimationMethod {
    MapEstimate { empty_cells: EmptyCellPolicy },
    Neighbor(NeighborConfig),
}

impl EstimationMethod {
    /// Stable method name, recorded in map provenance.
    pub fn name(&self) -> &'static str {
        match self {
            EstimationMethod::MapEstimate { .. } => "map_estimate",
            EstimationMethod::Neighbor(_) => "neighbor",
        }
    }

    /// Estimate one rate per grid cell from the samples.
    pub fn estimate(
        &self,
        samples: &[RateSample],
        grid: &HealpixGrid,
    ) -> Result<Vec<f64>, XmatchError> {
        if samples.is_empty() {
            return Err(XmatchError::InsufficientData(
                "no count samples available".to_string(),
            ));
        }
        match self {
            EstimationMethod::MapEstimate { empty_cells } => {
                map_estimate::estimate(samples, grid, *empty_cells)
            }
            EstimationMethod::Neighbor(config) => neighbor::estimate(samples, grid, config),
        }
    }
}

/// Mean Poisson deviance of predicted rates against observed counts.
///
/// For an observed count `x` over area `A` and a predicted rate `λ`, the
/// expected count is `μ = λ·A` and the unit deviance is
/// `2·(x·ln(x/μ) − (x − μ))`, with the `x = 0` limit `2μ`. The expectation is
/// floored away from zero so a zero-rate prediction against a positive count
/// is heavily (but finitely) penalized.
pub(crate) fn mean_poisson_deviance(
    observed: &[(u64, Steradian)],
    predicted_rates: &[f64],
) -> f64 {
    debug_assert_eq!(observed.len(), predicted_rates.len());
    if observed.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    for (&(count, area), &rate) in observed.iter().zip(predicted_rates) {
        let mu = (rate * area).max(1e-12);
        let x = count as f64;
        let dev = if count == 0 {
            2.0 * mu
        } else {
            2.0 * (x * (x / mu).ln() - (x - mu))
        };
        total += dev;
    }
    total / observed.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn deviance_is_zero_at_perfect_fit() {
        // μ = x for every point: deviance vanishes
        let observed = vec![(3u64, 1.0), (5u64, 2.0)];
        let rates = vec![3.0, 2.5];
        assert_relative_eq!(mean_poisson_deviance(&observed, &rates), 0.0);
    }

    #[test]
    fn deviance_penalizes_mismatch() {
        let observed = vec![(4u64, 1.0)];
        let good = mean_poisson_deviance(&observed, &[4.0]);
        let off = mean_poisson_deviance(&observed, &[1.0]);
        let worse = mean_poisson_deviance(&observed, &[0.1]);
        assert!(good < off && off < worse);
        // zero-count limit is 2μ
        assert_relative_eq!(mean_poisson_deviance(&[(0, 2.0)], &[1.5]), 6.0);
    }

    #[test]
    fn empty_sample_set_is_rejected() {
        let grid = HealpixGrid::new(1).unwrap();
        let method = EstimationMethod::MapEstimate {
            empty_cells: EmptyCellPolicy::Zero,
        };
        assert!(matches!(
            method.estimate(&[], &grid),
            Err(XmatchError::InsufficientData(_))
        ));
    }
}
