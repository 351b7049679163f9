//! Nonparametric neighbor regression on the sphere.
//!
//! Each sample becomes a rate point (`count / area` at its position). The
//! rate at a cell center is the weighted average of the rates of nearby
//! points, with the neighborhood either the `k` nearest points or every
//! point within a fixed angular radius.
//!
//! The neighborhood size is a hyperparameter: every candidate in the
//! configured grid is scored by mean Poisson deviance on a held-out
//! validation split (seeded, hence reproducible), the best one is refit on
//! all samples, and a configured `max_deviance` turns a bad best fit into
//! [`XmatchError::FitQuality`].

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::Radian;
use crate::estimator::{mean_poisson_deviance, RateSample};
use crate::healpix::{unit_vector, HealpixGrid};
use crate::xmatch_errors::XmatchError;

/// Distance floor for inverse-distance weights, radians.
const MIN_DISTANCE: f64 = 1e-9;

/// Neighborhood family and its candidate hyperparameter grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Neighborhood {
    /// The `k` nearest rate points; one model per candidate `k`.
    KNearest { candidates: Vec<usize> },
    /// Every rate point within an angular radius; one model per candidate
    /// radius (radians).
    FixedRadius { candidates: Vec<Radian> },
}

/// How neighbor rates are averaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Weighting {
    #[default]
    Uniform,
    /// Weight `1 / max(d, ε)` for a neighbor at angular distance `d`.
    InverseDistance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborConfig {
    pub neighborhood: Neighborhood,
    pub weighting: Weighting,
    /// Fraction of samples held out for hyperparameter scoring.
    pub validation_fraction: f64,
    /// Seed of the train/validation split.
    pub seed: u64,
    /// Reject the fit when the best held-out mean deviance exceeds this.
    pub max_deviance: Option<f64>,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        NeighborConfig {
            neighborhood: Neighborhood::KNearest {
                candidates: vec![5, 10, 20],
            },
            weighting: Weighting::InverseDistance,
            validation_fraction: 0.25,
            seed: 0,
            max_deviance: None,
        }
    }
}

/// One fitted rate point.
struct RatePoint {
    dir: Vector3<f64>,
    rate: f64,
}

/// A concrete hyperparameter value under evaluation.
#[derive(Debug, Clone, Copy)]
enum Candidate {
    K(usize),
    Radius(Radian),
}

fn predict(points: &[RatePoint], target: &Vector3<f64>, candidate: Candidate, w: Weighting) -> f64 {
    // chord distance is monotonic in angular distance, so ranking by it is
    // ranking by separation
    let mut dist: Vec<(f64, f64)> = points
        .iter()
        .map(|p| {
            let chord = (p.dir - target).norm();
            let angle = 2.0 * (chord / 2.0).clamp(0.0, 1.0).asin();
            (angle, p.rate)
        })
        .collect();

    let neighbors: &[(f64, f64)] = match candidate {
        Candidate::K(k) => {
            let k = k.clamp(1, dist.len());
            dist.sort_by(|a, b| a.0.total_cmp(&b.0));
            &dist[..k]
        }
        Candidate::Radius(r) => {
            dist.retain(|(d, _)| *d <= r);
            &dist
        }
    };

    if neighbors.is_empty() {
        // no point within the radius: fall back to the global mean rate
        return points.iter().map(|p| p.rate).sum::<f64>() / points.len() as f64;
    }

    let mut num = 0.0;
    let mut den = 0.0;
    for &(d, rate) in neighbors {
        let weight = match w {
            Weighting::Uniform => 1.0,
            Weighting::InverseDistance => 1.0 / d.max(MIN_DISTANCE),
        };
        num += weight * rate;
        den += weight;
    }
    num / den
}

pub(crate) fn estimate(
    samples: &[RateSample],
    grid: &HealpixGrid,
    config: &NeighborConfig,
) -> Result<Vec<f64>, XmatchError> {
    if !(0.0..1.0).contains(&config.validation_fraction) {
        return Err(XmatchError::Config(format!(
            "validation_fraction {} must lie in [0, 1)",
            config.validation_fraction
        )));
    }
    if samples.iter().any(|s| s.area <= 0.0) {
        return Err(XmatchError::InsufficientData(
            "a sample covers no solid angle".to_string(),
        ));
    }

    let candidates: Vec<Candidate> = match &config.neighborhood {
        Neighborhood::KNearest { candidates } => {
            candidates.iter().map(|&k| Candidate::K(k)).collect()
        }
        Neighborhood::FixedRadius { candidates } => {
            candidates.iter().map(|&r| Candidate::Radius(r)).collect()
        }
    };
    if candidates.is_empty() {
        return Err(XmatchError::Config(
            "neighbor estimation needs at least one hyperparameter candidate".to_string(),
        ));
    }

    let points: Vec<RatePoint> = samples
        .iter()
        .map(|s| RatePoint {
            dir: unit_vector(s.lon, s.lat),
            rate: s.rate(),
        })
        .collect();

    // Seeded split. Tiny sample sets are scored in-sample rather than split
    // into degenerate halves.
    let mut indices: Vec<usize> = (0..samples.len()).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(config.seed));
    let n_val = ((samples.len() as f64 * config.validation_fraction).round() as usize)
        .min(samples.len().saturating_sub(1));
    let (val_idx, train_idx): (&[usize], &[usize]) = if samples.len() < 4 || n_val == 0 {
        (&indices[..], &indices[..])
    } else {
        indices.split_at(n_val)
    };

    let train: Vec<RatePoint> = train_idx
        .iter()
        .map(|&i| RatePoint {
            dir: points[i].dir,
            rate: points[i].rate,
        })
        .collect();
    let held_out: Vec<(u64, f64)> = val_idx
        .iter()
        .map(|&i| (samples[i].count, samples[i].area))
        .collect();

    let mut best: Option<(Candidate, f64)> = None;
    for &candidate in &candidates {
        let predicted: Vec<f64> = val_idx
            .iter()
            .map(|&i| predict(&train, &points[i].dir, candidate, config.weighting))
            .collect();
        let deviance = mean_poisson_deviance(&held_out, &predicted);
        debug!(?candidate, deviance, "neighbor candidate scored");
        if best.map_or(true, |(_, d)| deviance < d) {
            best = Some((candidate, deviance));
        }
    }
    let (chosen, deviance) = best.ok_or_else(|| {
        XmatchError::InsufficientData("no candidate could be scored".to_string())
    })?;

    if let Some(threshold) = config.max_deviance {
        if deviance > threshold {
            return Err(XmatchError::FitQuality {
                deviance,
                threshold,
            });
        }
    }

    // Refit on all samples, evaluate at cell centers.
    let mut values = Vec::with_capacity(grid.n_pix() as usize);
    for cell in 0..grid.n_pix() {
        let (lon, lat) = grid.center_of(cell)?;
        let v = predict(&points, &unit_vector(lon, lat), chosen, config.weighting);
        values.push(v.max(0.0));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::EstimationMethod;
    use approx::assert_relative_eq;

    fn disk_sample(lon: f64, lat: f64, count: u64) -> RateSample {
        RateSample {
            lon,
            lat,
            count,
            area: 0.5,
        }
    }

    fn ring_of_samples(rate_per_sr: f64, n: usize) -> Vec<RateSample> {
        (0..n)
            .map(|i| {
                let lon = i as f64 / n as f64 * crate::constants::DPI;
                let lat = ((i as f64 * 2.399).sin() * 0.9).asin().clamp(-1.3, 1.3);
                disk_sample(lon, lat, (rate_per_sr * 0.5).round() as u64)
            })
            .collect()
    }

    #[test]
    fn constant_field_is_recovered_everywhere() {
        // every sample sees 4 objects over 0.5 sr: the field is 8 / sr
        let samples = ring_of_samples(8.0, 64);
        let grid = HealpixGrid::new(2).unwrap();
        let config = NeighborConfig::default();
        let values = estimate(&samples, &grid, &config).unwrap();
        for v in values {
            assert_relative_eq!(v, 8.0, max_relative = 1e-9);
        }
    }

    #[test]
    fn split_is_reproducible() {
        let samples = ring_of_samples(8.0, 40);
        let grid = HealpixGrid::new(1).unwrap();
        let config = NeighborConfig {
            seed: 42,
            ..Default::default()
        };
        let a = estimate(&samples, &grid, &config).unwrap();
        let b = estimate(&samples, &grid, &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn max_deviance_rejects_bad_fits() {
        // alternating extreme counts cannot be fit by a 1-NN model; a strict
        // threshold must fire
        let samples: Vec<RateSample> = (0..32)
            .map(|i| {
                let lon = i as f64 * 0.196;
                let count = if i % 2 == 0 { 0 } else { 200 };
                disk_sample(lon, 0.0, count)
            })
            .collect();
        let grid = HealpixGrid::new(1).unwrap();
        let config = NeighborConfig {
            neighborhood: Neighborhood::KNearest {
                candidates: vec![1],
            },
            max_deviance: Some(1e-3),
            ..Default::default()
        };
        assert!(matches!(
            estimate(&samples, &grid, &config),
            Err(XmatchError::FitQuality { .. })
        ));
    }

    #[test]
    fn fixed_radius_falls_back_to_global_mean() {
        // all samples on the equator, radius far too small to reach the
        // poles: polar cells get the global mean, not NaN
        let samples = vec![
            disk_sample(0.0, 0.0, 2),
            disk_sample(1.0, 0.0, 4),
            disk_sample(2.0, 0.0, 6),
        ];
        let grid = HealpixGrid::new(1).unwrap();
        let config = NeighborConfig {
            neighborhood: Neighborhood::FixedRadius {
                candidates: vec![0.05],
            },
            weighting: Weighting::Uniform,
            ..Default::default()
        };
        let values = estimate(&samples, &grid, &config).unwrap();
        let polar = values[0];
        assert_relative_eq!(polar, (4.0 + 8.0 + 12.0) / 3.0, max_relative = 1e-9);
        assert!(values.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn empty_candidate_grid_is_a_config_error() {
        let samples = ring_of_samples(8.0, 10);
        let grid = HealpixGrid::new(1).unwrap();
        let method = EstimationMethod::Neighbor(NeighborConfig {
            neighborhood: Neighborhood::KNearest { candidates: vec![] },
            ..Default::default()
        });
        assert!(matches!(
            method.estimate(&samples, &grid),
            Err(XmatchError::Config(_))
        ));
    }
}
