//! Per-cell maximum-likelihood rate estimate.
//!
//! Samples are binned by the grid cell containing their center. Within one
//! cell the Poisson MLE of the rate is the total observed count divided by
//! the total sampled solid angle. Cells that received no sample get the value
//! dictated by the [`EmptyCellPolicy`].

use crate::estimator::{EmptyCellPolicy, RateSample};
use crate::healpix::HealpixGrid;
use crate::xmatch_errors::XmatchError;

pub(crate) fn estimate(
    samples: &[RateSample],
    grid: &HealpixGrid,
    empty_cells: EmptyCellPolicy,
) -> Result<Vec<f64>, XmatchError> {
    let n_pix = grid.n_pix() as usize;
    let mut cell_counts = vec![0u64; n_pix];
    let mut cell_areas = vec![0.0f64; n_pix];
    let mut total_count = 0u64;
    let mut total_area = 0.0f64;

    for sample in samples {
        if sample.area <= 0.0 {
            return Err(XmatchError::InsufficientData(format!(
                "sample at ({}, {}) covers no solid angle",
                sample.lon, sample.lat
            )));
        }
        let cell = grid.cell_of(sample.lon, sample.lat) as usize;
        cell_counts[cell] += sample.count;
        cell_areas[cell] += sample.area;
        total_count += sample.count;
        total_area += sample.area;
    }

    let global = total_count as f64 / total_area;
    let fill = match empty_cells {
        EmptyCellPolicy::Zero => 0.0,
        EmptyCellPolicy::GlobalMean => global,
    };

    Ok((0..n_pix)
        .map(|i| {
            if cell_areas[i] > 0.0 {
                cell_counts[i] as f64 / cell_areas[i]
            } else {
                fill
            }
        })
        .collect())
}
