//! # Spherical grid index (HEALPix, RING scheme)
//!
//! Fixed-resolution equal-area tessellation of the sphere used as the
//! substrate for density maps. A grid of order `k` has
//! `N_pix = 12·4^k` cells, each covering exactly `4π / N_pix` steradians.
//!
//! Cell ids follow the standard HEALPix RING numbering so that persisted
//! atlases remain valid across processes: the mapping
//! (longitude, latitude) ↔ cell id is fully deterministic and
//! bit-reproducible for a given order.
//!
//! Coordinates everywhere in this crate are **longitude/latitude in
//! radians**: `lon ∈ [0, 2π)` (any real value is wrapped), `lat ∈ [−π/2, π/2]`.
//! The HEALPix colatitude convention is internal to this module and never
//! leaks to callers.
//!
//! ## See also
//! ------------
//! * [`crate::atlas`] – density maps stored as per-cell arrays.
//! * [`crate::estimator`] – estimators evaluated at cell centers.

use nalgebra::Vector3;

use crate::constants::{Radian, Steradian, DPI, SPHERE_SR};
use crate::xmatch_errors::XmatchError;

/// Highest supported order: 12·4^28 still fits comfortably in `u64`
/// and matches the limit of common HEALPix implementations.
pub const MAX_ORDER: u32 = 28;

/// An equal-area spherical grid of fixed order (RING scheme).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealpixGrid {
    order: u32,
    nside: u64,
}

impl HealpixGrid {
    /// Create a grid of the given order `k` (`N_pix = 12·4^k`).
    ///
    /// Arguments
    /// -----------------
    /// * `order`: the power-of-two refinement factor, `0 ≤ order ≤ 28`.
    ///
    /// Return
    /// ----------
    /// * A new [`HealpixGrid`], or [`XmatchError::InvalidResolution`] if the
    ///   order exceeds [`MAX_ORDER`].
    pub fn new(order: u32) -> Result<Self, XmatchError> {
        if order > MAX_ORDER {
            return Err(XmatchError::InvalidResolution(order));
        }
        Ok(HealpixGrid {
            order,
            nside: 1u64 << order,
        })
    }

    /// The grid order `k`.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// The HEALPix `N_side` parameter (`2^k`).
    pub fn nside(&self) -> u64 {
        self.nside
    }

    /// Total number of cells, `12·4^k`.
    pub fn n_pix(&self) -> u64 {
        12 * self.nside * self.nside
    }

    /// Solid angle of one cell in steradians (identical for every cell).
    pub fn cell_area(&self) -> Steradian {
        SPHERE_SR / self.n_pix() as f64
    }

    /// Number of cells in one polar cap, `2·nside·(nside − 1)`.
    fn n_cap(&self) -> u64 {
        2 * self.nside * (self.nside - 1)
    }

    /// Map a sky position to the id of the cell containing it.
    ///
    /// Total over all finite inputs: longitude is wrapped into `[0, 2π)`,
    /// latitude is clamped to `[−π/2, π/2]`.
    pub fn cell_of(&self, lon: Radian, lat: Radian) -> u64 {
        let nside = self.nside as f64;
        let z = lat.clamp(-std::f64::consts::FRAC_PI_2, std::f64::consts::FRAC_PI_2).sin();
        let mut tt = wrap_lon(lon) / std::f64::consts::FRAC_PI_2; // in [0,4)
        if tt >= 4.0 {
            tt = 0.0;
        }

        if z.abs() <= 2.0 / 3.0 {
            // Equatorial region
            let temp1 = nside * (0.5 + tt);
            let temp2 = nside * (z * 0.75);
            let jp = (temp1 - temp2) as u64; // ascending edge line index
            let jm = (temp1 + temp2) as u64; // descending edge line index

            let ir = self.nside + 1 + jp - jm; // ring number, 1..=2·nside+1
            let kshift = 1 - (ir & 1); // 1 when the ring is even

            let nl4 = 4 * self.nside;
            let mut ip = (jp + jm + kshift + 1 - self.nside) / 2;
            ip %= nl4;

            self.n_cap() + (ir - 1) * nl4 + ip
        } else {
            // Polar caps
            let tp = tt.fract();
            let tmp = nside * (3.0 * (1.0 - z.abs())).sqrt();

            let jp = (tp * tmp) as u64;
            let jm = ((1.0 - tp) * tmp) as u64;

            let ir = jp + jm + 1; // ring number counted from the closest pole
            let ip = ((tt * ir as f64) as u64) % (4 * ir);

            if z > 0.0 {
                2 * ir * (ir - 1) + ip
            } else {
                self.n_pix() - 2 * ir * (ir + 1) + ip
            }
        }
    }

    /// Representative position (cell center) of a cell id.
    ///
    /// Return
    /// ----------
    /// * `(lon, lat)` in radians, or [`XmatchError::NotFound`] if the id is
    ///   out of range for this grid.
    pub fn center_of(&self, cell: u64) -> Result<(Radian, Radian), XmatchError> {
        let npix = self.n_pix();
        if cell >= npix {
            return Err(XmatchError::NotFound(format!(
                "cell id {cell} out of range for grid with {npix} cells"
            )));
        }
        let ncap = self.n_cap();
        let fact2 = 4.0 / npix as f64;

        let (z, phi) = if cell < ncap {
            // North polar cap
            let hip = (cell + 1) as f64 / 2.0;
            let iring = ((hip - hip.floor().sqrt()).sqrt() as u64) + 1;
            let iphi = (cell + 1) - 2 * iring * (iring - 1);

            let z = 1.0 - (iring * iring) as f64 * fact2;
            let phi = (iphi as f64 - 0.5) * std::f64::consts::FRAC_PI_2 / iring as f64;
            (z, phi)
        } else if cell < npix - ncap {
            // Equatorial region
            let nl4 = 4 * self.nside;
            let ip = cell - ncap;
            let iring = ip / nl4 + self.nside;
            let iphi = ip % nl4 + 1;

            // 1.0 for odd (iring + nside), 0.5 otherwise
            let fodd = 0.5 * (1 + ((iring + self.nside) & 1)) as f64;

            let fact1 = 2.0 / (3.0 * self.nside as f64);
            let z = (2 * self.nside) as f64 * fact1 - iring as f64 * fact1;
            let phi = (iphi as f64 - fodd) * std::f64::consts::FRAC_PI_2 / self.nside as f64;
            (z, phi)
        } else {
            // South polar cap
            let ip = npix - cell;
            let hip = ip as f64 / 2.0;
            let iring = ((hip - hip.floor().sqrt()).sqrt() as u64) + 1;
            let iphi = 4 * iring + 1 - (ip - 2 * iring * (iring - 1));

            let z = -1.0 + (iring * iring) as f64 * fact2;
            let phi = (iphi as f64 - 0.5) * std::f64::consts::FRAC_PI_2 / iring as f64;
            (z, phi)
        };

        Ok((wrap_lon(phi), z.clamp(-1.0, 1.0).asin()))
    }
}

/// Wrap a longitude into `[0, 2π)`.
pub fn wrap_lon(lon: Radian) -> Radian {
    let mut l = lon % DPI;
    if l < 0.0 {
        l += DPI;
    }
    l
}

/// Unit vector of a sky position.
pub fn unit_vector(lon: Radian, lat: Radian) -> Vector3<f64> {
    let (sl, cl) = lat.sin_cos();
    let (so, co) = lon.sin_cos();
    Vector3::new(cl * co, cl * so, sl)
}

/// Great-circle separation between two sky positions, in radians.
///
/// Uses the arc form of the chord length, numerically stable for both small
/// and near-antipodal separations.
pub fn angular_separation(lon1: Radian, lat1: Radian, lon2: Radian, lat2: Radian) -> Radian {
    let chord = (unit_vector(lon1, lat1) - unit_vector(lon2, lat2)).norm();
    2.0 * (chord / 2.0).clamp(0.0, 1.0).asin()
}
