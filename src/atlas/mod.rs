//! # Density atlas
//!
//! A [`Atlas`] accumulates Poisson count samples for one reference database
//! and turns them into per-object-type **density maps**: dense arrays with
//! one rate value (objects per steradian) per cell of a fixed
//! [`HealpixGrid`]. The atlas is the unit of persistence — samples, maps and
//! provenance travel together in a single versioned container file.
//!
//! Typical build flow:
//!
//! ```text
//! Atlas::new  →  add_samples (random radius queries)  →  build_density_map
//!            →  save / load  →  value_at lookups during match reduction
//! ```
//!
//! ## See also
//! ------------
//! * [`crate::estimator`] – the estimation methods dispatched by
//!   [`Atlas::build_density_map`].
//! * [`crate::reduction`] – consumes maps through [`DensityMap::value_at`].

mod container;

use std::collections::BTreeMap;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::{ObjectType, Radian, Steradian, TypeCounts};
use crate::databases::{
    run_query_pool, uniform_sphere_points, BatchReport, PoolConfig, SourceDatabase,
};
use crate::estimator::{EstimationMethod, RateSample};
use crate::healpix::HealpixGrid;
use crate::xmatch_errors::XmatchError;

/// Celestial coordinate frame of an atlas and its maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoordFrame {
    #[default]
    Icrs,
    Galactic,
}

impl std::fmt::Display for CoordFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordFrame::Icrs => write!(f, "icrs"),
            CoordFrame::Galactic => write!(f, "galactic"),
        }
    }
}

/// One Poisson count sample: per-type object counts inside a small disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountSample {
    pub lon: Radian,
    pub lat: Radian,
    /// Query disk radius, radians.
    pub radius: Radian,
    pub counts: TypeCounts,
    /// Grid cell containing the sample center, fixed at insertion time.
    pub cell: u64,
}

impl CountSample {
    /// Solid angle covered by the sample disk (small-angle, `π·r²`).
    pub fn area(&self) -> Steradian {
        std::f64::consts::PI * self.radius * self.radius
    }
}

/// A per-cell density map for one object type (objects per steradian).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityMap {
    object_type: ObjectType,
    order: u32,
    values: Vec<f64>,
    frame: CoordFrame,
    /// Name of the estimation method that produced the map.
    method: String,
    created: DateTime<Utc>,
    edited: DateTime<Utc>,
}

impl DensityMap {
    pub(crate) fn new(
        object_type: ObjectType,
        grid: &HealpixGrid,
        values: Vec<f64>,
        frame: CoordFrame,
        method: String,
    ) -> Result<Self, XmatchError> {
        if values.len() as u64 != grid.n_pix() {
            return Err(XmatchError::ContainerFormat(format!(
                "density map has {} values, grid has {} cells",
                values.len(),
                grid.n_pix()
            )));
        }
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(XmatchError::InsufficientData(format!(
                "estimator produced a non-finite or negative rate for type {object_type}"
            )));
        }
        let now = Utc::now();
        Ok(DensityMap {
            object_type,
            order: grid.order(),
            values,
            frame,
            method,
            created: now,
            edited: now,
        })
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn frame(&self) -> CoordFrame {
        self.frame
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Grid order the map was built at.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// One rate value per grid cell, in cell-id order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Local rate at an arbitrary sky position: the value of the containing
    /// cell. Total over all finite positions.
    pub fn value_at(&self, lon: Radian, lat: Radian) -> Result<f64, XmatchError> {
        let grid = HealpixGrid::new(self.order)?;
        Ok(self.values[grid.cell_of(lon, lat) as usize])
    }
}

/// Count samples plus density maps for one reference database.
#[derive(Debug, Clone)]
pub struct Atlas {
    grid: HealpixGrid,
    frame: CoordFrame,
    /// Name of the reference database the samples were drawn from.
    database: String,
    created: DateTime<Utc>,
    edited: DateTime<Utc>,
    counts: Vec<CountSample>,
    maps: BTreeMap<ObjectType, DensityMap>,
}

impl Atlas {
    /// Create an empty atlas on a grid of the given order.
    pub fn new(
        order: u32,
        frame: CoordFrame,
        database: impl Into<String>,
    ) -> Result<Self, XmatchError> {
        let now = Utc::now();
        Ok(Atlas {
            grid: HealpixGrid::new(order)?,
            frame,
            database: database.into(),
            created: now,
            edited: now,
            counts: Vec::new(),
            maps: BTreeMap::new(),
        })
    }

    pub(crate) fn from_parts(
        grid: HealpixGrid,
        frame: CoordFrame,
        database: String,
        created: DateTime<Utc>,
        edited: DateTime<Utc>,
        counts: Vec<CountSample>,
        maps: BTreeMap<ObjectType, DensityMap>,
    ) -> Self {
        Atlas {
            grid,
            frame,
            database,
            created,
            edited,
            counts,
            maps,
        }
    }

    pub fn grid(&self) -> &HealpixGrid {
        &self.grid
    }

    pub fn frame(&self) -> CoordFrame {
        self.frame
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn edited(&self) -> DateTime<Utc> {
        self.edited
    }

    /// All accumulated count samples, in insertion order.
    pub fn counts(&self) -> &[CountSample] {
        &self.counts
    }

    pub(crate) fn maps(&self) -> &BTreeMap<ObjectType, DensityMap> {
        &self.maps
    }

    /// Object types seen in at least one sample, sorted.
    pub fn object_types(&self) -> Vec<ObjectType> {
        let mut types: Vec<ObjectType> = self
            .counts
            .iter()
            .flat_map(|s| s.counts.keys().cloned())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Insert one count sample. The containing cell is resolved here and
    /// persists with the sample.
    pub fn push_sample(&mut self, lon: Radian, lat: Radian, radius: Radian, counts: TypeCounts) {
        let cell = self.grid.cell_of(lon, lat);
        self.counts.push(CountSample {
            lon,
            lat,
            radius,
            counts,
            cell,
        });
        self.edited = Utc::now();
    }

    /// Accumulate `n` random count samples from a reference database.
    ///
    /// Positions are drawn uniformly on the sphere from `rng`, queried on the
    /// bounded worker pool, and inserted by the calling thread. Failed
    /// queries are logged and skipped; the report tells how many survived.
    ///
    /// Arguments
    /// -----------------
    /// * `db`: the reference database to sample.
    /// * `n`: number of random sample disks.
    /// * `radius`: disk radius in radians.
    /// * `pool`: worker-pool settings for the query batch.
    /// * `rng`: source of sample positions (seed it for reproducible runs).
    pub fn add_samples<R: Rng + ?Sized>(
        &mut self,
        db: &dyn SourceDatabase,
        n: usize,
        radius: Radian,
        pool: &PoolConfig,
        rng: &mut R,
    ) -> BatchReport {
        let positions = uniform_sphere_points(n, rng);
        let label = format!("sampling {}", db.name());
        let (results, report) = run_query_pool(&positions, pool, &label, |&(lon, lat)| {
            db.count_types(lon, lat, radius).map(|c| (lon, lat, c))
        });
        for (lon, lat, counts) in results {
            self.push_sample(lon, lat, radius, counts);
        }
        info!(
            database = db.name(),
            requested = report.requested,
            succeeded = report.succeeded,
            "atlas sampling batch finished"
        );
        report
    }

    /// Estimate the density map of one object type from the accumulated
    /// samples.
    ///
    /// A sample that recognizes other types but not this one contributes a
    /// zero count over its area. If no sample mentions the type at all the
    /// call fails with [`XmatchError::NotFound`].
    ///
    /// Arguments
    /// -----------------
    /// * `object_type`: the type to map.
    /// * `method`: the estimation method, see [`EstimationMethod`].
    /// * `in_place`: when `true`, the map is also stored in the atlas
    ///   (replacing any previous map for the type).
    ///
    /// Return
    /// ----------
    /// * The freshly built [`DensityMap`].
    pub fn build_density_map(
        &mut self,
        object_type: &str,
        method: &EstimationMethod,
        in_place: bool,
    ) -> Result<DensityMap, XmatchError> {
        if !self.counts.iter().any(|s| s.counts.contains_key(object_type)) {
            return Err(XmatchError::NotFound(format!(
                "object type {object_type} appears in no sample of atlas {}",
                self.database
            )));
        }
        let samples: Vec<RateSample> = self
            .counts
            .iter()
            .map(|s| RateSample {
                lon: s.lon,
                lat: s.lat,
                count: s.counts.get(object_type).copied().unwrap_or(0),
                area: s.area(),
            })
            .collect();

        let values = method.estimate(&samples, &self.grid)?;
        let map = DensityMap::new(
            object_type.to_string(),
            &self.grid,
            values,
            self.frame,
            method.name().to_string(),
        )?;
        info!(
            database = %self.database,
            object_type,
            method = method.name(),
            "density map built"
        );
        if in_place {
            self.maps.insert(object_type.to_string(), map.clone());
            self.edited = Utc::now();
        }
        Ok(map)
    }

    /// Fetch a stored density map.
    pub fn get_map(&self, object_type: &str) -> Result<&DensityMap, XmatchError> {
        self.maps.get(object_type).ok_or_else(|| {
            XmatchError::NotFound(format!(
                "no density map for type {object_type} in atlas {}",
                self.database
            ))
        })
    }

    /// Discard every sample and every stored map. Destructive; callers that
    /// need a confirmation step must provide it themselves.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.maps.clear();
        self.edited = Utc::now();
    }

    /// Append the count samples of another atlas built on the same grid.
    ///
    /// Stored maps are left untouched and no longer reflect the merged
    /// samples; rebuild them with [`Atlas::build_density_map`].
    pub fn merge(&mut self, other: &Atlas) -> Result<(), XmatchError> {
        if self.grid.n_pix() != other.grid.n_pix() {
            return Err(XmatchError::IncommensurateAtlas(
                self.grid.n_pix(),
                other.grid.n_pix(),
            ));
        }
        self.counts.extend_from_slice(&other.counts);
        self.edited = Utc::now();
        Ok(())
    }

    /// Write the atlas (samples, maps and provenance) to a container file.
    pub fn save(&self, path: &Utf8Path) -> Result<(), XmatchError> {
        container::write_atlas(self, path)
    }

    /// Load an atlas from a container file.
    pub fn load(path: &Utf8Path) -> Result<Atlas, XmatchError> {
        container::read_atlas(path)
    }
}
