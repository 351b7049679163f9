//! # Reference-database collaborators and query batching
//!
//! The core never talks to a specific catalog service. It depends only on
//! the [`SourceDatabase`] contract: a radius query returning typed rows, and
//! a per-type count of objects around a position. Remote adapters (NED,
//! SIMBAD, VizieR, ...) implement this trait outside the crate;
//! [`LocalDatabase`] is the in-memory implementation used for user-supplied
//! tables and for tests.
//!
//! Query batches run on a bounded worker pool ([`PoolConfig`]): workers pull
//! chunks of jobs from a shared cursor, and all results flow through a
//! channel back to the calling thread, which is the **single writer** into
//! whatever persistent structure receives them. A failed query is logged and
//! skipped — never fatal to the batch — and surfaces in the returned
//! [`BatchReport`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tracing::warn;

use crate::constants::{ObjectType, Radian, TypeCounts};
use crate::healpix::angular_separation;
use crate::xmatch_errors::XmatchError;

/// One object row returned by a reference-database query.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SourceRow {
    /// Reference-database object name (stable identifier).
    pub name: String,
    pub lon: Radian,
    pub lat: Radian,
    pub object_type: ObjectType,
    /// Per-object positional error (1σ, radians), when the database reports one.
    pub position_error: Option<Radian>,
}

/// Contract every reference database must satisfy.
///
/// Implementations must be safe to query from several worker threads at once.
pub trait SourceDatabase: Send + Sync {
    /// Short name of the database; also names its `<NAME>_MATCH` store table.
    fn name(&self) -> &str;

    /// The object types this database recognizes. Every [`TypeCounts`] it
    /// produces carries an entry (possibly zero) for each of these.
    fn object_types(&self) -> &[ObjectType];

    /// All objects within `radius` of a position.
    fn query_radius(
        &self,
        lon: Radian,
        lat: Radian,
        radius: Radian,
    ) -> Result<Vec<SourceRow>, XmatchError>;

    /// Per-type object counts within `radius` of a position.
    ///
    /// The default implementation counts the rows of [`query_radius`](Self::query_radius);
    /// adapters with a cheaper server-side count may override it.
    fn count_types(
        &self,
        lon: Radian,
        lat: Radian,
        radius: Radian,
    ) -> Result<TypeCounts, XmatchError> {
        let mut counts: TypeCounts = self
            .object_types()
            .iter()
            .map(|t| (t.clone(), 0u64))
            .collect();
        for row in self.query_radius(lon, lat, radius)? {
            *counts.entry(row.object_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Database-wide astrometric error (1σ, radians), if the service
    /// documents one. Used by the astrometric sub-process when a row carries
    /// no per-object error.
    fn position_error(&self) -> Option<Radian> {
        None
    }
}

/// In-memory reference database built from a user-supplied table.
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    name: String,
    rows: Vec<SourceRow>,
    types: Vec<ObjectType>,
    position_error: Option<Radian>,
}

impl LocalDatabase {
    /// Build a local database from rows. The recognized type list is the
    /// sorted set of types present in the rows.
    pub fn new(name: impl Into<String>, rows: Vec<SourceRow>) -> Self {
        let mut types: Vec<ObjectType> = rows.iter().map(|r| r.object_type.clone()).collect();
        types.sort();
        types.dedup();
        LocalDatabase {
            name: name.into(),
            rows,
            types,
            position_error: None,
        }
    }

    /// Set the database-wide astrometric error (1σ, radians).
    pub fn with_position_error(mut self, sigma: Radian) -> Self {
        self.position_error = Some(sigma);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl SourceDatabase for LocalDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_types(&self) -> &[ObjectType] {
        &self.types
    }

    fn query_radius(
        &self,
        lon: Radian,
        lat: Radian,
        radius: Radian,
    ) -> Result<Vec<SourceRow>, XmatchError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| angular_separation(lon, lat, r.lon, r.lat) <= radius)
            .cloned()
            .collect())
    }

    fn position_error(&self) -> Option<Radian> {
        self.position_error
    }
}

/// Bounded worker-pool settings for query batches.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent query workers.
    pub max_workers: usize,
    /// Number of jobs a worker claims at a time.
    pub chunk_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_workers: 5,
            chunk_size: 5,
        }
    }
}

/// Outcome of a batch of queries: how many were requested, how many
/// succeeded, and how many were skipped after a logged failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub requested: usize,
    pub succeeded: usize,
    pub skipped: usize,
}

/// Run `worker` over every job on the bounded pool.
///
/// Results are drained on the calling thread (single-writer discipline);
/// ordering across workers is not guaranteed. Failed jobs are logged,
/// counted, and skipped.
pub(crate) fn run_query_pool<J, R, F>(
    jobs: &[J],
    pool: &PoolConfig,
    label: &str,
    worker: F,
) -> (Vec<R>, BatchReport)
where
    J: Sync,
    R: Send,
    F: Fn(&J) -> Result<R, XmatchError> + Sync,
{
    let requested = jobs.len();
    let chunk = pool.chunk_size.max(1);
    let workers = pool.max_workers.max(1).min(requested.max(1));

    let bar = ProgressBar::new(requested as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg} |{bar:40}| {pos}/{len}")
            .expect("static progress template"),
    );
    bar.set_message(label.to_string());

    let cursor = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<Result<R, XmatchError>>();

    let (out, skipped) = std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let cursor = &cursor;
            let bar = &bar;
            let worker = &worker;
            scope.spawn(move || loop {
                let start = cursor.fetch_add(chunk, Ordering::Relaxed);
                if start >= jobs.len() {
                    break;
                }
                let end = (start + chunk).min(jobs.len());
                for job in &jobs[start..end] {
                    if tx.send(worker(job)).is_err() {
                        return;
                    }
                    bar.inc(1);
                }
            });
        }
        drop(tx);

        let mut out = Vec::with_capacity(requested);
        let mut skipped = 0usize;
        for msg in rx {
            match msg {
                Ok(value) => out.push(value),
                Err(err) => {
                    warn!(error = %err, "query failed, skipping element");
                    skipped += 1;
                }
            }
        }
        (out, skipped)
    });

    bar.finish_and_clear();
    let report = BatchReport {
        requested,
        succeeded: requested - skipped,
        skipped,
    };
    (out, report)
}

/// Draw `n` independent positions uniformly distributed on the sphere.
///
/// Longitude is uniform in `[0, 2π)`; the sine of the latitude is uniform in
/// `[-1, 1]`, which yields a uniform surface density.
pub fn uniform_sphere_points<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<(Radian, Radian)> {
    (0..n)
        .map(|_| {
            let lon = rng.random_range(0.0..crate::constants::DPI);
            let z: f64 = rng.random_range(-1.0..=1.0);
            (lon, z.asin())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RADEG;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn star(name: &str, lon_deg: f64, lat_deg: f64, otype: &str) -> SourceRow {
        SourceRow {
            name: name.into(),
            lon: lon_deg * RADEG,
            lat: lat_deg * RADEG,
            object_type: otype.into(),
            position_error: None,
        }
    }

    #[test]
    fn local_database_radius_query() {
        let db = LocalDatabase::new(
            "TESTDB",
            vec![
                star("a", 10.0, 0.0, "G"),
                star("b", 10.5, 0.0, "QSO"),
                star("c", 50.0, 20.0, "G"),
            ],
        );
        let hits = db.query_radius(10.0 * RADEG, 0.0, 1.0 * RADEG).unwrap();
        assert_eq!(hits.len(), 2);
        let counts = db.count_types(10.0 * RADEG, 0.0, 1.0 * RADEG).unwrap();
        assert_eq!(counts["G"], 1);
        assert_eq!(counts["QSO"], 1);
        // recognized types always appear, even at zero
        let far = db.count_types(180.0 * RADEG, -60.0 * RADEG, RADEG).unwrap();
        assert_eq!(far["G"], 0);
        assert_eq!(far["QSO"], 0);
    }

    #[test]
    fn pool_tolerates_partial_failure() {
        let jobs: Vec<u32> = (0..40).collect();
        let (out, report) = run_query_pool(
            &jobs,
            &PoolConfig {
                max_workers: 4,
                chunk_size: 3,
            },
            "test",
            |j| {
                if j % 10 == 7 {
                    Err(XmatchError::DatabaseQuery(format!("synthetic failure {j}")))
                } else {
                    Ok(*j)
                }
            },
        );
        assert_eq!(report.requested, 40);
        assert_eq!(report.skipped, 4);
        assert_eq!(report.succeeded, 36);
        assert_eq!(out.len(), 36);
    }

    #[test]
    fn uniform_sphere_points_cover_both_hemispheres() {
        let mut rng = StdRng::seed_from_u64(3);
        let pts = uniform_sphere_points(2000, &mut rng);
        assert_eq!(pts.len(), 2000);
        let north = pts.iter().filter(|(_, lat)| *lat > 0.0).count();
        assert!((700..1300).contains(&north), "north count {north}");
        for (lon, lat) in pts {
            assert!((0.0..crate::constants::DPI).contains(&lon));
            assert!(lat.abs() <= std::f64::consts::FRAC_PI_2);
        }
    }
}
