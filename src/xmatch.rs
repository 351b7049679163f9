//! # Cross-matching context
//!
//! [`Xmatch`] is the entry point of the crate: it owns the registry of
//! reference databases and the worker-pool settings, and drives the two
//! batch operations that talk to those databases — atlas sampling and
//! catalog cross-matching. Construct one per process and pass it by
//! reference; the core components below it hold no global state.
//!
//! ```no_run
//! use std::sync::Arc;
//! use xmatch::xmatch::Xmatch;
//! use xmatch::databases::{LocalDatabase, PoolConfig};
//!
//! let mut ctx = Xmatch::new(PoolConfig::default());
//! ctx.register_database(Arc::new(LocalDatabase::new("MYDB", vec![])));
//! ```

use std::sync::Arc;

use ahash::AHashMap;
use rand::Rng;
use tracing::info;

use crate::atlas::{Atlas, CoordFrame};
use crate::constants::Radian;
use crate::databases::{run_query_pool, BatchReport, PoolConfig, SourceDatabase};
use crate::healpix::angular_separation;
use crate::reduction::processes::settings_hash;
use crate::store::{CatalogSource, CrossMatchStore, MatchRecord};
use crate::xmatch_errors::XmatchError;

/// Registry of reference databases plus batch-execution settings.
pub struct Xmatch {
    databases: AHashMap<String, Arc<dyn SourceDatabase>>,
    pool: PoolConfig,
}

impl Xmatch {
    pub fn new(pool: PoolConfig) -> Self {
        Xmatch {
            databases: AHashMap::new(),
            pool,
        }
    }

    /// Register a reference database under its own name. Replaces any
    /// previous database of the same name.
    pub fn register_database(&mut self, db: Arc<dyn SourceDatabase>) {
        self.databases.insert(db.name().to_string(), db);
    }

    /// Look up a registered database.
    pub fn database(&self, name: &str) -> Result<&Arc<dyn SourceDatabase>, XmatchError> {
        self.databases
            .get(name)
            .ok_or_else(|| XmatchError::NotFound(format!("reference database {name}")))
    }

    /// Names of the registered databases, sorted.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Build a fresh atlas for one database by random sampling.
    ///
    /// Convenience over [`Atlas::new`] + [`Atlas::add_samples`]; seed `rng`
    /// for reproducible sample positions.
    pub fn build_atlas<R: Rng + ?Sized>(
        &self,
        db_name: &str,
        order: u32,
        frame: CoordFrame,
        n_samples: usize,
        radius: Radian,
        rng: &mut R,
    ) -> Result<(Atlas, BatchReport), XmatchError> {
        let db = self.database(db_name)?;
        let mut atlas = Atlas::new(order, frame, db_name)?;
        let report = atlas.add_samples(db.as_ref(), n_samples, radius, &self.pool, rng);
        Ok((atlas, report))
    }

    /// Cross-match a catalog against registered databases and persist the
    /// result.
    ///
    /// The catalog is copied into the store's `CATALOG` table; every source
    /// is then queried against each named database within `radius`, on the
    /// bounded worker pool, and the candidates land in that database's
    /// `<NAME>_MATCH` table (written by the calling thread only). A failed
    /// query skips the source for that database and is counted in the
    /// returned report.
    ///
    /// Arguments
    /// -----------------
    /// * `catalog`: the input sources.
    /// * `db_names`: registered databases to match against.
    /// * `store`: destination cross-match store.
    /// * `radius`: search radius around each source, radians.
    ///
    /// Return
    /// ----------
    /// * One [`BatchReport`] per database, keyed by database name.
    pub fn cross_match(
        &self,
        catalog: &[CatalogSource],
        db_names: &[&str],
        store: &CrossMatchStore,
        radius: Radian,
    ) -> Result<AHashMap<String, BatchReport>, XmatchError> {
        store.put_catalog(catalog)?;

        let mut reports = AHashMap::new();
        for db_name in db_names {
            let db = self.database(db_name)?;
            let label = format!("matching against {db_name}");
            let (results, report) = run_query_pool(catalog, &self.pool, &label, |source| {
                let rows = db.query_radius(source.lon, source.lat, radius)?;
                let records: Vec<MatchRecord> = rows
                    .into_iter()
                    .map(|row| {
                        MatchRecord::new(
                            source.id.clone(),
                            row.name,
                            row.lon,
                            row.lat,
                            row.object_type,
                            // per-object error, else the database-wide one
                            row.position_error.or(db.position_error()),
                            angular_separation(source.lon, source.lat, row.lon, row.lat),
                        )
                    })
                    .collect();
                Ok((source.id.clone(), records))
            });

            // single writer: candidates from all workers land here
            for (source_id, records) in results {
                store.put_matches(db_name, &source_id, &records)?;
            }
            let hash = settings_hash(&serde_json::json!({
                "radius": radius,
                "sources": catalog.len(),
            }))?;
            store.meta_add(
                &CrossMatchStore::match_table_name(db_name),
                "cross_match",
                &hash,
            )?;
            info!(
                database = *db_name,
                sources = report.requested,
                matched = report.succeeded,
                "cross-match table written"
            );
            reports.insert(db_name.to_string(), report);
        }
        Ok(reports)
    }
}
