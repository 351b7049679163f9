//! # Cross-match store
//!
//! Embedded, transactional persistence for a cross-matching session, backed
//! by a single `redb` file. Three kinds of tables live inside:
//!
//! * `CATALOG` – the input catalog sources, keyed by source id;
//! * `<DB>_MATCH` – one table per reference database, keyed by source id,
//!   holding every match candidate found for that source together with its
//!   per-process scores;
//! * `META` – the reduction ledger: one entry per (table, process, settings
//!   hash) that has already run, so re-running the same configuration is a
//!   no-op unless forced.
//!
//! All writes go through short-lived write transactions opened by the single
//! writer thread; readers see a consistent snapshot.

use std::collections::BTreeMap;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, TableError, TableHandle};
use serde::{Deserialize, Serialize};

use crate::constants::{CandidateId, ObjectType, Radian, SourceId};
use crate::xmatch_errors::XmatchError;

const CATALOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("CATALOG");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("META");

const MATCH_SUFFIX: &str = "_MATCH";
/// Separator of the composite META key, never part of a name or hash.
const KEY_SEP: char = '\u{1f}';

/// One source of the input catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSource {
    pub id: SourceId,
    pub lon: Radian,
    pub lat: Radian,
    /// Catalog-declared object type, when the catalog has one.
    pub object_type: Option<ObjectType>,
    /// Per-source positional error (1σ, radians), when known.
    pub position_error: Option<Radian>,
}

/// One match candidate for one catalog source, with its reduction scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub source_id: SourceId,
    pub candidate_id: CandidateId,
    pub candidate_lon: Radian,
    pub candidate_lat: Radian,
    pub candidate_type: ObjectType,
    pub candidate_position_error: Option<Radian>,
    /// Angular separation between source and candidate, radians.
    pub separation: Radian,
    /// Per-process cost in `[0, 1]`, keyed by process name.
    pub scores: BTreeMap<String, f64>,
    /// Weighted aggregate of the scores, set by the reduction run.
    pub total_score: Option<f64>,
}

impl MatchRecord {
    pub fn new(
        source_id: impl Into<SourceId>,
        candidate_id: impl Into<CandidateId>,
        candidate_lon: Radian,
        candidate_lat: Radian,
        candidate_type: impl Into<ObjectType>,
        candidate_position_error: Option<Radian>,
        separation: Radian,
    ) -> Self {
        MatchRecord {
            source_id: source_id.into(),
            candidate_id: candidate_id.into(),
            candidate_lon,
            candidate_lat,
            candidate_type: candidate_type.into(),
            candidate_position_error,
            separation,
            scores: BTreeMap::new(),
            total_score: None,
        }
    }
}

/// Ledger entry proving a process already ran with a given configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub table: String,
    pub process: String,
    pub settings_hash: String,
    pub run_at: DateTime<Utc>,
}

/// Handle on the cross-match database file.
pub struct CrossMatchStore {
    db: Database,
}

impl CrossMatchStore {
    /// Open the store at `path`, creating the file if needed.
    pub fn open(path: &Utf8Path) -> Result<Self, XmatchError> {
        Ok(CrossMatchStore {
            db: Database::create(path)?,
        })
    }

    /// Name of the match table of a reference database.
    pub fn match_table_name(db_name: &str) -> String {
        format!("{db_name}{MATCH_SUFFIX}")
    }

    /// Insert (or replace) catalog sources.
    pub fn put_catalog(&self, sources: &[CatalogSource]) -> Result<(), XmatchError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CATALOG_TABLE)?;
            for source in sources {
                let bytes = bincode::serialize(source)?;
                table.insert(source.id.as_str(), bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Every catalog source, in key order.
    pub fn catalog(&self) -> Result<Vec<CatalogSource>, XmatchError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(CATALOG_TABLE) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            out.push(bincode::deserialize(value.value())?);
        }
        Ok(out)
    }

    /// Fetch one catalog source by id.
    pub fn get_source(&self, id: &str) -> Result<CatalogSource, XmatchError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(CATALOG_TABLE) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(XmatchError::NotFound(format!("catalog source {id}")))
            }
            Err(e) => return Err(e.into()),
        };
        match table.get(id)? {
            Some(value) => Ok(bincode::deserialize(value.value())?),
            None => Err(XmatchError::NotFound(format!("catalog source {id}"))),
        }
    }

    /// Replace the candidate list of one source in a match table.
    pub fn put_matches(
        &self,
        db_name: &str,
        source_id: &str,
        records: &[MatchRecord],
    ) -> Result<(), XmatchError> {
        let name = Self::match_table_name(db_name);
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&name);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(def)?;
            let bytes = bincode::serialize(&records)?;
            table.insert(source_id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Candidate list of one source; empty when the source was never matched.
    pub fn matches_for(
        &self,
        db_name: &str,
        source_id: &str,
    ) -> Result<Vec<MatchRecord>, XmatchError> {
        let name = Self::match_table_name(db_name);
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&name);
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(def) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match table.get(source_id)? {
            Some(value) => Ok(bincode::deserialize(value.value())?),
            None => Ok(Vec::new()),
        }
    }

    /// Every match record of a database table, grouped by source in key order.
    pub fn all_matches(&self, db_name: &str) -> Result<Vec<MatchRecord>, XmatchError> {
        let name = Self::match_table_name(db_name);
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&name);
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(def) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            let mut records: Vec<MatchRecord> = bincode::deserialize(value.value())?;
            out.append(&mut records);
        }
        Ok(out)
    }

    /// Rewrite every record of a match table through `update`, in one write
    /// transaction. Bulk maintenance entry point for callers patching stored
    /// records in place; the reduction pipeline itself replaces records
    /// wholesale via [`CrossMatchStore::put_matches`].
    pub fn update_matches<F>(&self, db_name: &str, mut update: F) -> Result<(), XmatchError>
    where
        F: FnMut(&mut MatchRecord),
    {
        let name = Self::match_table_name(db_name);
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&name);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(def)?;
            let keys: Vec<String> = table
                .iter()?
                .map(|row| row.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                let mut records: Vec<MatchRecord> = match table.get(key.as_str())? {
                    Some(value) => bincode::deserialize(value.value())?,
                    None => continue,
                };
                for record in &mut records {
                    update(record);
                }
                let bytes = bincode::serialize(&records)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Names of the reference databases with a match table in this store.
    pub fn match_databases(&self) -> Result<Vec<String>, XmatchError> {
        let txn = self.db.begin_read()?;
        let mut out: Vec<String> = txn
            .list_tables()?
            .filter_map(|handle| {
                handle
                    .name()
                    .strip_suffix(MATCH_SUFFIX)
                    .map(|s| s.to_string())
            })
            .collect();
        out.sort();
        Ok(out)
    }

    /// Delete the match table of one reference database, if present.
    pub fn drop_matches(&self, db_name: &str) -> Result<(), XmatchError> {
        let name = Self::match_table_name(db_name);
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&name);
        let txn = self.db.begin_write()?;
        match txn.delete_table(def) {
            Ok(_) => {}
            Err(TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }
        txn.commit()?;
        Ok(())
    }

    fn meta_key(table: &str, process: &str, settings_hash: &str) -> String {
        format!("{table}{KEY_SEP}{process}{KEY_SEP}{settings_hash}")
    }

    /// Has this (table, process, settings) combination already run?
    pub fn meta_check(
        &self,
        table: &str,
        process: &str,
        settings_hash: &str,
    ) -> Result<bool, XmatchError> {
        let txn = self.db.begin_read()?;
        let meta = match txn.open_table(META_TABLE) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(meta
            .get(Self::meta_key(table, process, settings_hash).as_str())?
            .is_some())
    }

    /// Record a completed run in the ledger.
    pub fn meta_add(
        &self,
        table: &str,
        process: &str,
        settings_hash: &str,
    ) -> Result<(), XmatchError> {
        let entry = MetaEntry {
            table: table.to_string(),
            process: process.to_string(),
            settings_hash: settings_hash.to_string(),
            run_at: Utc::now(),
        };
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META_TABLE)?;
            let bytes = bincode::serialize(&entry)?;
            meta.insert(
                Self::meta_key(table, process, settings_hash).as_str(),
                bytes.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Every ledger entry, in key order.
    pub fn meta_entries(&self) -> Result<Vec<MetaEntry>, XmatchError> {
        let txn = self.db.begin_read()?;
        let meta = match txn.open_table(META_TABLE) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for row in meta.iter()? {
            let (_, value) = row?;
            out.push(bincode::deserialize(value.value())?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn temp_store() -> (tempfile::TempDir, CrossMatchStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("store.redb")).unwrap();
        let store = CrossMatchStore::open(&path).unwrap();
        (dir, store)
    }

    fn source(id: &str) -> CatalogSource {
        CatalogSource {
            id: id.into(),
            lon: 0.5,
            lat: -0.1,
            object_type: None,
            position_error: Some(1e-6),
        }
    }

    #[test]
    fn catalog_roundtrip() {
        let (_dir, store) = temp_store();
        store.put_catalog(&[source("s1"), source("s2")]).unwrap();
        let all = store.catalog().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.get_source("s2").unwrap().id, "s2");
        assert!(matches!(
            store.get_source("missing"),
            Err(XmatchError::NotFound(_))
        ));
    }

    #[test]
    fn match_tables_are_per_database() {
        let (_dir, store) = temp_store();
        let rec = MatchRecord::new("s1", "NGC 1275", 0.5, -0.1, "G", None, 2e-6);
        store.put_matches("SIMBAD", "s1", &[rec.clone()]).unwrap();
        store.put_matches("NED", "s1", &[rec]).unwrap();

        assert_eq!(store.matches_for("SIMBAD", "s1").unwrap().len(), 1);
        assert_eq!(store.matches_for("SIMBAD", "other").unwrap().len(), 0);
        assert_eq!(store.matches_for("UNKNOWN", "s1").unwrap().len(), 0);
        assert_eq!(
            store.match_databases().unwrap(),
            vec!["NED".to_string(), "SIMBAD".to_string()]
        );

        store.drop_matches("NED").unwrap();
        assert_eq!(store.match_databases().unwrap(), vec!["SIMBAD".to_string()]);
    }

    #[test]
    fn update_matches_rewrites_scores() {
        let (_dir, store) = temp_store();
        let rec = MatchRecord::new("s1", "c1", 0.5, -0.1, "G", None, 2e-6);
        store.put_matches("SIMBAD", "s1", &[rec]).unwrap();

        store
            .update_matches("SIMBAD", |r| {
                r.scores.insert("astrometric".to_string(), 0.25);
            })
            .unwrap();
        let records = store.matches_for("SIMBAD", "s1").unwrap();
        assert_eq!(records[0].scores["astrometric"], 0.25);
    }

    #[test]
    fn meta_ledger_gates_reruns() {
        let (_dir, store) = temp_store();
        assert!(!store.meta_check("SIMBAD_MATCH", "astrometric", "abc").unwrap());
        store.meta_add("SIMBAD_MATCH", "astrometric", "abc").unwrap();
        assert!(store.meta_check("SIMBAD_MATCH", "astrometric", "abc").unwrap());
        // a different settings hash is a different run
        assert!(!store.meta_check("SIMBAD_MATCH", "astrometric", "def").unwrap());
        assert_eq!(store.meta_entries().unwrap().len(), 1);
    }
}
