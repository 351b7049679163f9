use camino::Utf8PathBuf;
use xmatch::constants::RADEG;
use xmatch::databases::{LocalDatabase, SourceRow};
use xmatch::store::{CatalogSource, CrossMatchStore};

/// Route crate logs through the test harness, honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A temporary cross-match store; keep the directory alive for the test.
pub fn temp_store() -> (tempfile::TempDir, CrossMatchStore) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("session.redb")).unwrap();
    let store = CrossMatchStore::open(&path).unwrap();
    (dir, store)
}

pub fn reference_row(name: &str, lon_deg: f64, lat_deg: f64, otype: &str) -> SourceRow {
    SourceRow {
        name: name.into(),
        lon: lon_deg * RADEG,
        lat: lat_deg * RADEG,
        object_type: otype.into(),
        position_error: None,
    }
}

pub fn catalog_source(id: &str, lon_deg: f64, lat_deg: f64) -> CatalogSource {
    CatalogSource {
        id: id.into(),
        lon: lon_deg * RADEG,
        lat: lat_deg * RADEG,
        object_type: None,
        position_error: None,
    }
}

/// A small all-sky reference database with galaxies on a longitude ring and
/// one quasar.
pub fn small_reference_db(name: &str) -> LocalDatabase {
    let mut rows: Vec<SourceRow> = (0..36)
        .map(|i| reference_row(&format!("GAL {i}"), i as f64 * 10.0, 0.0, "G"))
        .collect();
    rows.push(reference_row("QSO 1", 10.05, 0.02, "QSO"));
    LocalDatabase::new(name, rows)
}
