//! End-to-end atlas pipeline: sample a reference database, estimate density
//! maps, persist to the container format, and query the reloaded maps.

mod common;

use approx::assert_relative_eq;
use camino::Utf8PathBuf;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use xmatch::atlas::{Atlas, CoordFrame};
use xmatch::constants::{RADEG, SPHERE_SR};
use xmatch::databases::PoolConfig;
use xmatch::estimator::{
    EmptyCellPolicy, EstimationMethod, NeighborConfig, Neighborhood, Weighting,
};
use xmatch::xmatch::Xmatch;

use common::{init_tracing, small_reference_db};

#[test]
fn sampling_to_map_to_container_roundtrip() {
    init_tracing();
    let mut ctx = Xmatch::new(PoolConfig::default());
    ctx.register_database(Arc::new(small_reference_db("SIMBAD")));

    let mut rng = StdRng::seed_from_u64(7);
    let (mut atlas, report) = ctx
        .build_atlas("SIMBAD", 2, CoordFrame::Icrs, 300, 8.0 * RADEG, &mut rng)
        .unwrap();
    assert_eq!(report.requested, 300);
    assert_eq!(report.skipped, 0);
    assert_eq!(atlas.counts().len(), 300);
    assert_eq!(
        atlas.object_types(),
        vec!["G".to_string(), "QSO".to_string()]
    );

    let method = EstimationMethod::MapEstimate {
        empty_cells: EmptyCellPolicy::GlobalMean,
    };
    let map = atlas.build_density_map("G", &method, true).unwrap();
    assert!(map.values().iter().all(|v| v.is_finite() && *v >= 0.0));

    // 36 galaxies over the full sky: the pooled rate is a sane anchor for
    // the per-cell estimates
    let pooled = 36.0 / SPHERE_SR;
    let mean = map.values().iter().sum::<f64>() / map.values().len() as f64;
    assert!(mean > 0.1 * pooled && mean < 10.0 * pooled, "mean {mean}");

    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("simbad.xmat")).unwrap();
    atlas.save(&path).unwrap();

    let loaded = Atlas::load(&path).unwrap();
    assert_eq!(loaded.counts(), atlas.counts());
    let reloaded = loaded.get_map("G").unwrap();
    for (lon, lat) in [(0.0, 0.0), (1.3, 0.7), (4.5, -1.1)] {
        assert_relative_eq!(
            reloaded.value_at(lon, lat).unwrap(),
            map.value_at(lon, lat).unwrap(),
            max_relative = 1e-12
        );
    }
}

#[test]
fn map_estimate_converges_on_a_constant_field() {
    // samples of a constant 5 / sr field; more samples tighten the estimate
    let estimate_with = |n: usize| {
        let mut atlas = Atlas::new(1, CoordFrame::Icrs, "SYNTH").unwrap();
        let r = (0.2f64 / std::f64::consts::PI).sqrt(); // area 0.2 sr
        let mut rng = StdRng::seed_from_u64(99);
        for (lon, lat) in xmatch::databases::uniform_sphere_points(n, &mut rng) {
            // deterministic integer counts with mean λ·A = 1.0
            let count = if atlas.counts().len() % 2 == 0 { 0 } else { 2 };
            atlas.push_sample(lon, lat, r, [("G".to_string(), count)].into());
        }
        let method = EstimationMethod::MapEstimate {
            empty_cells: EmptyCellPolicy::GlobalMean,
        };
        let map = atlas.build_density_map("G", &method, false).unwrap();
        let mean = map.values().iter().sum::<f64>() / map.values().len() as f64;
        (mean - 5.0).abs()
    };

    let coarse = estimate_with(60);
    let fine = estimate_with(2000);
    assert!(fine < 1.0, "fine-sample error {fine}");
    assert!(fine <= coarse + 1e-9, "coarse {coarse} vs fine {fine}");
}

#[test]
fn neighbor_estimate_runs_on_sampled_counts() {
    let mut ctx = Xmatch::new(PoolConfig::default());
    ctx.register_database(Arc::new(small_reference_db("SIMBAD")));
    let mut rng = StdRng::seed_from_u64(13);
    let (mut atlas, _) = ctx
        .build_atlas("SIMBAD", 1, CoordFrame::Icrs, 150, 10.0 * RADEG, &mut rng)
        .unwrap();

    let method = EstimationMethod::Neighbor(NeighborConfig {
        neighborhood: Neighborhood::KNearest {
            candidates: vec![5, 15, 30],
        },
        weighting: Weighting::InverseDistance,
        validation_fraction: 0.25,
        seed: 4,
        max_deviance: None,
    });
    let map = atlas.build_density_map("G", &method, true).unwrap();
    assert_eq!(map.method(), "neighbor");
    assert!(map.values().iter().all(|v| v.is_finite() && *v >= 0.0));
    assert!(map.values().iter().any(|v| *v > 0.0));
}
