//! Scoring sub-processes.
//!
//! Each sub-process turns one (catalog source, match candidate) pair into a
//! cost in `[0, 1]`, 0 being a certain match. A process also exposes its
//! settings as canonical JSON; the md5 digest of that document keys the META
//! ledger, so two runs with identical settings hash identically.

use serde::Serialize;
use serde_json::json;

use crate::atlas::Atlas;
use crate::constants::Radian;
use crate::reduction::config::{AstrometricParams, ObjectParams, PoissonParams};
use crate::reduction::object_type::TypeHierarchy;
use crate::store::{CatalogSource, MatchRecord};
use crate::xmatch_errors::XmatchError;

/// One scoring sub-process.
pub trait ReductionProcess {
    /// Stable process name, used for score keys, weights and the ledger.
    fn name(&self) -> &'static str;

    /// Canonical JSON rendering of the process settings.
    fn settings(&self) -> Result<serde_json::Value, XmatchError>;

    /// Cost of one candidate for one source, in `[0, 1]`.
    fn cost(&self, source: &CatalogSource, record: &MatchRecord) -> Result<f64, XmatchError>;
}

/// md5 digest of a canonical JSON settings document.
///
/// JSON object keys serialize in sorted order, so structurally equal
/// settings always hash to the same digest.
pub fn settings_hash(settings: &serde_json::Value) -> Result<String, XmatchError> {
    let canonical = serde_json::to_string(settings)?;
    Ok(format!("{:x}", md5::compute(canonical.as_bytes())))
}

/// Astrometric separation cost.
///
/// With a combined positional error `σ` (catalog ⊕ database, quadrature when
/// both are known) and separation `δ`, the cost is `1 − exp(−δ²/2σ²)`: the
/// complement of the normalized Gaussian density of the observed separation.
#[derive(Debug, Clone, Serialize)]
pub struct AstrometricProcess {
    params: AstrometricParams,
    /// Catalog-wide positional error applied to sources without one.
    instrument_error: Option<Radian>,
}

impl AstrometricProcess {
    pub fn new(params: AstrometricParams, instrument_error: Option<Radian>) -> Self {
        AstrometricProcess {
            params,
            instrument_error,
        }
    }

    fn combined_sigma(&self, source: &CatalogSource, record: &MatchRecord) -> Option<Radian> {
        let catalog = source.position_error.or(self.instrument_error);
        let database = record.candidate_position_error;
        match (catalog, database) {
            (Some(a), Some(b)) => Some((a * a + b * b).sqrt()),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

impl ReductionProcess for AstrometricProcess {
    fn name(&self) -> &'static str {
        "astrometric"
    }

    fn settings(&self) -> Result<serde_json::Value, XmatchError> {
        Ok(json!({
            "fill_unknown": self.params.fill_unknown,
            "instrument_error": self.instrument_error,
        }))
    }

    fn cost(&self, source: &CatalogSource, record: &MatchRecord) -> Result<f64, XmatchError> {
        let sigma = match self.combined_sigma(source, record) {
            Some(s) => s,
            None => {
                return self.params.fill_unknown.ok_or_else(|| {
                    XmatchError::MissingError(format!(
                        "{} / {}",
                        source.id, record.candidate_id
                    ))
                })
            }
        };
        if sigma <= 0.0 {
            return Ok(if record.separation > 0.0 { 1.0 } else { 0.0 });
        }
        let delta = record.separation;
        Ok(1.0 - (-delta * delta / (2.0 * sigma * sigma)).exp())
    }
}

/// Object-type compatibility cost, looked up through the type hierarchy.
#[derive(Debug, Clone)]
pub struct ObjectTypeProcess {
    params: ObjectParams,
    hierarchy: TypeHierarchy,
}

impl ObjectTypeProcess {
    pub fn new(params: ObjectParams) -> Self {
        let hierarchy = TypeHierarchy::new(params.hierarchy.clone());
        ObjectTypeProcess { params, hierarchy }
    }
}

impl ReductionProcess for ObjectTypeProcess {
    fn name(&self) -> &'static str {
        "object_type"
    }

    fn settings(&self) -> Result<serde_json::Value, XmatchError> {
        Ok(serde_json::to_value(&self.params)?)
    }

    fn cost(&self, _source: &CatalogSource, record: &MatchRecord) -> Result<f64, XmatchError> {
        Ok(self.hierarchy.cost_of(
            &record.candidate_type,
            &self.params.costs,
            self.params.default_cost,
        ))
    }
}

/// Spurious-match probability cost from the Poisson density atlas.
///
/// With `λ` the local density of objects of the candidate's type at the
/// source position, the probability of at least one spurious object of that
/// type within the separation is `1 − exp(−λ·π·δ²)`.
pub struct PoissonProcess<'a> {
    atlas: &'a Atlas,
    params: PoissonParams,
}

impl<'a> PoissonProcess<'a> {
    pub fn new(atlas: &'a Atlas, params: PoissonParams) -> Self {
        PoissonProcess { atlas, params }
    }
}

impl ReductionProcess for PoissonProcess<'_> {
    fn name(&self) -> &'static str {
        "poisson"
    }

    fn settings(&self) -> Result<serde_json::Value, XmatchError> {
        Ok(json!({
            "fill_unknown": self.params.fill_unknown,
            "atlas_database": self.atlas.database(),
            "atlas_order": self.atlas.grid().order(),
            "atlas_edited": self.atlas.edited().to_rfc3339(),
        }))
    }

    fn cost(&self, source: &CatalogSource, record: &MatchRecord) -> Result<f64, XmatchError> {
        let lambda = match self.atlas.get_map(&record.candidate_type) {
            Ok(map) => map.value_at(source.lon, source.lat)?,
            Err(_) => match self.params.fill_unknown {
                Some(cost) => return Ok(cost),
                None => {
                    return Err(XmatchError::NotFound(format!(
                        "density map for type {} (atlas {})",
                        record.candidate_type,
                        self.atlas.database()
                    )))
                }
            },
        };
        let delta = record.separation;
        Ok(1.0 - (-lambda * std::f64::consts::PI * delta * delta).exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::CoordFrame;
    use crate::constants::RADSEC;
    use crate::estimator::{EmptyCellPolicy, EstimationMethod};
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn source(position_error: Option<Radian>) -> CatalogSource {
        CatalogSource {
            id: "s1".into(),
            lon: 1.0,
            lat: 0.2,
            object_type: None,
            position_error,
        }
    }

    fn record(separation: Radian, db_error: Option<Radian>) -> MatchRecord {
        MatchRecord::new("s1", "c1", 1.0, 0.2, "G", db_error, separation)
    }

    #[test]
    fn astrometric_cost_follows_the_gaussian() {
        let process = AstrometricProcess::new(AstrometricParams::default(), None);
        let sigma = 2.0 * RADSEC;
        // errors combine in quadrature: 3-4-5 triangle
        let s = source(Some(3.0 * RADSEC));
        let r = record(5.0 * RADSEC, Some(4.0 * RADSEC));
        let expected = 1.0 - (-25.0_f64 / (2.0 * 25.0)).exp();
        assert_relative_eq!(process.cost(&s, &r).unwrap(), expected, max_relative = 1e-12);

        // zero separation is a perfect match
        let r0 = record(0.0, Some(sigma));
        assert_relative_eq!(process.cost(&source(None), &r0).unwrap(), 0.0);
    }

    #[test]
    fn astrometric_missing_error_handling() {
        let strict = AstrometricProcess::new(AstrometricParams::default(), None);
        assert!(matches!(
            strict.cost(&source(None), &record(1.0 * RADSEC, None)),
            Err(XmatchError::MissingError(_))
        ));

        let filled = AstrometricProcess::new(
            AstrometricParams {
                fill_unknown: Some(0.5),
            },
            None,
        );
        assert_relative_eq!(
            filled.cost(&source(None), &record(1.0 * RADSEC, None)).unwrap(),
            0.5
        );

        // the instrument-wide error rescues sources without their own
        let instrument = AstrometricProcess::new(AstrometricParams::default(), Some(2.0 * RADSEC));
        assert!(instrument.cost(&source(None), &record(1.0 * RADSEC, None)).is_ok());
    }

    #[test]
    fn object_type_cost_walks_the_hierarchy() {
        let mut hierarchy = BTreeMap::new();
        hierarchy.insert("Sy1".to_string(), vec!["AGN".to_string()]);
        let mut costs = BTreeMap::new();
        costs.insert("AGN".to_string(), 0.25);
        let process = ObjectTypeProcess::new(ObjectParams {
            hierarchy,
            costs,
            default_cost: 0.9,
        });

        let mut rec = record(0.0, None);
        rec.candidate_type = "Sy1".into();
        assert_relative_eq!(process.cost(&source(None), &rec).unwrap(), 0.25);
        rec.candidate_type = "Star".into();
        assert_relative_eq!(process.cost(&source(None), &rec).unwrap(), 0.9);
    }

    #[test]
    fn poisson_cost_is_monotonic_in_separation_and_rate() {
        // uniform density 3 / sr
        let mut atlas = Atlas::new(1, CoordFrame::Icrs, "TESTDB").unwrap();
        let r = (1.0 / std::f64::consts::PI).sqrt();
        let counts: crate::constants::TypeCounts = [("G".to_string(), 3u64)].into();
        atlas.push_sample(0.1, 0.2, r, counts);
        let method = EstimationMethod::MapEstimate {
            empty_cells: EmptyCellPolicy::GlobalMean,
        };
        atlas.build_density_map("G", &method, true).unwrap();

        let process = PoissonProcess::new(&atlas, PoissonParams::default());
        let s = source(None);
        let near = process.cost(&s, &record(0.01, None)).unwrap();
        let far = process.cost(&s, &record(0.1, None)).unwrap();
        assert_relative_eq!(process.cost(&s, &record(0.0, None)).unwrap(), 0.0);
        assert!(near < far);
        assert_relative_eq!(
            near,
            1.0 - (-3.0 * std::f64::consts::PI * 1e-4).exp(),
            max_relative = 1e-12
        );
        // an enormous λ·δ² saturates at certainty of a spurious match
        assert!(process.cost(&s, &record(3.0, None)).unwrap() > 0.99);
    }

    #[test]
    fn poisson_missing_map_handling() {
        let mut atlas = Atlas::new(1, CoordFrame::Icrs, "TESTDB").unwrap();
        let counts: crate::constants::TypeCounts = [("G".to_string(), 3u64)].into();
        atlas.push_sample(0.1, 0.2, 0.5, counts);

        let strict = PoissonProcess::new(&atlas, PoissonParams::default());
        assert!(matches!(
            strict.cost(&source(None), &record(0.01, None)),
            Err(XmatchError::NotFound(_))
        ));

        let filled = PoissonProcess::new(
            &atlas,
            PoissonParams {
                fill_unknown: Some(0.8),
            },
        );
        assert_relative_eq!(
            filled.cost(&source(None), &record(0.01, None)).unwrap(),
            0.8
        );
    }

    #[test]
    fn identical_settings_hash_identically() {
        let a = AstrometricProcess::new(
            AstrometricParams {
                fill_unknown: Some(0.5),
            },
            None,
        );
        let b = AstrometricProcess::new(
            AstrometricParams {
                fill_unknown: Some(0.5),
            },
            None,
        );
        let c = AstrometricProcess::new(AstrometricParams::default(), None);
        let ha = settings_hash(&a.settings().unwrap()).unwrap();
        let hb = settings_hash(&b.settings().unwrap()).unwrap();
        let hc = settings_hash(&c.settings().unwrap()).unwrap();
        assert_eq!(ha, hb);
        assert_ne!(ha, hc);
    }
}
