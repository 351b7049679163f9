//! Reduction run configuration.
//!
//! A run is described by a YAML document with two required sections,
//! `run_params` (which sub-processes run, their weights, the duplicate
//! policy) and `io_params` (paths), plus one optional parameter section per
//! sub-process. Everything is validated at load time; a malformed document
//! never reaches the scoring code.
//!
//! ```yaml
//! run_params:
//!   processes: [astrometric, object_type, poisson]
//!   weights: {astrometric: 1.0, object_type: 0.5, poisson: 2.0}
//!   duplicate_policy: min
//!   force: false
//! io_params:
//!   store_path: session.redb
//!   atlas_path: simbad.xmat
//! astrometric_params:
//!   fill_unknown: 0.5
//! object_params:
//!   hierarchy: {Sy1: [AGN], AGN: [G]}
//!   costs: {G: 0.0, QSO: 0.3}
//!   default_cost: 1.0
//! poisson_params:
//!   fill_unknown: 0.8
//! instrument_params:
//!   position_error: 4.8e-6
//! ```

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::constants::{ObjectType, Radian};
use crate::xmatch_errors::XmatchError;

/// Names of the known sub-processes, in canonical run order.
pub const PROCESS_NAMES: [&str; 3] = ["astrometric", "object_type", "poisson"];

/// How the same physical candidate reached through several reference tables
/// is merged before final selection.
///
/// In YAML this is either a plain name (`min`, `max`, `average`) or the map
/// form `{fixed_table: NAME}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DuplicatePolicyRepr", into = "DuplicatePolicyRepr")]
pub enum DuplicatePolicy {
    /// Keep the duplicate with the lowest aggregate cost.
    Min,
    /// Keep the duplicate with the highest aggregate cost.
    Max,
    /// Average the aggregate costs of the duplicates.
    Average,
    /// Only the named reference table counts; duplicates seen through any
    /// other table are discarded outright.
    FixedTable(String),
}

/// Wire form of [`DuplicatePolicy`]: a bare policy name or a
/// `{fixed_table: NAME}` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DuplicatePolicyRepr {
    Name(String),
    FixedTable { fixed_table: String },
}

impl TryFrom<DuplicatePolicyRepr> for DuplicatePolicy {
    type Error = String;

    fn try_from(repr: DuplicatePolicyRepr) -> Result<Self, Self::Error> {
        match repr {
            DuplicatePolicyRepr::Name(name) => match name.as_str() {
                "min" => Ok(DuplicatePolicy::Min),
                "max" => Ok(DuplicatePolicy::Max),
                "average" => Ok(DuplicatePolicy::Average),
                other => Err(format!(
                    "unknown duplicate policy {other:?} (expected min, max, average \
                     or {{fixed_table: NAME}})"
                )),
            },
            DuplicatePolicyRepr::FixedTable { fixed_table } => {
                Ok(DuplicatePolicy::FixedTable(fixed_table))
            }
        }
    }
}

impl From<DuplicatePolicy> for DuplicatePolicyRepr {
    fn from(policy: DuplicatePolicy) -> Self {
        match policy {
            DuplicatePolicy::Min => DuplicatePolicyRepr::Name("min".to_string()),
            DuplicatePolicy::Max => DuplicatePolicyRepr::Name("max".to_string()),
            DuplicatePolicy::Average => DuplicatePolicyRepr::Name("average".to_string()),
            DuplicatePolicy::FixedTable(fixed_table) => {
                DuplicatePolicyRepr::FixedTable { fixed_table }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Enabled sub-processes, executed in listed order.
    pub processes: Vec<String>,
    /// Aggregation weight per enabled sub-process.
    pub weights: BTreeMap<String, f64>,
    #[serde(default = "default_duplicate_policy")]
    pub duplicate_policy: DuplicatePolicy,
    /// Re-run processes even when the ledger says they already ran.
    #[serde(default)]
    pub force: bool,
}

fn default_duplicate_policy() -> DuplicatePolicy {
    DuplicatePolicy::Min
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoParams {
    pub store_path: Utf8PathBuf,
    /// Atlas container backing the Poisson sub-process.
    #[serde(default)]
    pub atlas_path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AstrometricParams {
    /// Cost assigned when no positional error is known for a pair. When
    /// unset, such a pair is a [`XmatchError::MissingError`].
    #[serde(default)]
    pub fill_unknown: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectParams {
    /// Object-type DAG: type → parent types.
    #[serde(default)]
    pub hierarchy: BTreeMap<ObjectType, Vec<ObjectType>>,
    /// Explicit per-type costs; unlisted types inherit from the nearest
    /// listed ancestor.
    pub costs: BTreeMap<ObjectType, f64>,
    /// Cost when neither the type nor any ancestor is listed.
    pub default_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoissonParams {
    /// Cost assigned when no density map exists for a candidate's type.
    /// When unset, such a candidate is a [`XmatchError::NotFound`].
    #[serde(default)]
    pub fill_unknown: Option<f64>,
}

/// Catalog-wide instrument characteristics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstrumentParams {
    /// Instrument positional error (1σ, radians), used for catalog sources
    /// that carry no per-source error.
    #[serde(default)]
    pub position_error: Option<Radian>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionConfig {
    pub run_params: RunParams,
    pub io_params: IoParams,
    #[serde(default)]
    pub astrometric_params: Option<AstrometricParams>,
    #[serde(default)]
    pub object_params: Option<ObjectParams>,
    #[serde(default)]
    pub poisson_params: Option<PoissonParams>,
    #[serde(default)]
    pub instrument_params: Option<InstrumentParams>,
}

impl ReductionConfig {
    /// Parse and validate a YAML configuration document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, XmatchError> {
        let config: ReductionConfig = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a YAML configuration file.
    pub fn from_yaml_file(path: &Utf8Path) -> Result<Self, XmatchError> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    /// Reject malformed configurations before any computation starts.
    pub fn validate(&self) -> Result<(), XmatchError> {
        let run = &self.run_params;
        if run.processes.is_empty() {
            return Err(XmatchError::Config(
                "run_params.processes must enable at least one sub-process".to_string(),
            ));
        }
        for name in &run.processes {
            if !PROCESS_NAMES.contains(&name.as_str()) {
                return Err(XmatchError::Config(format!(
                    "unknown sub-process {name:?} (known: {PROCESS_NAMES:?})"
                )));
            }
            if run.processes.iter().filter(|p| *p == name).count() > 1 {
                return Err(XmatchError::Config(format!(
                    "sub-process {name:?} is listed more than once"
                )));
            }
        }

        let mut weight_sum = 0.0;
        for name in &run.processes {
            let weight = run.weights.get(name).ok_or_else(|| {
                XmatchError::Config(format!("no weight configured for sub-process {name:?}"))
            })?;
            if !weight.is_finite() || *weight < 0.0 {
                return Err(XmatchError::Config(format!(
                    "weight of sub-process {name:?} must be finite and non-negative, got {weight}"
                )));
            }
            weight_sum += weight;
        }
        if weight_sum <= 0.0 {
            return Err(XmatchError::Config(
                "enabled sub-process weights sum to zero".to_string(),
            ));
        }

        if let Some(astro) = &self.astrometric_params {
            validate_unit_interval("astrometric_params.fill_unknown", astro.fill_unknown)?;
        }
        if let Some(poisson) = &self.poisson_params {
            validate_unit_interval("poisson_params.fill_unknown", poisson.fill_unknown)?;
        }
        if let Some(object) = &self.object_params {
            for (otype, cost) in &object.costs {
                validate_unit_interval(&format!("object_params.costs[{otype}]"), Some(*cost))?;
            }
            validate_unit_interval("object_params.default_cost", Some(object.default_cost))?;
        }
        if run.processes.iter().any(|p| p == "object_type") && self.object_params.is_none() {
            return Err(XmatchError::Config(
                "object_type sub-process is enabled but object_params is missing".to_string(),
            ));
        }
        if let Some(instrument) = &self.instrument_params {
            if let Some(sigma) = instrument.position_error {
                if !sigma.is_finite() || sigma < 0.0 {
                    return Err(XmatchError::Config(format!(
                        "instrument_params.position_error must be finite and non-negative, got {sigma}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_unit_interval(field: &str, value: Option<f64>) -> Result<(), XmatchError> {
    if let Some(v) = value {
        if !v.is_finite() || !(0.0..=1.0).contains(&v) {
            return Err(XmatchError::Config(format!(
                "{field} must lie in [0, 1], got {v}"
            )));
        }
    }
    Ok(())
}
