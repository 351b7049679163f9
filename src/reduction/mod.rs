//! # Match reduction
//!
//! Scores every match candidate in a cross-match store through the enabled
//! sub-processes, aggregates the per-process costs with user weights, and
//! selects one winning candidate per catalog source.
//!
//! Runs are idempotent: each sub-process execution is recorded in the store's
//! META ledger under the md5 hash of its settings, and re-running the same
//! configuration against an unchanged store does nothing unless `force` is
//! set. A scoring failure (for example a missing positional error with no
//! `fill_unknown`) aborts the run before anything is written back.
//!
//! ## See also
//! ------------
//! * [`config`] – the YAML run configuration.
//! * [`processes`] – the individual scoring sub-processes.
//! * [`crate::store`] – the persistent tables the reducer reads and writes.

pub mod config;
pub mod object_type;
pub mod processes;

use ahash::AHashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::atlas::Atlas;
use crate::constants::{CandidateId, Radian, SourceId};
use crate::reduction::config::{DuplicatePolicy, ReductionConfig};
use crate::reduction::processes::{
    settings_hash, AstrometricProcess, ObjectTypeProcess, PoissonProcess, ReductionProcess,
};
use crate::store::{CrossMatchStore, MatchRecord};
use crate::xmatch_errors::XmatchError;

/// Ledger name of the aggregation step.
const AGGREGATE: &str = "aggregate";

/// Canonical identity of a candidate across reference tables.
///
/// Two records denote the same physical candidate when their trimmed,
/// case-folded candidate ids are equal. Reference services are expected to
/// return resolvable object names for this to hold across tables.
pub fn candidate_identity(candidate_id: &str) -> String {
    candidate_id.trim().to_uppercase()
}

/// Outcome of one reduction run against one match table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReductionReport {
    pub processes_run: Vec<String>,
    pub processes_skipped: Vec<String>,
    pub records_scored: usize,
}

/// The winning candidate of one catalog source.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    pub source_id: SourceId,
    pub candidate_id: CandidateId,
    /// Reference database the winning record came from.
    pub database: String,
    pub cost: f64,
    pub separation: Radian,
}

/// Drives scoring and selection for one reduction configuration.
pub struct Reducer<'a> {
    processes: Vec<Box<dyn ReductionProcess + 'a>>,
    weights: Vec<(String, f64)>,
    duplicate_policy: DuplicatePolicy,
    force: bool,
}

impl<'a> Reducer<'a> {
    /// Assemble the enabled sub-processes from a validated configuration.
    ///
    /// The Poisson sub-process needs the density atlas; pass the one loaded
    /// from `io_params.atlas_path` (or built in memory).
    pub fn from_config(
        config: &ReductionConfig,
        atlas: Option<&'a Atlas>,
    ) -> Result<Self, XmatchError> {
        config.validate()?;
        let instrument_error = config
            .instrument_params
            .as_ref()
            .and_then(|p| p.position_error);

        let mut processes: Vec<Box<dyn ReductionProcess + 'a>> = Vec::new();
        let mut weights = Vec::new();
        for name in &config.run_params.processes {
            let process: Box<dyn ReductionProcess + 'a> = match name.as_str() {
                "astrometric" => Box::new(AstrometricProcess::new(
                    config.astrometric_params.clone().unwrap_or_default(),
                    instrument_error,
                )),
                "object_type" => {
                    let params = config.object_params.clone().ok_or_else(|| {
                        XmatchError::Config("object_params is missing".to_string())
                    })?;
                    Box::new(ObjectTypeProcess::new(params))
                }
                "poisson" => {
                    let atlas = atlas.ok_or_else(|| {
                        XmatchError::Config(
                            "poisson sub-process is enabled but no atlas was provided".to_string(),
                        )
                    })?;
                    Box::new(PoissonProcess::new(
                        atlas,
                        config.poisson_params.clone().unwrap_or_default(),
                    ))
                }
                other => {
                    return Err(XmatchError::Config(format!("unknown sub-process {other:?}")))
                }
            };
            weights.push((name.clone(), config.run_params.weights[name]));
            processes.push(process);
        }

        Ok(Reducer {
            processes,
            weights,
            duplicate_policy: config.run_params.duplicate_policy.clone(),
            force: config.run_params.force,
        })
    }

    fn weight_of(&self, name: &str) -> f64 {
        self.weights
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, w)| *w)
            .unwrap_or(0.0)
    }

    fn aggregate_settings(&self) -> serde_json::Value {
        json!({ "weights": self.weights.iter().cloned().collect::<std::collections::BTreeMap<_, _>>() })
    }

    /// Weighted aggregate cost over the enabled sub-processes.
    fn aggregate_cost(&self, record: &MatchRecord) -> Result<f64, XmatchError> {
        let mut num = 0.0;
        let mut den = 0.0;
        for process in &self.processes {
            let name = process.name();
            let cost = record.scores.get(name).ok_or_else(|| {
                XmatchError::NotFound(format!(
                    "score {name} on candidate {} of source {}",
                    record.candidate_id, record.source_id
                ))
            })?;
            let weight = self.weight_of(name);
            num += weight * cost;
            den += weight;
        }
        Ok(num / den)
    }

    /// Score every record of one match table, then write the aggregate cost.
    ///
    /// Sub-processes whose settings hash is already in the META ledger are
    /// skipped (unless `force`); their scores from the earlier run are kept
    /// and enter the aggregate unchanged. Nothing is persisted if any record
    /// fails to score.
    pub fn run(
        &self,
        store: &CrossMatchStore,
        db_name: &str,
    ) -> Result<ReductionReport, XmatchError> {
        let table = CrossMatchStore::match_table_name(db_name);

        let mut pending: Vec<(usize, String)> = Vec::new();
        let mut report = ReductionReport::default();
        for (i, process) in self.processes.iter().enumerate() {
            let hash = settings_hash(&process.settings()?)?;
            if !self.force && store.meta_check(&table, process.name(), &hash)? {
                debug!(table = %table, process = process.name(), "ledger hit, skipping");
                report.processes_skipped.push(process.name().to_string());
            } else {
                report.processes_run.push(process.name().to_string());
                pending.push((i, hash));
            }
        }
        let aggregate_hash = settings_hash(&self.aggregate_settings())?;
        let aggregate_pending =
            self.force || !store.meta_check(&table, AGGREGATE, &aggregate_hash)?;

        if pending.is_empty() && !aggregate_pending {
            report.processes_skipped.push(AGGREGATE.to_string());
            info!(table = %table, "reduction is fully cached, nothing to do");
            return Ok(report);
        }
        report.processes_run.push(AGGREGATE.to_string());

        let sources = store.catalog()?;
        let mut updated: Vec<(SourceId, Vec<MatchRecord>)> = Vec::new();
        for source in &sources {
            let mut records = store.matches_for(db_name, &source.id)?;
            if records.is_empty() {
                continue;
            }
            for record in &mut records {
                for (i, _) in &pending {
                    let process = &self.processes[*i];
                    let cost = process.cost(source, record)?;
                    record.scores.insert(process.name().to_string(), cost);
                }
                record.total_score = Some(self.aggregate_cost(record)?);
                report.records_scored += 1;
            }
            updated.push((source.id.clone(), records));
        }

        // all scoring succeeded, safe to persist
        for (source_id, records) in &updated {
            store.put_matches(db_name, source_id, records)?;
        }
        for (i, hash) in &pending {
            store.meta_add(&table, self.processes[*i].name(), hash)?;
        }
        store.meta_add(&table, AGGREGATE, &aggregate_hash)?;
        info!(
            table = %table,
            run = ?report.processes_run,
            records = report.records_scored,
            "reduction run complete"
        );
        Ok(report)
    }

    /// Select the winning candidate of every source across the given
    /// reference tables.
    ///
    /// Duplicates of the same physical candidate (see [`candidate_identity`])
    /// reached through different tables are merged by the configured
    /// [`DuplicatePolicy`] first; the winner is then the candidate with the
    /// lowest aggregate cost, ties broken by smallest separation, then by
    /// candidate id.
    pub fn best_matches(
        &self,
        store: &CrossMatchStore,
        db_names: &[&str],
    ) -> Result<Vec<BestMatch>, XmatchError> {
        let mut per_source: AHashMap<SourceId, Vec<(String, MatchRecord)>> = AHashMap::new();
        for db_name in db_names {
            for record in store.all_matches(db_name)? {
                per_source
                    .entry(record.source_id.clone())
                    .or_default()
                    .push((db_name.to_string(), record));
            }
        }

        let mut best: Vec<BestMatch> = Vec::new();
        for (source_id, candidates) in per_source {
            let merged = self.merge_duplicates(candidates);
            let winner = merged.into_iter().min_by(|(_, a), (_, b)| {
                rank(a)
                    .partial_cmp(&rank(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.candidate_id.cmp(&b.candidate_id))
            });
            if let Some((database, record)) = winner {
                // merge_duplicates only keeps scored records
                let cost = record.total_score.unwrap_or(f64::INFINITY);
                best.push(BestMatch {
                    source_id,
                    candidate_id: record.candidate_id,
                    database,
                    cost,
                    separation: record.separation,
                });
            }
        }
        best.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(best)
    }

    fn merge_duplicates(
        &self,
        candidates: Vec<(String, MatchRecord)>,
    ) -> Vec<(String, MatchRecord)> {
        let mut groups: AHashMap<String, Vec<(String, MatchRecord)>> = AHashMap::new();
        for (db, record) in candidates {
            if record.total_score.is_none() {
                warn!(
                    candidate = %record.candidate_id,
                    source = %record.source_id,
                    "unscored record ignored during selection"
                );
                continue;
            }
            groups
                .entry(candidate_identity(&record.candidate_id))
                .or_default()
                .push((db, record));
        }

        let mut merged = Vec::new();
        for (_, mut group) in groups {
            match &self.duplicate_policy {
                DuplicatePolicy::Min => {
                    if let Some(entry) = take_extreme(group, false) {
                        merged.push(entry);
                    }
                }
                DuplicatePolicy::Max => {
                    if let Some(entry) = take_extreme(group, true) {
                        merged.push(entry);
                    }
                }
                DuplicatePolicy::Average => {
                    let mean = group
                        .iter()
                        .filter_map(|(_, r)| r.total_score)
                        .sum::<f64>()
                        / group.len() as f64;
                    if let Some((db, mut record)) = take_extreme(group, false) {
                        record.total_score = Some(mean);
                        merged.push((db, record));
                    }
                }
                DuplicatePolicy::FixedTable(table) => {
                    group.retain(|(db, _)| db == table);
                    if let Some(entry) = take_extreme(group, false) {
                        merged.push(entry);
                    }
                }
            }
        }
        merged
    }
}

fn rank(record: &MatchRecord) -> (f64, f64) {
    (
        record.total_score.unwrap_or(f64::INFINITY),
        record.separation,
    )
}

/// Lowest-cost entry of a duplicate group (highest when `max` is set);
/// cost ties fall back to separation, then candidate id.
fn take_extreme(
    group: Vec<(String, MatchRecord)>,
    max: bool,
) -> Option<(String, MatchRecord)> {
    group.into_iter().min_by(|(_, a), (_, b)| {
        let cost = rank(a)
            .0
            .partial_cmp(&rank(b).0)
            .unwrap_or(std::cmp::Ordering::Equal);
        let cost = if max { cost.reverse() } else { cost };
        cost.then(
            a.separation
                .partial_cmp(&b.separation)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
        .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::config::{DuplicatePolicy, ReductionConfig};
    use approx::assert_relative_eq;

    fn scored(candidate: &str, total: f64, separation: Radian) -> MatchRecord {
        let mut record = MatchRecord::new("s1", candidate, 0.0, 0.0, "G", None, separation);
        record.total_score = Some(total);
        record
    }

    fn reducer(policy: DuplicatePolicy) -> Reducer<'static> {
        let yaml = r#"
run_params:
  processes: [astrometric]
  weights: {astrometric: 1.0}
io_params:
  store_path: unused.redb
astrometric_params:
  fill_unknown: 0.5
"#;
        let mut config = ReductionConfig::from_yaml_str(yaml).unwrap();
        config.run_params.duplicate_policy = policy;
        Reducer::from_config(&config, None).unwrap()
    }

    #[test]
    fn identity_is_trimmed_and_case_folded() {
        assert_eq!(candidate_identity(" ngc 1275 "), "NGC 1275");
        assert_eq!(candidate_identity("NGC 1275"), "NGC 1275");
        assert_ne!(candidate_identity("NGC 1275"), candidate_identity("NGC 1276"));
    }

    #[test]
    fn duplicate_policies_merge_as_specified() {
        let dupes = vec![
            ("SIMBAD".to_string(), scored("NGC 1275", 0.2, 1e-6)),
            ("NED".to_string(), scored("ngc 1275", 0.6, 2e-6)),
        ];

        let min = reducer(DuplicatePolicy::Min).merge_duplicates(dupes.clone());
        assert_eq!(min.len(), 1);
        assert_relative_eq!(min[0].1.total_score.unwrap(), 0.2);

        let max = reducer(DuplicatePolicy::Max).merge_duplicates(dupes.clone());
        assert_relative_eq!(max[0].1.total_score.unwrap(), 0.6);

        let avg = reducer(DuplicatePolicy::Average).merge_duplicates(dupes.clone());
        assert_relative_eq!(avg[0].1.total_score.unwrap(), 0.4);

        // fixed-table precedence ignores every other table's values
        let fixed = reducer(DuplicatePolicy::FixedTable("NED".to_string()))
            .merge_duplicates(dupes.clone());
        assert_eq!(fixed.len(), 1);
        assert_eq!(fixed[0].0, "NED");
        assert_relative_eq!(fixed[0].1.total_score.unwrap(), 0.6);

        // max of two identical costs is that cost
        let same = vec![
            ("SIMBAD".to_string(), scored("NGC 1275", 0.3, 1e-6)),
            ("NED".to_string(), scored("NGC 1275", 0.3, 2e-6)),
        ];
        let max_same = reducer(DuplicatePolicy::Max).merge_duplicates(same);
        assert_relative_eq!(max_same[0].1.total_score.unwrap(), 0.3);
    }

    #[test]
    fn fixed_table_drops_candidates_absent_from_it() {
        let only_other = vec![("SIMBAD".to_string(), scored("NGC 1275", 0.1, 1e-6))];
        let fixed = reducer(DuplicatePolicy::FixedTable("NED".to_string()))
            .merge_duplicates(only_other);
        assert!(fixed.is_empty());
    }

    #[test]
    fn selection_breaks_ties_deterministically() {
        let r = reducer(DuplicatePolicy::Min);
        // same cost, same separation: candidate id decides
        let candidates = vec![
            ("SIMBAD".to_string(), scored("B", 0.3, 1e-6)),
            ("SIMBAD".to_string(), scored("A", 0.3, 1e-6)),
            ("SIMBAD".to_string(), scored("C", 0.3, 5e-7)),
        ];
        let merged = r.merge_duplicates(candidates);
        let winner = merged
            .into_iter()
            .min_by(|(_, a), (_, b)| {
                rank(a)
                    .partial_cmp(&rank(b))
                    .unwrap()
                    .then_with(|| a.candidate_id.cmp(&b.candidate_id))
            })
            .unwrap();
        // smaller separation wins the cost tie
        assert_eq!(winner.1.candidate_id, "C");
    }
}
