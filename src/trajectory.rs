//! Fit-trajectory log (spec §4.12): one record per `runFit` call,
//! holding start/end parameters, residuals, the ending reason and a
//! set of free-form user flags. `FitTrajectories` owns the list and
//! implements the housekeeping operations (`keep_best_trajectories`,
//! `trim`, `merge`, flag filtering) plus the line-oriented
//! `[trajectory N]` file format of spec §6.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::errors::TrajectoryFileError;

/// Why a `runFit` call stopped (spec §3/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndingReason {
    Converged,
    Cancelled,
    TimeOut,
    /// A `RuntimeError` (I/O, parse, singular matrix, ...) aborted the run.
    Error,
    /// An `InternalError` (invariant violation) aborted the run.
    Exception,
    /// The Levenberg-Marquardt retry budget was exhausted without an
    /// accepted step.
    ConvergenceError,
}

impl EndingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndingReason::Converged => "Converged",
            EndingReason::Cancelled => "Cancelled",
            EndingReason::TimeOut => "TimeOut",
            EndingReason::Error => "Error",
            EndingReason::Exception => "Exception",
            EndingReason::ConvergenceError => "ConvergenceError",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Converged" => EndingReason::Converged,
            "Cancelled" => EndingReason::Cancelled,
            "TimeOut" => EndingReason::TimeOut,
            "Error" => EndingReason::Error,
            "Exception" => EndingReason::Exception,
            "ConvergenceError" => EndingReason::ConvergenceError,
            _ => return None,
        })
    }
}

/// One fit run's full record (spec §4.12). Timestamps are Unix
/// seconds, supplied by the caller (this crate never reads the clock
/// itself, so the same run is reproducible in tests).
#[derive(Debug, Clone)]
pub struct FitTrajectory {
    pub start_time: i64,
    pub end_time: i64,
    pub engine_name: String,
    pub initial_parameters: Vec<f64>,
    pub final_parameters: Vec<f64>,
    pub parameter_errors: Vec<f64>,
    pub weights: Vec<f64>,
    /// One entry per dataset (spec §3/§4.11 glossary), not per point.
    pub point_residuals: Vec<f64>,
    /// One entry per dataset (spec §3/§4.11 glossary), not per point.
    pub relative_residuals: Vec<f64>,
    pub overall_residuals: f64,
    pub overall_relative_residuals: f64,
    pub internal_residuals: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub delta: f64,
    pub ending: EndingReason,
    pub flags: BTreeSet<String>,
    /// Unrecognised `key=value` lines preserved verbatim on import so
    /// a later export does not lose information (§6's "unknown keys
    /// are preserved (future-proof)").
    pub extra_fields: BTreeMap<String, String>,
}

impl FitTrajectory {
    pub fn is_flagged(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn add_flag(&mut self, flag: impl Into<String>) {
        self.flags.insert(flag.into());
    }

    pub fn remove_flag(&mut self, flag: &str) {
        self.flags.remove(flag);
    }

    /// Identity used by `merge` to de-duplicate trajectories loaded
    /// from more than one source file.
    fn identity(&self) -> (i64, i64, String) {
        (self.start_time, self.end_time, self.engine_name.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FitTrajectories {
    records: Vec<FitTrajectory>,
}

impl FitTrajectories {
    pub fn new() -> Self {
        FitTrajectories { records: Vec::new() }
    }

    pub fn push(&mut self, trajectory: FitTrajectory) {
        self.records.push(trajectory);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FitTrajectory> {
        self.records.iter()
    }

    pub fn get(&self, index: usize) -> Option<&FitTrajectory> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut FitTrajectory> {
        self.records.get_mut(index)
    }

    pub fn remove(&mut self, index: usize) -> FitTrajectory {
        self.records.remove(index)
    }

    pub fn sort_by_date(&mut self) {
        self.records.sort_by_key(|t| t.start_time);
    }

    pub fn sort_by_residuals(&mut self) {
        self.records
            .sort_by(|a, b| a.overall_residuals.total_cmp(&b.overall_residuals));
    }

    /// Keeps the `n` trajectories with the lowest overall residuals,
    /// dropping the rest.
    pub fn keep_best_trajectories(&mut self, n: usize) {
        self.sort_by_residuals();
        self.records.truncate(n);
    }

    /// Drops every trajectory whose residual ratio to the best one
    /// exceeds `threshold`.
    pub fn trim(&mut self, threshold: f64) {
        let Some(best) = self
            .records
            .iter()
            .map(|t| t.overall_residuals)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.min(r))))
        else {
            return;
        };
        if best <= 0.0 {
            return;
        }
        self.records.retain(|t| t.overall_residuals / best <= threshold);
    }

    /// Merges `other` into `self`, de-duplicating by
    /// `(start_time, end_time, engine_name)`.
    pub fn merge(&mut self, other: FitTrajectories) {
        let existing: BTreeSet<(i64, i64, String)> =
            self.records.iter().map(FitTrajectory::identity).collect();
        for t in other.records {
            if !existing.contains(&t.identity()) {
                self.records.push(t);
            }
        }
    }

    pub fn flagged_trajectories(&self, flag: &str) -> Vec<&FitTrajectory> {
        self.records.iter().filter(|t| t.is_flagged(flag)).collect()
    }

    pub fn all_flags(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .flat_map(|t| t.flags.iter().cloned())
            .collect()
    }

    /// Serializes every trajectory to the line-oriented
    /// `[trajectory N]` format (spec §6).
    pub fn export(&self) -> String {
        let mut out = String::new();
        for (i, t) in self.records.iter().enumerate() {
            writeln!(out, "[trajectory {}]", i + 1).unwrap();
            writeln!(out, "startTime={}", t.start_time).unwrap();
            writeln!(out, "endTime={}", t.end_time).unwrap();
            writeln!(out, "engine={}", t.engine_name).unwrap();
            writeln!(out, "residuals={}", format_float(t.overall_residuals)).unwrap();
            writeln!(out, "relResiduals={}", format_float(t.overall_relative_residuals)).unwrap();
            writeln!(out, "ending={}", t.ending.as_str()).unwrap();
            writeln!(out, "flags={}", t.flags.iter().cloned().collect::<Vec<_>>().join(",")).unwrap();
            writeln!(out, "iterations={}", t.iterations).unwrap();
            writeln!(out, "evaluations={}", t.evaluations).unwrap();
            writeln!(out, "initial={}", format_floats(&t.initial_parameters)).unwrap();
            writeln!(out, "final={}", format_floats(&t.final_parameters)).unwrap();
            writeln!(out, "errors={}", format_floats(&t.parameter_errors)).unwrap();
            writeln!(out, "weights={}", format_floats(&t.weights)).unwrap();
            for (k, v) in &t.extra_fields {
                writeln!(out, "{k}={v}").unwrap();
            }
        }
        out
    }

    /// Parses the `[trajectory N]` format, accumulating the imported
    /// records onto whatever is already present (mirrors `merge`'s
    /// de-duplication to make repeated loads idempotent).
    pub fn import(text: &str) -> Result<Self, TrajectoryFileError> {
        let mut records = Vec::new();
        let mut current: Option<PartialTrajectory> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                if let Some(partial) = current.take() {
                    records.push(partial.finish()?);
                }
                if !line.ends_with(']') || !line[1..line.len() - 1].starts_with("trajectory") {
                    return Err(TrajectoryFileError::MalformedHeader {
                        line: line.to_string(),
                    });
                }
                current = Some(PartialTrajectory::default());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(TrajectoryFileError::MalformedLine {
                    line: line.to_string(),
                });
            };
            let partial = current
                .as_mut()
                .ok_or_else(|| TrajectoryFileError::MalformedLine {
                    line: line.to_string(),
                })?;
            partial.set(key.trim(), value.trim())?;
        }
        if let Some(partial) = current.take() {
            records.push(partial.finish()?);
        }
        Ok(FitTrajectories { records })
    }
}

fn format_float(v: f64) -> String {
    format!("{v:.12e}")
}

fn format_floats(v: &[f64]) -> String {
    v.iter().map(|x| format_float(*x)).collect::<Vec<_>>().join(" ")
}

fn parse_floats(s: &str, field: &str) -> Result<Vec<f64>, TrajectoryFileError> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| TrajectoryFileError::MalformedLine {
                    line: format!("{field}={s}"),
                })
        })
        .collect()
}

/// Accumulates `key=value` lines for one `[trajectory N]` section
/// before they are validated into a full `FitTrajectory`.
#[derive(Default)]
struct PartialTrajectory {
    start_time: Option<i64>,
    end_time: Option<i64>,
    engine_name: Option<String>,
    overall_residuals: Option<f64>,
    overall_relative_residuals: Option<f64>,
    ending: Option<EndingReason>,
    flags: BTreeSet<String>,
    iterations: Option<usize>,
    evaluations: Option<usize>,
    initial_parameters: Option<Vec<f64>>,
    final_parameters: Option<Vec<f64>>,
    parameter_errors: Option<Vec<f64>>,
    weights: Option<Vec<f64>>,
    extra_fields: BTreeMap<String, String>,
}

impl PartialTrajectory {
    fn set(&mut self, key: &str, value: &str) -> Result<(), TrajectoryFileError> {
        match key {
            "startTime" => {
                self.start_time = Some(value.parse().map_err(|_| bad_line(key, value))?)
            }
            "endTime" => self.end_time = Some(value.parse().map_err(|_| bad_line(key, value))?),
            "engine" => self.engine_name = Some(value.to_string()),
            "residuals" => {
                self.overall_residuals = Some(value.parse().map_err(|_| bad_line(key, value))?)
            }
            "relResiduals" => {
                self.overall_relative_residuals =
                    Some(value.parse().map_err(|_| bad_line(key, value))?)
            }
            "ending" => {
                self.ending = Some(
                    EndingReason::parse(value).ok_or_else(|| bad_line(key, value))?,
                )
            }
            "flags" => {
                self.flags = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }
            "iterations" => {
                self.iterations = Some(value.parse().map_err(|_| bad_line(key, value))?)
            }
            "evaluations" => {
                self.evaluations = Some(value.parse().map_err(|_| bad_line(key, value))?)
            }
            "initial" => self.initial_parameters = Some(parse_floats(value, key)?),
            "final" => self.final_parameters = Some(parse_floats(value, key)?),
            "errors" => self.parameter_errors = Some(parse_floats(value, key)?),
            "weights" => self.weights = Some(parse_floats(value, key)?),
            other => {
                self.extra_fields.insert(other.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<FitTrajectory, TrajectoryFileError> {
        let missing = |field: &str| TrajectoryFileError::MalformedLine {
            line: format!("missing required field '{field}'"),
        };
        let initial = self.initial_parameters.unwrap_or_default();
        let final_ = self.final_parameters.unwrap_or_default();
        let errors = self.parameter_errors.unwrap_or_default();
        let weights = self.weights.unwrap_or_default();

        // `initial`/`final`/`errors` all describe the same
        // declared-parameter×dataset vector (spec §6): when more than
        // one is present, their lengths must agree.
        check_vector_length("final", initial.len(), final_.len())?;
        check_vector_length("errors", initial.len(), errors.len())?;

        Ok(FitTrajectory {
            start_time: self.start_time.ok_or_else(|| missing("startTime"))?,
            end_time: self.end_time.ok_or_else(|| missing("endTime"))?,
            engine_name: self.engine_name.ok_or_else(|| missing("engine"))?,
            initial_parameters: initial,
            final_parameters: final_,
            parameter_errors: errors,
            weights,
            point_residuals: Vec::new(),
            relative_residuals: Vec::new(),
            overall_residuals: self.overall_residuals.unwrap_or(0.0),
            overall_relative_residuals: self.overall_relative_residuals.unwrap_or(0.0),
            internal_residuals: 0.0,
            iterations: self.iterations.unwrap_or(0),
            evaluations: self.evaluations.unwrap_or(0),
            delta: 0.0,
            ending: self.ending.ok_or_else(|| missing("ending"))?,
            flags: self.flags,
            extra_fields: self.extra_fields,
        })
    }
}

fn bad_line(key: &str, value: &str) -> TrajectoryFileError {
    TrajectoryFileError::MalformedLine {
        line: format!("{key}={value}"),
    }
}

/// Flags a genuine length disagreement between two vector fields of
/// the same `[trajectory N]` section (spec §6); silent when either
/// field was simply absent (length 0).
fn check_vector_length(field: &str, expected: usize, actual: usize) -> Result<(), TrajectoryFileError> {
    if expected > 0 && actual > 0 && expected != actual {
        Err(TrajectoryFileError::LengthMismatch {
            field: field.to_string(),
            expected,
            actual,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(start: i64, residuals: f64) -> FitTrajectory {
        FitTrajectory {
            start_time: start,
            end_time: start + 1,
            engine_name: "lm".to_string(),
            initial_parameters: vec![1.0, 2.0],
            final_parameters: vec![1.1, 2.2],
            parameter_errors: vec![0.01, 0.02],
            weights: vec![1.0],
            point_residuals: vec![residuals],
            relative_residuals: vec![0.0],
            overall_residuals: residuals,
            overall_relative_residuals: 0.0,
            internal_residuals: 0.0,
            iterations: 5,
            evaluations: 10,
            delta: 1e-6,
            ending: EndingReason::Converged,
            flags: BTreeSet::new(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_keep_best_trajectories() {
        let mut log = FitTrajectories::new();
        log.push(sample(1, 3.0));
        log.push(sample(2, 1.0));
        log.push(sample(3, 2.0));
        log.keep_best_trajectories(2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(0).unwrap().overall_residuals, 1.0);
        assert_eq!(log.get(1).unwrap().overall_residuals, 2.0);
    }

    #[test]
    fn test_trim_drops_far_worse_trajectories() {
        let mut log = FitTrajectories::new();
        log.push(sample(1, 1.0));
        log.push(sample(2, 10.0));
        log.trim(2.0);
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(0).unwrap().overall_residuals, 1.0);
    }

    #[test]
    fn test_merge_deduplicates_by_identity() {
        let mut a = FitTrajectories::new();
        a.push(sample(1, 1.0));
        let mut b = FitTrajectories::new();
        b.push(sample(1, 1.0));
        b.push(sample(2, 2.0));
        a.merge(b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_flags_roundtrip() {
        let mut t = sample(1, 1.0);
        t.add_flag("good");
        assert!(t.is_flagged("good"));
        t.remove_flag("good");
        assert!(!t.is_flagged("good"));
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut log = FitTrajectories::new();
        let mut t = sample(100, 0.5);
        t.add_flag("keep");
        log.push(t);
        let text = log.export();
        let imported = FitTrajectories::import(&text).unwrap();
        assert_eq!(imported.len(), 1);
        let rt = imported.get(0).unwrap();
        assert_eq!(rt.start_time, 100);
        assert_eq!(rt.ending, EndingReason::Converged);
        assert!(rt.is_flagged("keep"));
        assert!((rt.overall_residuals - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_import_preserves_unknown_keys() {
        let text = "[trajectory 1]\nstartTime=1\nendTime=2\nengine=lm\nresiduals=1.0\nrelResiduals=0.1\nending=Converged\nflags=\niterations=1\nevaluations=1\ninitial=1.0\nfinal=1.0\nerrors=0.0\nweights=1.0\ncomment=hand-tuned\n";
        let log = FitTrajectories::import(text).unwrap();
        let t = log.get(0).unwrap();
        assert_eq!(t.extra_fields.get("comment").unwrap(), "hand-tuned");
        let exported = log.export();
        assert!(exported.contains("comment=hand-tuned"));
    }

    #[test]
    fn test_import_malformed_header_errors() {
        assert!(FitTrajectories::import("[not a trajectory]\n").is_err());
    }
}
