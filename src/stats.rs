//! Reference statistics over many reports.
//!
//! Running the same set of queries against the same servers several times
//! yields slightly different numbers of differences every time. sumstat
//! collects these numbers from a set of reference reports into
//! [`SummaryStatistics`]. statcmp then checks whether the numbers of a new
//! report lie within the reference distribution.
//!
//! The upper limit of a distribution is derived using a modified
//! inter-quartile range rule: the 20th and 80th percentile are used instead
//! of the quartiles and the threshold is capped at the largest sample.

#![warn(missing_docs)]

use crate::config::FieldName;
use crate::dataformat::{Classification, DiffReport, FieldSummary, Summary};
use crate::Qid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::{error, fmt, fs, io};
use tracing::warn;

/// The default name of the statistics file.
pub const STATS_FILENAME: &str = "stats.json";

//------------ SamplePosition -------------------------------------------------

/// The position of a sample relative to a distribution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SamplePosition {
    /// The sample is below all reference samples.
    BelowRef,

    /// The sample is within the usual range.
    Normal,

    /// The sample is above the threshold but not above all samples.
    AboveThreshold,

    /// The sample is above all reference samples.
    AboveRef,
}

impl SamplePosition {
    /// Returns whether the sample is considered a regression.
    pub fn is_failure(self) -> bool {
        matches!(self, SamplePosition::AboveThreshold | SamplePosition::AboveRef)
    }
}

impl fmt::Display for SamplePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SamplePosition::BelowRef => "below reference (improvement)",
            SamplePosition::Normal => "normal",
            SamplePosition::AboveThreshold => "above threshold",
            SamplePosition::AboveRef => "above reference",
        })
    }
}

//------------ Stats ----------------------------------------------------------

/// The distribution of a single parameter.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Stats {
    /// All samples.
    pub samples: Vec<f64>,

    /// The smallest sample.
    pub min: f64,

    /// The median of the samples.
    pub median: f64,

    /// The largest sample.
    pub max: f64,

    /// The upper limit of normal samples.
    pub threshold: f64,
}

impl Stats {
    /// Creates the distribution of a non-empty set of samples.
    pub fn new(samples: Vec<f64>) -> Result<Self, Error> {
        let mut sorted = samples.clone();
        sorted.sort_by(f64::total_cmp);
        let (min, max) = match (sorted.first(), sorted.last()) {
            (Some(min), Some(max)) => (*min, *max),
            _ => return Err(Error::NoSamples),
        };
        let p20 = percentile(&sorted, 20.);
        let p80 = percentile(&sorted, 80.);
        Ok(Stats {
            min,
            median: percentile(&sorted, 50.),
            max,
            threshold: (p80 + 1.5 * (p80 - p20)).min(max),
            samples,
        })
    }

    /// Returns the position of a sample in the distribution.
    pub fn evaluate(&self, sample: f64) -> SamplePosition {
        if sample < self.min {
            SamplePosition::BelowRef
        } else if sample > self.max {
            SamplePosition::AboveRef
        } else if sample > self.threshold {
            SamplePosition::AboveThreshold
        } else {
            SamplePosition::Normal
        }
    }
}

/// Returns a percentile of sorted samples using linear interpolation.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100. * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    sorted[low] + (sorted[high] - sorted[low]) * (rank - low as f64)
}

//------------ MismatchStatistics ---------------------------------------------

/// The distributions of the target disagreements of one field.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MismatchStatistics {
    /// The number of target disagreements of the field.
    pub total: Stats,

    /// The number of queries per mismatch.
    ///
    /// The key is the label of the mismatch, e.g., `NOERROR != NXDOMAIN`.
    /// A report without a mismatch contributes a zero sample.
    pub mismatches: BTreeMap<String, Stats>,
}

impl MismatchStatistics {
    /// Creates the statistics of a field from summaries and their totals.
    pub fn from_summaries(
        summaries: &[(&Summary, u64)],
        field: FieldName,
        normalized: bool,
    ) -> Result<Self, Error> {
        let mut counts: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (i, (summary, _)) in summaries.iter().enumerate() {
            let Some(field_summary) = summary.fields.get(&field) else {
                continue;
            };
            for mismatch in &field_summary.mismatches {
                counts
                    .entry(mismatch.label())
                    .or_insert_with(|| vec![0; summaries.len()])[i] +=
                    mismatch.count;
            }
        }
        let samples = |counts: &[u64]| -> Vec<f64> {
            counts
                .iter()
                .zip(summaries)
                .map(|(count, (_, total))| sample(*count, *total, normalized))
                .collect()
        };
        let totals: Vec<_> = summaries
            .iter()
            .map(|(summary, _)| summary.field_count(field))
            .collect();
        let mut mismatches = BTreeMap::new();
        for (label, counts) in counts {
            mismatches.insert(label, Stats::new(samples(&counts))?);
        }
        Ok(MismatchStatistics {
            total: Stats::new(samples(&totals))?,
            mismatches,
        })
    }

    /// Evaluates the mismatches of a field.
    ///
    /// Mismatches unknown to the statistics are above the reference if
    /// they occurred at all.
    pub fn evaluate(
        &self,
        field: Option<&FieldSummary>,
        total: u64,
        normalized: bool,
    ) -> Vec<Evaluation> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for mismatch in field.iter().flat_map(|field| &field.mismatches) {
            *counts.entry(mismatch.label()).or_default() += mismatch.count;
        }
        let mut res = Vec::new();
        for (label, stats) in &self.mismatches {
            let count = counts.remove(label).unwrap_or(0);
            let sample = sample(count, total, normalized);
            res.push(Evaluation::new(label.clone(), sample, stats));
        }
        for (label, count) in counts {
            if count > 0 {
                res.push(Evaluation {
                    parameter: label,
                    sample: sample(count, total, normalized),
                    position: SamplePosition::AboveRef,
                });
            }
        }
        res
    }
}

//------------ QueryStatistics ------------------------------------------------

/// The fraction of reports in which the others may disagree before a
/// query's status is unknown.
pub const UPSTREAM_UNSTABLE_THRESHOLD: f64 = 0.1;

/// The fraction of reports in which the target may disagree and the query
/// still passes.
pub const ALLOWED_FAIL_THRESHOLD: f64 = 0.05;

/// The status of a query across a set of reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryStatus {
    /// The target rarely disagrees.
    Passing,

    /// The other servers disagree too often to tell.
    Unknown,

    /// The target disagrees regularly.
    Failing,
}

impl QueryStatus {
    /// Determines the status from the number of reports and disagreements.
    pub fn new(
        total: usize,
        target_disagrees: usize,
        others_disagree: usize,
    ) -> Self {
        let total = total as f64;
        if others_disagree as f64 / total >= UPSTREAM_UNSTABLE_THRESHOLD {
            QueryStatus::Unknown
        } else if (target_disagrees as f64 / total) < ALLOWED_FAIL_THRESHOLD
        {
            QueryStatus::Passing
        } else {
            QueryStatus::Failing
        }
    }
}

/// The queries that do not reliably pass across reference reports.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct QueryStatistics {
    /// Queries where the target disagrees regularly.
    pub failing: BTreeSet<Qid>,

    /// Queries where the other servers disagree too often.
    pub unknown: BTreeSet<Qid>,
}

impl QueryStatistics {
    /// Determines the status of all queries with differences in reports.
    ///
    /// Target disagreements that turned out not to be reproducible are
    /// not counted.
    pub fn from_reports(reports: &[DiffReport]) -> Self {
        let mut target: BTreeMap<Qid, usize> = BTreeMap::new();
        let mut others: BTreeMap<Qid, usize> = BTreeMap::new();
        let records =
            reports.iter().flat_map(|report| report.records.iter().flatten());
        for record in records {
            match record.classification {
                Classification::UpstreamUnstable => {
                    *others.entry(record.qid).or_default() += 1
                }
                Classification::TargetDisagreement
                    if record.reproducible != Some(false) =>
                {
                    *target.entry(record.qid).or_default() += 1
                }
                _ => {}
            }
        }
        let mut res = QueryStatistics::default();
        let qids: BTreeSet<_> =
            target.keys().chain(others.keys()).copied().collect();
        for qid in qids {
            let status = QueryStatus::new(
                reports.len(),
                target.get(&qid).copied().unwrap_or(0),
                others.get(&qid).copied().unwrap_or(0),
            );
            match status {
                QueryStatus::Failing => {
                    res.failing.insert(qid);
                }
                QueryStatus::Unknown => {
                    res.unknown.insert(qid);
                }
                QueryStatus::Passing => {}
            }
        }
        res
    }
}

//------------ SummaryStatistics ----------------------------------------------

/// The distributions of all summary parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SummaryStatistics {
    /// The number of reports the statistics are based on.
    pub sample_size: usize,

    /// Whether samples are fractions of the total answers.
    pub normalized: bool,

    /// The number of usable answers.
    pub usable_answers: Stats,

    /// The number of target disagreements.
    pub target_disagreements: Stats,

    /// The number of upstream unstable queries.
    pub upstream_unstable: Stats,

    /// The number of differences that were not reproducible.
    pub not_reproducible: Stats,

    /// The target disagreements per field.
    pub fields: BTreeMap<FieldName, MismatchStatistics>,

    /// The queries that did not reliably pass.
    #[serde(default)]
    pub queries: QueryStatistics,
}

impl SummaryStatistics {
    /// Creates statistics from summaries and their total answers.
    ///
    /// The query statistics are left empty.
    pub fn from_summaries(
        summaries: &[(&Summary, u64)],
        field_weights: &[FieldName],
        normalized: bool,
    ) -> Result<Self, Error> {
        let param = |get: &dyn Fn(&Summary) -> u64| {
            Stats::new(
                summaries
                    .iter()
                    .map(|(summary, total)| {
                        sample(get(summary), *total, normalized)
                    })
                    .collect(),
            )
        };
        let mut fields = BTreeMap::new();
        for field in field_weights {
            let stats = MismatchStatistics::from_summaries(
                summaries, *field, normalized,
            )?;
            fields.insert(*field, stats);
        }
        Ok(SummaryStatistics {
            sample_size: summaries.len(),
            normalized,
            usable_answers: param(&Summary::usable_answers)?,
            target_disagreements: param(&|s: &Summary| {
                s.target_disagreements
            })?,
            upstream_unstable: param(&|s: &Summary| s.upstream_unstable)?,
            not_reproducible: param(&|s: &Summary| s.not_reproducible)?,
            fields,
            queries: QueryStatistics::default(),
        })
    }

    /// Creates statistics from report files.
    ///
    /// Reports that cannot be read or have no summary are skipped.
    pub fn from_reports(
        paths: &[PathBuf],
        field_weights: &[FieldName],
        normalized: bool,
    ) -> Result<Self, Error> {
        let mut reports = Vec::new();
        for path in paths {
            match DiffReport::load(path) {
                Ok(report) if report.summary.is_some() => reports.push(report),
                Ok(_) => {
                    warn!("{}: no summary, skipping", path.display())
                }
                Err(err) => warn!("{err}, skipping"),
            }
        }
        let summaries: Vec<_> = reports
            .iter()
            .filter_map(|report| {
                let summary = report.summary.as_ref()?;
                Some((summary, report.total_answers.unwrap_or(summary.total)))
            })
            .collect();
        let mut res =
            Self::from_summaries(&summaries, field_weights, normalized)?;
        res.queries = QueryStatistics::from_reports(&reports);
        Ok(res)
    }

    /// Loads statistics from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let data =
            fs::read(path).map_err(|err| Error::Io(path.into(), err))?;
        serde_json::from_slice(&data)
            .map_err(|err| Error::Parse(path.into(), err))
    }

    /// Saves the statistics to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let data = serde_json::to_vec_pretty(self)
            .map_err(|err| Error::Parse(path.into(), err))?;
        fs::write(path, data).map_err(|err| Error::Io(path.into(), err))
    }

    /// Evaluates the global counts and field totals of a summary.
    ///
    /// Fields without reference statistics are not evaluated.
    pub fn evaluate(
        &self,
        summary: &Summary,
        total: u64,
    ) -> Vec<Evaluation> {
        let sample = |count| sample(count, total, self.normalized);
        let mut res = vec![
            Evaluation::new(
                "target_disagreements".into(),
                sample(summary.target_disagreements),
                &self.target_disagreements,
            ),
            Evaluation::new(
                "upstream_unstable".into(),
                sample(summary.upstream_unstable),
                &self.upstream_unstable,
            ),
            Evaluation::new(
                "not_reproducible".into(),
                sample(summary.not_reproducible),
                &self.not_reproducible,
            ),
        ];
        for (field, stats) in &self.fields {
            res.push(Evaluation::new(
                field.to_string(),
                sample(summary.field_count(*field)),
                &stats.total,
            ));
        }
        res
    }

    /// Evaluates the mismatches of a field of a summary.
    pub fn evaluate_mismatches(
        &self,
        field: FieldName,
        summary: &Summary,
        total: u64,
    ) -> Vec<Evaluation> {
        match self.fields.get(&field) {
            Some(stats) => stats.evaluate(
                summary.fields.get(&field),
                total,
                self.normalized,
            ),
            None => Vec::new(),
        }
    }
}

fn sample(count: u64, total: u64, normalized: bool) -> f64 {
    if !normalized {
        count as f64
    } else if total == 0 {
        0.
    } else {
        count as f64 / total as f64
    }
}

//------------ Evaluation -----------------------------------------------------

/// The evaluation of one parameter of a report.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    /// The name of the parameter.
    pub parameter: String,

    /// The value of the parameter in the report.
    pub sample: f64,

    /// The position of the value in the reference distribution.
    pub position: SamplePosition,
}

impl Evaluation {
    fn new(parameter: String, sample: f64, stats: &Stats) -> Self {
        Evaluation {
            parameter,
            sample,
            position: stats.evaluate(sample),
        }
    }

    /// Returns whether the parameter is considered a regression.
    pub fn is_failure(&self) -> bool {
        self.position.is_failure()
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:<22} {:>12.4}  {}",
            if self.is_failure() { "! " } else { "  " },
            self.parameter,
            self.sample,
            self.position
        )
    }
}

//------------ statcmp --------------------------------------------------------

/// The comparison of one report with reference statistics.
#[derive(Clone, Debug)]
pub struct Comparison {
    path: PathBuf,
    evaluations: Vec<Evaluation>,
    mismatches: BTreeMap<String, Vec<Evaluation>>,
}

impl Comparison {
    /// Compares a report with reference statistics.
    ///
    /// Mismatches are only evaluated for failing fields.
    pub fn new(
        stats: &SummaryStatistics,
        path: &Path,
        report: &DiffReport,
    ) -> Result<Self, Error> {
        let summary = report
            .summary
            .as_ref()
            .ok_or_else(|| Error::MissingSummary(path.into()))?;
        let total = report.total_answers.unwrap_or(summary.total);
        let evaluations = stats.evaluate(summary, total);
        let mut mismatches = BTreeMap::new();
        for field in stats.fields.keys() {
            let failing = evaluations.iter().any(|eval| {
                eval.is_failure() && eval.parameter == field.as_str()
            });
            if failing {
                mismatches.insert(
                    field.to_string(),
                    stats.evaluate_mismatches(*field, summary, total),
                );
            }
        }
        Ok(Comparison {
            path: path.into(),
            evaluations,
            mismatches,
        })
    }

    /// Returns whether any global count or field total failed.
    pub fn failed(&self) -> bool {
        self.evaluations.iter().any(Evaluation::is_failure)
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {}", self.path.display())?;
        for eval in &self.evaluations {
            writeln!(f, "{eval}")?;
            let mismatches = self.mismatches.get(&eval.parameter);
            for mismatch in mismatches.into_iter().flatten() {
                writeln!(f, "    {mismatch}")?;
            }
        }
        writeln!(f)
    }
}

/// Compares reports against reference statistics.
///
/// Returns the comparison in text form and whether any report failed.
pub fn statcmp(
    stats: &SummaryStatistics,
    reports: &[PathBuf],
) -> Result<(String, bool), Error> {
    let mut comparisons = Vec::new();
    for path in reports {
        let report = DiffReport::load(path)
            .map_err(|err| Error::Report(err.to_string()))?;
        comparisons.push(Comparison::new(stats, path, &report)?);
    }
    let failed = comparisons.iter().any(Comparison::failed);
    let text = comparisons.iter().map(ToString::to_string).collect();
    Ok((text, failed))
}

//============ Error Types ===================================================

/// Statistics cannot be computed or used.
#[derive(Debug)]
pub enum Error {
    /// There are no usable samples.
    NoSamples,

    /// A file could not be read or written.
    Io(PathBuf, io::Error),

    /// A statistics file is invalid.
    Parse(PathBuf, serde_json::Error),

    /// A report could not be read.
    Report(String),

    /// A report has no summary.
    MissingSummary(PathBuf),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoSamples => f.write_str("no usable reports"),
            Error::Io(path, err) => write!(f, "{}: {}", path.display(), err),
            Error::Parse(path, err) => {
                write!(f, "{}: invalid statistics: {}", path.display(), err)
            }
            Error::Report(err) => f.write_str(err),
            Error::MissingSummary(path) => write!(
                f,
                "{}: no summary, run diffsum first",
                path.display()
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(_, err) => Some(err),
            Error::Parse(_, err) => Some(err),
            _ => None,
        }
    }
}

//============ Testing =======================================================
