//! Diff records and the report datafile.
//!
//! The results of the comparison steps are kept in a JSON datafile, by
//! default `report.json` next to the store. The orchestrator creates it
//! with the run's times and totals, msgdiff adds the [`DiffRecord`]s,
//! diffrepro refines them, and diffsum adds the [`Summary`].

#![warn(missing_docs)]

use crate::config::FieldName;
use crate::Qid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{error, fmt, fs, io};
use tracing::warn;

//------------ Classification -------------------------------------------------

/// The outcome of comparing the answers to one query.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// The other servers disagree among themselves.
    UpstreamUnstable,

    /// The other servers agree but the target differs from them.
    TargetDisagreement,

    /// All servers agree.
    Match,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Classification::UpstreamUnstable => "upstream unstable",
            Classification::TargetDisagreement => "target disagreement",
            Classification::Match => "match",
        })
    }
}

//------------ MismatchValue --------------------------------------------------

/// The value of a field in one of two differing answers.
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(untagged)]
pub enum MismatchValue {
    /// A single value such as an rcode.
    Text(String),

    /// A set of values such as the records of a section.
    List(Vec<String>),
}

impl From<&str> for MismatchValue {
    fn from(value: &str) -> Self {
        MismatchValue::Text(value.into())
    }
}

impl fmt::Display for MismatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchValue::Text(value) => f.write_str(value),
            MismatchValue::List(values) => f.write_str(&values.join(" ")),
        }
    }
}

//------------ FieldMismatch --------------------------------------------------

/// A field that differs between the expected and the received answer.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FieldMismatch {
    /// The field.
    pub field: FieldName,

    /// The value in the expected answer.
    pub exp_val: MismatchValue,

    /// The value in the received answer.
    pub got_val: MismatchValue,
}

impl FieldMismatch {
    /// Creates a new mismatch.
    pub fn new(
        field: FieldName,
        exp_val: impl Into<MismatchValue>,
        got_val: impl Into<MismatchValue>,
    ) -> Self {
        Self {
            field,
            exp_val: exp_val.into(),
            got_val: got_val.into(),
        }
    }
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected '{}' got '{}'",
            self.field, self.exp_val, self.got_val
        )
    }
}

//------------ ReproCounter ---------------------------------------------------

/// The results of re-running a query.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct ReproCounter {
    /// How often the query was re-run.
    pub retries: u32,

    /// How often the other servers agreed.
    pub upstream_stable: u32,

    /// How often the original difference was seen again.
    pub verified: u32,

    /// How often the target differed in a different way.
    #[serde(default)]
    pub different_failure: u32,
}

impl ReproCounter {
    /// Returns whether the query has never been re-run.
    pub fn is_empty(&self) -> bool {
        self.retries == 0
    }

    /// Returns whether the other servers agreed on every re-run.
    pub fn is_upstream_stable(&self) -> bool {
        self.upstream_stable == self.retries
    }

    /// Returns whether every re-run showed the original difference.
    pub fn is_verified(&self) -> bool {
        self.verified == self.retries
    }
}

//------------ DiffRecord -----------------------------------------------------

/// The comparison result for a single query.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiffRecord {
    /// The query ID.
    pub qid: Qid,

    /// The classification.
    pub classification: Classification,

    /// The differing fields in criteria order.
    ///
    /// This is non-empty exactly for target disagreements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<FieldMismatch>,

    /// Whether the difference showed up again when re-running the query.
    ///
    /// This is `None` until the record has been processed by diffrepro.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reproducible: Option<bool>,

    /// The details of re-running the query.
    #[serde(default, skip_serializing_if = "ReproCounter::is_empty")]
    pub repro: ReproCounter,
}

impl DiffRecord {
    /// Creates a record from a comparison result.
    pub fn new(
        qid: Qid,
        classification: Classification,
        mismatches: Vec<FieldMismatch>,
    ) -> Self {
        Self {
            qid,
            classification,
            mismatches,
            reproducible: None,
            repro: ReproCounter::default(),
        }
    }

    /// Returns the differing fields in criteria order.
    pub fn mismatching_fields(
        &self,
    ) -> impl Iterator<Item = FieldName> + '_ {
        self.mismatches.iter().map(|mismatch| mismatch.field)
    }

    /// Returns the mismatch for a field, if present.
    pub fn mismatch(&self, field: FieldName) -> Option<&FieldMismatch> {
        self.mismatches.iter().find(|mismatch| mismatch.field == field)
    }

    /// Returns the most significant mismatch according to `field_weights`.
    pub fn significant_mismatch(
        &self,
        field_weights: &[FieldName],
    ) -> Option<&FieldMismatch> {
        field_weights.iter().find_map(|field| self.mismatch(*field))
    }
}

//------------ Summary --------------------------------------------------------

/// The summary of the differences of a run.
///
/// Every target disagreement is counted for exactly one field, the first
/// of its mismatching fields in the field weights, so that the field
/// counts add up to [`target_disagreements`][Self::target_disagreements].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Summary {
    /// Queries with complete answers that were classified.
    pub total: u64,

    /// Queries on which all servers agreed.
    pub matches: u64,

    /// Queries on which the other servers disagreed.
    pub upstream_unstable: u64,

    /// Target disagreements that did not show up again on re-runs.
    pub not_reproducible: u64,

    /// Target disagreements counted in the field breakdown.
    pub target_disagreements: u64,

    /// Differences excluded because of a reference report.
    pub manually_ignored: u64,

    /// The breakdown of target disagreements by field.
    pub fields: BTreeMap<FieldName, FieldSummary>,
}

impl Summary {
    /// Returns the number of queries with usable answers.
    pub fn usable_answers(&self) -> u64 {
        self.total
            .saturating_sub(self.upstream_unstable)
            .saturating_sub(self.not_reproducible)
            .saturating_sub(self.manually_ignored)
    }

    /// Returns the number of target disagreements for a field.
    pub fn field_count(&self, field: FieldName) -> u64 {
        self.fields.get(&field).map(|f| f.count).unwrap_or(0)
    }
}

/// The target disagreements of a single field.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FieldSummary {
    /// The number of queries.
    pub count: u64,

    /// The distinct value pairs, most frequent first.
    pub mismatches: Vec<MismatchSummary>,
}

impl FieldSummary {
    /// Returns the mismatch with the given pair of values.
    pub fn mismatch(
        &self,
        exp_val: &MismatchValue,
        got_val: &MismatchValue,
    ) -> Option<&MismatchSummary> {
        self.mismatches
            .iter()
            .find(|m| &m.exp_val == exp_val && &m.got_val == got_val)
    }
}

/// The queries with one particular pair of differing values.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MismatchSummary {
    /// The value in the answers of the other servers.
    pub exp_val: MismatchValue,

    /// The value in the target's answer.
    pub got_val: MismatchValue,

    /// The number of queries.
    pub count: u64,

    /// Example queries, limited in number.
    pub queries: Vec<Qid>,
}

impl MismatchSummary {
    /// Returns the pair of values as text, e.g., `NOERROR != NXDOMAIN`.
    pub fn label(&self) -> String {
        format!("{} != {}", self.exp_val, self.got_val)
    }
}

//------------ DiffReport -----------------------------------------------------

/// The content of a datafile.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DiffReport {
    /// Start of the orchestrator run in UNIX seconds.
    #[serde(default)]
    pub start_time: Option<u32>,

    /// End of the orchestrator run in UNIX seconds.
    #[serde(default)]
    pub end_time: Option<u32>,

    /// The number of queries in the store.
    #[serde(default)]
    pub total_queries: Option<u64>,

    /// The number of queries with answers.
    #[serde(default)]
    pub total_answers: Option<u64>,

    /// The number of queries classified as match.
    #[serde(default)]
    pub matches: Option<u64>,

    /// The records of all queries not classified as match.
    ///
    /// This is `None` until msgdiff has run.
    #[serde(default)]
    pub records: Option<Vec<DiffRecord>>,

    /// The summary.
    ///
    /// This is `None` until diffsum has run.
    #[serde(default)]
    pub summary: Option<Summary>,
}

impl DiffReport {
    /// Creates a report with the times of a run.
    pub fn new(
        start_time: Option<u32>,
        end_time: Option<u32>,
        total_queries: u64,
        total_answers: u64,
    ) -> Self {
        Self {
            start_time,
            end_time,
            total_queries: Some(total_queries),
            total_answers: Some(total_answers),
            ..Default::default()
        }
    }

    /// Returns the duration of the run in seconds.
    pub fn duration(&self) -> Option<u32> {
        Some(self.end_time?.saturating_sub(self.start_time?))
    }

    /// Returns the diff records or an error if msgdiff has not run.
    pub fn records(&self) -> Result<&[DiffRecord], Error> {
        self.records.as_deref().ok_or(Error::MissingData("records"))
    }

    /// Returns the summary or an error if diffsum has not run.
    pub fn summary(&self) -> Result<&Summary, Error> {
        self.summary.as_ref().ok_or(Error::MissingData("summary"))
    }

    /// Returns the diff records for modification.
    pub fn records_mut(&mut self) -> Result<&mut Vec<DiffRecord>, Error> {
        self.records.as_mut().ok_or(Error::MissingData("records"))
    }

    /// Returns the records of a classification.
    pub fn classified(
        &self,
        classification: Classification,
    ) -> impl Iterator<Item = &DiffRecord> {
        self.records
            .iter()
            .flatten()
            .filter(move |record| record.classification == classification)
    }

    /// Loads a report from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let data =
            fs::read(path).map_err(|err| Error::Io(path.into(), err))?;
        serde_json::from_slice(&data)
            .map_err(|err| Error::Parse(path.into(), err))
    }

    /// Saves the report to a file, replacing it if it exists.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let data = serde_json::to_vec_pretty(self)
            .map_err(|err| Error::Parse(path.into(), err))?;
        fs::write(path, data).map_err(|err| Error::Io(path.into(), err))
    }

    /// Saves the report to a new file.
    ///
    /// If the file exists, it is moved aside to a file with a `.bak`
    /// extension first.
    pub fn save_new(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if path.exists() {
            let backup = backup_path(path);
            warn!(
                "datafile {} exists, moving it to {}",
                path.display(),
                backup.display()
            );
            fs::rename(path, &backup)
                .map_err(|err| Error::Io(backup.clone(), err))?;
        }
        self.save(path)
    }
}

/// Returns the path of the backup of a file.
fn backup_path(path: &Path) -> PathBuf {
    let mut res = path.as_os_str().to_owned();
    res.push(".bak");
    res.into()
}

//============ Error Types ===================================================

/// A datafile could not be processed.
#[derive(Debug)]
pub enum Error {
    /// The file could not be read or written.
    Io(PathBuf, io::Error),

    /// The file does not contain a valid report.
    Parse(PathBuf, serde_json::Error),

    /// The report lacks data produced by an earlier step.
    MissingData(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(path, err) => write!(f, "{}: {}", path.display(), err),
            Error::Parse(path, err) => {
                write!(f, "{}: invalid datafile: {}", path.display(), err)
            }
            Error::MissingData(what) => write!(
                f,
                "datafile has no {what}, run the preceding steps first"
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(_, err) => Some(err),
            Error::Parse(_, err) => Some(err),
            Error::MissingData(_) => None,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn record() -> DiffRecord {
        DiffRecord::new(
            7,
            Classification::TargetDisagreement,
            vec![
                FieldMismatch::new(FieldName::Flags, "QR RD", "QR RD RA"),
                FieldMismatch::new(
                    FieldName::Answertypes,
                    MismatchValue::List(vec!["A".into()]),
                    MismatchValue::List(Vec::new()),
                ),
            ],
        )
    }

    #[test]
    fn significant_mismatch() {
        let record = record();
        assert_eq!(
            record
                .significant_mismatch(&[
                    FieldName::Timeout,
                    FieldName::Answertypes,
                    FieldName::Flags
                ])
                .map(|m| m.field),
            Some(FieldName::Answertypes)
        );
        assert!(record.significant_mismatch(&[FieldName::Rcode]).is_none());
        assert_eq!(
            record.mismatching_fields().collect::<Vec<_>>(),
            [FieldName::Flags, FieldName::Answertypes]
        );
    }

    #[test]
    fn json_layout() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["classification"], "target_disagreement");
        assert_eq!(json["mismatches"][0]["field"], "flags");
        assert_eq!(json["mismatches"][1]["exp_val"][0], "A");
        assert!(json.get("reproducible").is_none());
        assert!(json.get("repro").is_none());
    }

    #[test]
    fn save_new_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = DiffReport::new(Some(10), Some(25), 3, 3);
        report.save_new(&path).unwrap();
        assert_eq!(DiffReport::load(&path).unwrap().duration(), Some(15));

        report.records = Some(vec![record()]);
        report.save_new(&path).unwrap();
        let backup = DiffReport::load(dir.path().join("report.json.bak"))
            .unwrap();
        assert!(backup.records.is_none());
        let loaded = DiffReport::load(&path).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(
            loaded
                .classified(Classification::TargetDisagreement)
                .count(),
            1
        );
    }

    #[test]
    fn missing_records() {
        let report = DiffReport::default();
        assert!(matches!(report.records(), Err(Error::MissingData(_))));
        assert!(matches!(
            report.summary(),
            Err(Error::MissingData("summary"))
        ));
    }

    #[test]
    fn mismatch_lookup() {
        let field = FieldSummary {
            count: 3,
            mismatches: vec![MismatchSummary {
                exp_val: "NOERROR".into(),
                got_val: "NXDOMAIN".into(),
                count: 3,
                queries: vec![1, 2, 3],
            }],
        };
        let found = field
            .mismatch(&"NOERROR".into(), &"NXDOMAIN".into())
            .unwrap();
        assert_eq!(found.label(), "NOERROR != NXDOMAIN");
        assert!(field
            .mismatch(&"NXDOMAIN".into(), &"NOERROR".into())
            .is_none());
    }
}
