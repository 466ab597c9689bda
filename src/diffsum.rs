//! Summarizing the differences of a run.
//!
//! The summary puts every classified query into exactly one bucket. Target
//! disagreements are attributed to their most significant mismatching
//! field according to the configured field weights, so that the counts of
//! all fields add up to the number of target disagreements.
//!
//! A reference report can be given to exclude queries that were already
//! known to differ. These are counted as manually ignored.

#![warn(missing_docs)]

use crate::config::{Config, FieldName};
use crate::dataformat::{
    Classification, DiffRecord, DiffReport, FieldMismatch, FieldSummary,
    MismatchSummary, MismatchValue, Summary,
};
use crate::matcher::describe_query;
use crate::store::Store;
use crate::Qid;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::{error, fmt};
use tracing::warn;

/// The default number of example queries per mismatch.
pub const DEFAULT_LIMIT: usize = 10;

//------------ Options --------------------------------------------------------

/// Options for summarizing a report.
#[derive(Clone, Debug)]
pub struct Options {
    /// The number of example queries per mismatch; zero means all.
    pub limit: usize,

    /// A reference report of an earlier run.
    pub reference: Option<PathBuf>,

    /// Ignore queries that were upstream unstable in the reference.
    pub without_ref_unstable: bool,

    /// Ignore queries that were target disagreements in the reference.
    pub without_ref_failing: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            reference: None,
            without_ref_unstable: false,
            without_ref_failing: false,
        }
    }
}

//------------ run ------------------------------------------------------------

/// Runs diffsum.
///
/// Stores the summary in the datafile and returns it in text form. Query
/// details are only included if a store is given.
pub fn run(
    config: &Config,
    store: Option<&Store>,
    datafile: &Path,
    options: &Options,
) -> Result<String, crate::Error> {
    let mut report = DiffReport::load(datafile)?;
    if report.total_answers.unwrap_or(0) == 0 {
        warn!("no answers in {}", datafile.display());
    }
    let ignored = match options.reference.as_ref() {
        Some(path) => match DiffReport::load(path) {
            Ok(reference) => ignore_set(
                &reference,
                options.without_ref_unstable,
                options.without_ref_failing,
            ),
            Err(err) => {
                warn!("cannot use reference report: {err}");
                HashSet::new()
            }
        },
        None => HashSet::new(),
    };

    let mut summary = summarize(&report, config.field_weights(), &ignored)?;
    let mut text = render(&report, &summary, config.field_weights());
    if let Some(store) = store {
        for (field, field_summary) in ordered(&summary, config.field_weights())
        {
            for mismatch in &field_summary.mismatches {
                let counts = count_queries(store, &mismatch.queries)?;
                let details = QueryDetails::unmarked(
                    field,
                    mismatch.label(),
                    counts,
                    options.limit,
                );
                text.push_str(&details.to_string());
            }
        }
    }
    truncate_examples(&mut summary, options.limit);
    report.summary = Some(summary);
    report.save(datafile)?;
    Ok(text)
}

/// Returns the queries to ignore because of a reference report.
pub fn ignore_set(
    reference: &DiffReport,
    without_unstable: bool,
    without_failing: bool,
) -> HashSet<Qid> {
    reference
        .records
        .iter()
        .flatten()
        .filter(|record| match record.classification {
            Classification::UpstreamUnstable => without_unstable,
            Classification::TargetDisagreement => {
                without_failing && record.reproducible != Some(false)
            }
            Classification::Match => false,
        })
        .map(|record| record.qid)
        .collect()
}

//------------ summarize ------------------------------------------------------

/// Summarizes the records of a report.
///
/// The example queries of the result are complete, use
/// [`truncate_examples`] to limit them.
pub fn summarize(
    report: &DiffReport,
    field_weights: &[FieldName],
    ignored: &HashSet<Qid>,
) -> Result<Summary, Error> {
    let records = report
        .records()
        .map_err(|_| Error::MissingRecords)?;
    let mut res = Summary {
        matches: report.matches.unwrap_or(0),
        ..Default::default()
    };
    let mut buckets: HashMap<FieldName, Bucket> = HashMap::new();
    for record in records {
        if record.classification == Classification::Match {
            res.matches += 1;
        } else if ignored.contains(&record.qid) {
            res.manually_ignored += 1;
        } else if record.classification == Classification::UpstreamUnstable
            || !record.repro.is_upstream_stable()
        {
            res.upstream_unstable += 1;
        } else if record.reproducible == Some(false) {
            res.not_reproducible += 1;
        } else {
            let mismatch = significant(record, field_weights)?;
            res.target_disagreements += 1;
            buckets
                .entry(mismatch.field)
                .or_default()
                .entry((mismatch.exp_val.clone(), mismatch.got_val.clone()))
                .or_default()
                .push(record.qid);
        }
    }
    res.total = res.matches
        + res.upstream_unstable
        + res.not_reproducible
        + res.target_disagreements
        + res.manually_ignored;
    res.fields = buckets
        .into_iter()
        .map(|(field, bucket)| (field, field_summary(bucket)))
        .collect();
    Ok(res)
}

/// The queries of a field per value pair.
type Bucket = HashMap<(MismatchValue, MismatchValue), Vec<Qid>>;

fn significant<'a>(
    record: &'a DiffRecord,
    field_weights: &[FieldName],
) -> Result<&'a FieldMismatch, Error> {
    if let Some(field) = record
        .mismatching_fields()
        .find(|field| !field_weights.contains(field))
    {
        return Err(Error::FieldNotWeighted {
            qid: record.qid,
            field,
        });
    }
    record
        .significant_mismatch(field_weights)
        .ok_or(Error::NoMismatch(record.qid))
}

fn field_summary(bucket: Bucket) -> FieldSummary {
    let mut mismatches: Vec<_> = bucket
        .into_iter()
        .map(|((exp_val, got_val), mut queries)| {
            queries.sort_unstable();
            MismatchSummary {
                exp_val,
                got_val,
                count: queries.len() as u64,
                queries,
            }
        })
        .collect();
    mismatches.sort_by(|left, right| {
        right
            .count
            .cmp(&left.count)
            .then_with(|| left.exp_val.cmp(&right.exp_val))
            .then_with(|| left.got_val.cmp(&right.got_val))
    });
    FieldSummary {
        count: mismatches.iter().map(|m| m.count).sum(),
        mismatches,
    }
}

/// Limits the example queries of every mismatch.
///
/// The limit applies to each pair of differing values separately, so a
/// field keeps up to `limit` queries per mismatch. A limit of zero keeps
/// all queries.
pub fn truncate_examples(summary: &mut Summary, limit: usize) {
    if limit == 0 {
        return;
    }
    for field in summary.fields.values_mut() {
        for mismatch in &mut field.mismatches {
            mismatch.queries.truncate(limit);
        }
    }
}

/// Returns the fields of a summary in the order of the field weights.
fn ordered<'a>(
    summary: &'a Summary,
    field_weights: &'a [FieldName],
) -> impl Iterator<Item = (FieldName, &'a FieldSummary)> + 'a {
    field_weights
        .iter()
        .filter_map(|field| Some((*field, summary.fields.get(field)?)))
}

//------------ Rendering ------------------------------------------------------

/// Renders the statistics of a report as text.
pub fn render(
    report: &DiffReport,
    summary: &Summary,
    field_weights: &[FieldName],
) -> String {
    SummaryText::new(report, summary, field_weights).to_string()
}

/// The text form of a summary.
///
/// With a reference, every number is followed by its change relative to
/// the reference, and fields and mismatches only present in the reference
/// are listed with a count of zero.
#[derive(Clone, Copy, Debug)]
pub struct SummaryText<'a> {
    report: &'a DiffReport,
    summary: &'a Summary,
    field_weights: &'a [FieldName],
    reference: Option<(&'a DiffReport, &'a Summary)>,
}

impl<'a> SummaryText<'a> {
    /// Creates the text of a summary.
    pub fn new(
        report: &'a DiffReport,
        summary: &'a Summary,
        field_weights: &'a [FieldName],
    ) -> Self {
        Self {
            report,
            summary,
            field_weights,
            reference: None,
        }
    }

    /// Compares the summary against the summary of a reference report.
    pub fn with_reference(
        mut self,
        report: &'a DiffReport,
        summary: &'a Summary,
    ) -> Self {
        self.reference = Some((report, summary));
        self
    }

    fn ref_summary(&self) -> Option<&'a Summary> {
        self.reference.map(|(_, summary)| summary)
    }

    fn fmt_global(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queries = self.report.total_queries.unwrap_or(0);
        let answers = total_answers(self.report, self.summary);
        let reference = self.reference;
        writeln!(f, "== Global statistics")?;
        if let Some(duration) = self.report.duration() {
            StatsLine::new("duration", duration.into())
                .additional("seconds")
                .reference(
                    reference
                        .and_then(|(report, _)| report.duration())
                        .map(Into::into),
                )
                .fmt(f)?;
        }
        StatsLine::new("queries", queries)
            .reference(reference.map(|(report, _)| {
                report.total_queries.unwrap_or(0)
            }))
            .fmt(f)?;
        StatsLine::new("answers", answers)
            .relative(queries, "of queries")
            .reference(
                reference
                    .map(|(report, summary)| total_answers(report, summary)),
            )
            .fmt(f)?;
        writeln!(f)
    }

    fn fmt_differences(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.summary;
        let reference = self.ref_summary();
        let answers = total_answers(self.report, summary);
        writeln!(f, "== Differences statistics")?;
        StatsLine::new("upstream unstable", summary.upstream_unstable)
            .relative(answers, "of answers (ignoring)")
            .reference(reference.map(|r| r.upstream_unstable))
            .fmt(f)?;
        StatsLine::new("not 100% reproducible", summary.not_reproducible)
            .relative(answers, "of answers (ignoring)")
            .reference(reference.map(|r| r.not_reproducible))
            .fmt(f)?;
        if summary.manually_ignored > 0 {
            StatsLine::new("manually ignored", summary.manually_ignored)
                .relative(answers, "of answers (ignoring)")
                .reference(reference.map(|r| r.manually_ignored))
                .fmt(f)?;
        }
        StatsLine::new("target disagrees", summary.target_disagreements)
            .relative(summary.usable_answers(), "of not ignored answers")
            .reference(reference.map(|r| r.target_disagreements))
            .fmt(f)?;
        writeln!(f)
    }

    fn fmt_fields(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reference = self.ref_summary();
        let mut fields: Vec<_> = self
            .fields()
            .map(|field| (field, self.summary.field_count(field)))
            .collect();
        fields.sort_by(|left, right| right.1.cmp(&left.1));
        writeln!(f, "== Target Disagreements")?;
        write!(f, "{:<15} {:>8}  {:>15}", "Field", "Count", "% of mismatches")?;
        if reference.is_some() {
            write!(f, "  {:>8}  {:>11}", "Change", "Change (%)")?;
        }
        writeln!(f)?;
        for (field, count) in fields {
            write!(
                f,
                "{:<15} {:>8}  {:>15.2}",
                field.as_str(),
                count,
                percent(count, self.summary.target_disagreements)
            )?;
            if let Some(reference) = reference {
                fmt_change(f, count, reference.field_count(field))?;
            }
            writeln!(f)?;
        }
        writeln!(f)
    }

    fn fmt_mismatches(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reference = self.ref_summary();
        for field in self.fields() {
            writeln!(f, "== Field \"{field}\" mismatch statistics")?;
            write!(
                f,
                "{:<30} {:<30} {:>8}  {:>15}",
                "Expected", "Got", "Count", "% of mismatches"
            )?;
            if reference.is_some() {
                write!(f, "  {:>8}  {:>11}", "Change", "Change (%)")?;
            }
            writeln!(f)?;
            let pairs = paired_mismatches(
                self.summary.fields.get(&field),
                reference.and_then(|r| r.fields.get(&field)),
            );
            for (current, previous) in pairs {
                let Some(mismatch) = current.or(previous) else {
                    continue;
                };
                let count = current.map(|m| m.count).unwrap_or(0);
                write!(
                    f,
                    "{:<30} {:<30} {:>8}  {:>15.2}",
                    mismatch.exp_val.to_string(),
                    mismatch.got_val.to_string(),
                    count,
                    percent(count, self.summary.target_disagreements)
                )?;
                if reference.is_some() {
                    let ref_count = previous.map(|m| m.count).unwrap_or(0);
                    fmt_change(f, count, ref_count)?;
                }
                writeln!(f)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }

    /// Returns the fields with disagreements in field weight order.
    fn fields(&self) -> impl Iterator<Item = FieldName> + 'a {
        let summary = self.summary;
        let reference = self.ref_summary();
        self.field_weights.iter().copied().filter(move |field| {
            summary.fields.contains_key(field)
                || reference.is_some_and(|r| r.fields.contains_key(field))
        })
    }
}

impl fmt::Display for SummaryText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_global(f)?;
        self.fmt_differences(f)?;
        let reference_disagrees = self
            .ref_summary()
            .is_some_and(|r| r.target_disagreements > 0);
        if self.summary.target_disagreements == 0 && !reference_disagrees {
            return Ok(());
        }
        self.fmt_fields(f)?;
        self.fmt_mismatches(f)
    }
}

/// Pairs the mismatches of a field with those of a reference.
///
/// The mismatches of the current summary come first in their order, then
/// those only present in the reference.
pub fn paired_mismatches<'a>(
    current: Option<&'a FieldSummary>,
    reference: Option<&'a FieldSummary>,
) -> Vec<(Option<&'a MismatchSummary>, Option<&'a MismatchSummary>)> {
    let mut res: Vec<_> = current
        .iter()
        .flat_map(|field| &field.mismatches)
        .map(|mismatch| {
            let previous = reference.and_then(|field| {
                field.mismatch(&mismatch.exp_val, &mismatch.got_val)
            });
            (Some(mismatch), previous)
        })
        .collect();
    for mismatch in reference.iter().flat_map(|field| &field.mismatches) {
        let known = current.is_some_and(|field| {
            field.mismatch(&mismatch.exp_val, &mismatch.got_val).is_some()
        });
        if !known {
            res.push((None, Some(mismatch)));
        }
    }
    res
}

fn total_answers(report: &DiffReport, summary: &Summary) -> u64 {
    report.total_answers.unwrap_or(summary.total)
}

//------------ StatsLine ------------------------------------------------------

/// A line of the global or differences statistics.
struct StatsLine<'a> {
    description: &'a str,
    number: u64,
    relative: Option<u64>,
    additional: Option<&'a str>,
    reference: Option<u64>,
}

impl<'a> StatsLine<'a> {
    fn new(description: &'a str, number: u64) -> Self {
        Self {
            description,
            number,
            relative: None,
            additional: None,
            reference: None,
        }
    }

    fn relative(mut self, total: u64, additional: &'a str) -> Self {
        self.relative = Some(total);
        self.additional = Some(additional);
        self
    }

    fn additional(mut self, additional: &'a str) -> Self {
        self.additional = Some(additional);
        self
    }

    fn reference(mut self, reference: Option<u64>) -> Self {
        self.reference = reference;
        self
    }

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut line = format!("{:21}   {:>8}  ", self.description, self.number);
        match self.relative {
            Some(total) => {
                write!(line, "{:>6.2} %", percent(self.number, total))?
            }
            None => line.push_str(&" ".repeat(8)),
        }
        write!(line, " {:30}", self.additional.unwrap_or(""))?;
        if let Some(reference) = self.reference {
            let diff = signed_diff(self.number, reference);
            write!(line, " {:>+6} {:>+7.2} %", diff, change(diff, reference))?;
        }
        writeln!(f, "{}", line.trim_end())
    }
}

fn fmt_change(
    f: &mut fmt::Formatter<'_>,
    count: u64,
    reference: u64,
) -> fmt::Result {
    let diff = signed_diff(count, reference);
    write!(f, "  {:>+8}  {:>+9.2} %", diff, change(diff, reference))
}

fn signed_diff(number: u64, reference: u64) -> i64 {
    i64::try_from(number)
        .unwrap_or(i64::MAX)
        .saturating_sub(i64::try_from(reference).unwrap_or(i64::MAX))
}

/// Returns a change relative to a reference value in percent.
///
/// A change from zero is infinite, no change from zero is NaN.
fn change(diff: i64, reference: u64) -> f64 {
    diff as f64 * 100. / reference as f64
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.
    } else {
        part as f64 * 100. / total as f64
    }
}

//------------ Query details --------------------------------------------------

/// A line of query details: a change marker, a count and the query.
///
/// The marker is `+` for a query new among the differences, `-` for one
/// that no longer differs, and a blank otherwise.
pub type DetailLine = (char, u64, String);

/// Counts the questions of a set of queries.
///
/// Returns `qname qtype` with the number of queries asking it.
pub fn count_queries(
    store: &Store,
    qids: &[Qid],
) -> Result<BTreeMap<String, u64>, crate::store::Error> {
    let mut res = BTreeMap::new();
    for qid in qids {
        let text = match store.get_query(*qid)? {
            Some(wire) => describe_query(&wire)
                .unwrap_or_else(|| String::from("<malformed query>")),
            None => {
                warn!("query {qid} missing from the store");
                continue;
            }
        };
        *res.entry(text).or_insert(0u64) += 1;
    }
    Ok(res)
}

/// The queries of one mismatch.
#[derive(Clone, Debug)]
pub struct QueryDetails {
    field: FieldName,
    mismatch: String,
    lines: Vec<DetailLine>,
    limit: usize,
}

impl QueryDetails {
    /// Creates the details of a mismatch.
    ///
    /// The lines are ordered by marker, `+` first, then by count. A limit
    /// of zero shows all lines.
    pub fn new(
        field: FieldName,
        mismatch: String,
        mut lines: Vec<DetailLine>,
        limit: usize,
    ) -> Self {
        lines.sort_by(|left, right| {
            marker_rank(left.0)
                .cmp(&marker_rank(right.0))
                .then_with(|| right.1.cmp(&left.1))
                .then_with(|| left.2.cmp(&right.2))
        });
        Self {
            field,
            mismatch,
            lines,
            limit,
        }
    }

    /// Creates the details of a mismatch without a reference.
    pub fn unmarked(
        field: FieldName,
        mismatch: String,
        counts: BTreeMap<String, u64>,
        limit: usize,
    ) -> Self {
        let lines = counts
            .into_iter()
            .map(|(query, count)| (' ', count, query))
            .collect();
        Self::new(field, mismatch, lines, limit)
    }

    /// Returns the lines in display order.
    pub fn lines(&self) -> &[DetailLine] {
        &self.lines
    }
}

fn marker_rank(marker: char) -> u8 {
    match marker {
        '+' => 0,
        ' ' => 1,
        '-' => 2,
        _ => 3,
    }
}

impl fmt::Display for QueryDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.limit == 0 {
            self.lines.len()
        } else {
            self.limit.min(self.lines.len())
        };
        writeln!(
            f,
            "== Field \"{}\", mismatch \"{}\" query details",
            self.field, self.mismatch
        )?;
        writeln!(f, "  {:>7}  Query", "Count")?;
        for (marker, count, query) in &self.lines[..shown] {
            writeln!(f, "{marker} {count:>7}  {query}")?;
        }
        if shown < self.lines.len() {
            writeln!(f, "x {:>7}  queries omitted", self.lines.len() - shown)?;
        }
        writeln!(f)
    }
}

//============ Error Types ===================================================

/// The records of a report cannot be summarized.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The report has no records, msgdiff has not run.
    MissingRecords,

    /// A mismatching field is missing from the field weights.
    FieldNotWeighted {
        /// The query with the mismatch.
        qid: Qid,

        /// The field.
        field: FieldName,
    },

    /// A target disagreement without mismatches.
    NoMismatch(Qid),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingRecords => f.write_str(
                "datafile has no diff records, run msgdiff first",
            ),
            Error::FieldNotWeighted { qid, field } => write!(
                f,
                "field '{field}' of query {qid} is missing from \
                 report.field_weights"
            ),
            Error::NoMismatch(qid) => {
                write!(f, "target disagreement {qid} has no mismatches")
            }
        }
    }
}

impl error::Error for Error {}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataformat::ReproCounter;

    const WEIGHTS: &[FieldName] = &[
        FieldName::Timeout,
        FieldName::Malformed,
        FieldName::Rcode,
        FieldName::Flags,
        FieldName::Answertypes,
    ];

    fn disagreement(qid: Qid, fields: &[(FieldName, &str, &str)]) -> DiffRecord {
        DiffRecord::new(
            qid,
            Classification::TargetDisagreement,
            fields
                .iter()
                .map(|(field, exp, got)| FieldMismatch::new(*field, *exp, *got))
                .collect(),
        )
    }

    fn report() -> DiffReport {
        let mut not_repro = disagreement(5, &[(FieldName::Rcode, "NOERROR", "SERVFAIL")]);
        not_repro.repro = ReproCounter {
            retries: 2,
            upstream_stable: 2,
            verified: 1,
            different_failure: 0,
        };
        not_repro.reproducible = Some(false);
        let mut unstable_repro =
            disagreement(6, &[(FieldName::Rcode, "NOERROR", "SERVFAIL")]);
        unstable_repro.repro = ReproCounter {
            retries: 1,
            upstream_stable: 0,
            verified: 0,
            different_failure: 0,
        };
        unstable_repro.reproducible = Some(false);

        let mut report = DiffReport::new(Some(0), Some(60), 12, 11);
        report.matches = Some(4);
        report.records = Some(vec![
            disagreement(
                1,
                &[
                    (FieldName::Flags, "QR RD RA", "QR RD"),
                    (FieldName::Rcode, "NOERROR", "NXDOMAIN"),
                ],
            ),
            disagreement(2, &[(FieldName::Rcode, "NOERROR", "NXDOMAIN")]),
            disagreement(3, &[(FieldName::Timeout, "answer", "timeout")]),
            DiffRecord::new(4, Classification::UpstreamUnstable, Vec::new()),
            not_repro,
            unstable_repro,
            disagreement(7, &[(FieldName::Rcode, "NOERROR", "REFUSED")]),
        ]);
        report
    }

    #[test]
    fn buckets() {
        let summary = summarize(&report(), WEIGHTS, &HashSet::new()).unwrap();
        assert_eq!(summary.matches, 4);
        assert_eq!(summary.upstream_unstable, 2);
        assert_eq!(summary.not_reproducible, 1);
        assert_eq!(summary.target_disagreements, 4);
        assert_eq!(summary.manually_ignored, 0);
        assert_eq!(summary.total, 11);
        assert_eq!(
            summary.total,
            summary.matches
                + summary.upstream_unstable
                + summary.not_reproducible
                + summary.target_disagreements
                + summary.manually_ignored
        );
        assert_eq!(
            summary.fields.values().map(|f| f.count).sum::<u64>(),
            summary.target_disagreements
        );

        let rcode = &summary.fields[&FieldName::Rcode];
        assert_eq!(rcode.count, 3);
        assert_eq!(rcode.mismatches[0].queries, [1, 2]);
        assert_eq!(rcode.mismatches[1].queries, [7]);
        assert_eq!(summary.field_count(FieldName::Timeout), 1);
        assert_eq!(summary.field_count(FieldName::Flags), 0);
    }

    #[test]
    fn reference_ignores() {
        let mut reference = DiffReport::default();
        reference.records = Some(vec![
            DiffRecord::new(4, Classification::UpstreamUnstable, Vec::new()),
            disagreement(2, &[(FieldName::Rcode, "NOERROR", "NXDOMAIN")]),
        ]);
        let ignored = ignore_set(&reference, true, true);
        assert_eq!(ignored, HashSet::from([2, 4]));
        assert_eq!(ignore_set(&reference, false, true), HashSet::from([2]));

        let summary = summarize(&report(), WEIGHTS, &ignored).unwrap();
        assert_eq!(summary.manually_ignored, 2);
        assert_eq!(summary.upstream_unstable, 1);
        assert_eq!(summary.target_disagreements, 3);
        assert_eq!(summary.total, 11);
        assert_eq!(summary.usable_answers(), 11 - 1 - 1 - 2);
    }

    #[test]
    fn field_not_weighted() {
        let err = summarize(&report(), &[FieldName::Rcode], &HashSet::new())
            .unwrap_err();
        assert_eq!(
            err,
            Error::FieldNotWeighted {
                qid: 1,
                field: FieldName::Flags
            }
        );
    }

    #[test]
    fn truncation() {
        let mut summary =
            summarize(&report(), WEIGHTS, &HashSet::new()).unwrap();
        truncate_examples(&mut summary, 1);
        let rcode = &summary.fields[&FieldName::Rcode];
        assert_eq!(rcode.mismatches.len(), 2);
        assert_eq!(rcode.mismatches[0].queries, [1]);
        assert_eq!(rcode.mismatches[0].count, 2);
        assert_eq!(rcode.mismatches[1].queries, [7]);
        assert_eq!(rcode.count, 3);

        let mut unlimited =
            summarize(&report(), WEIGHTS, &HashSet::new()).unwrap();
        truncate_examples(&mut unlimited, 0);
        assert_eq!(
            unlimited.fields[&FieldName::Rcode].mismatches[0].queries,
            [1, 2]
        );
    }

    #[test]
    fn text() {
        let report = report();
        let summary = summarize(&report, WEIGHTS, &HashSet::new()).unwrap();
        let text = render(&report, &summary, WEIGHTS);
        assert!(text.starts_with("== Global statistics\n"));
        assert!(text.contains(&format!(
            "{:21}   {:>8}  {:8} seconds\n",
            "duration", 60, ""
        )));
        assert!(text.contains(&format!(
            "{:21}   {:>8}  {:>6.2} % of answers (ignoring)\n",
            "upstream unstable", 2, 100. * 2. / 11.
        )));
        assert!(!text.contains("Change"));
        assert!(text.contains("== Field \"rcode\" mismatch statistics"));
        assert!(!text.contains("== Field \"flags\""));
    }

    #[test]
    fn text_with_reference() {
        let report = report();
        let summary = summarize(&report, WEIGHTS, &HashSet::new()).unwrap();
        let mut reference = report.clone();
        reference.records = Some(vec![disagreement(
            1,
            &[(FieldName::Flags, "QR RD RA", "QR")],
        )]);
        let ref_summary =
            summarize(&reference, WEIGHTS, &HashSet::new()).unwrap();
        let text = SummaryText::new(&report, &summary, WEIGHTS)
            .with_reference(&reference, &ref_summary)
            .to_string();
        assert!(text.contains("Change (%)"));
        assert!(text.contains(&format!("{:>+6} {:>+7.2} %\n", 3, 300.)));
        assert!(text.contains(&format!(
            "{:<15} {:>8}  {:>15.2}  {:>+8}  {:>+9.2} %\n",
            "flags", 0, 0., -1, -100.
        )));
        assert!(text.contains("== Field \"flags\" mismatch statistics"));
        assert!(text.contains(&format!(
            "{:<30} {:<30} {:>8}",
            "QR RD RA", "QR", 0
        )));
    }

    #[test]
    fn details_order_and_limit() {
        let details = QueryDetails::new(
            FieldName::Rcode,
            "NOERROR != NXDOMAIN".into(),
            vec![
                ('-', 5, "gone.example. A".into()),
                (' ', 1, "a.example. A".into()),
                ('+', 2, "new.example. A".into()),
                (' ', 7, "b.example. A".into()),
            ],
            3,
        );
        let order: Vec<_> =
            details.lines().iter().map(|line| (line.0, line.1)).collect();
        assert_eq!(order, [('+', 2), (' ', 7), (' ', 1), ('-', 5)]);
        let text = details.to_string();
        assert!(text.starts_with(
            "== Field \"rcode\", mismatch \"NOERROR != NXDOMAIN\" \
             query details\n"
        ));
        assert!(text.contains("+       2  new.example. A\n"));
        assert!(text.contains("x       1  queries omitted\n"));
        assert!(!text.contains("gone.example"));
    }
}
