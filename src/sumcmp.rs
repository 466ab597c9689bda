//! Comparing the summaries of two runs.
//!
//! sumcmp shows how the differences of a run changed relative to a
//! reference run of the same queries. All numbers of the diffsum text are
//! accompanied by their change, and the query details mark queries that
//! are new among the differences with `+` and those that disappeared from
//! them with `-`.
//!
//! The query details are based on the example queries that diffsum stored
//! in the summaries. Run diffsum with a limit of zero to compare all
//! queries.

#![warn(missing_docs)]

use crate::config::Config;
use crate::dataformat::{DiffReport, Summary};
use crate::diffsum::{
    count_queries, paired_mismatches, DetailLine, QueryDetails, SummaryText,
};
use crate::store::Store;
use crate::Qid;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

/// The relative change of usable answers that is worth a warning.
pub const USABLE_ANSWERS_WARNING: f64 = 0.05;

//------------ run ------------------------------------------------------------

/// Runs sumcmp.
///
/// Returns the comparison in text form. Query details are only included
/// if a store is given.
pub fn run(
    config: &Config,
    store: Option<&Store>,
    datafile: &Path,
    reference: &Path,
    limit: usize,
) -> Result<String, crate::Error> {
    let report = DiffReport::load(datafile)?;
    let ref_report = DiffReport::load(reference)?;
    let summary = report.summary()?;
    let ref_summary = ref_report.summary()?;

    let change = usable_answers_change(summary, ref_summary);
    if change.abs() >= USABLE_ANSWERS_WARNING {
        warn!("number of usable answers changed by {:.1} %", change * 100.);
    }

    let weights = config.field_weights();
    let mut text = SummaryText::new(&report, summary, weights)
        .with_reference(&ref_report, ref_summary)
        .to_string();
    let store = match store {
        Some(store) => store,
        None => return Ok(text),
    };

    let all = count_queries(store, &example_queries(summary))?;
    let ref_all = count_queries(store, &example_queries(ref_summary))?;
    for field in weights {
        let pairs = paired_mismatches(
            summary.fields.get(field),
            ref_summary.fields.get(field),
        );
        for (current, previous) in pairs {
            let Some(mismatch) = current.or(previous) else {
                continue;
            };
            let queries = match current {
                Some(current) => count_queries(store, &current.queries)?,
                None => BTreeMap::new(),
            };
            let ref_queries = match previous {
                Some(previous) => count_queries(store, &previous.queries)?,
                None => BTreeMap::new(),
            };
            let lines =
                compare_queries(&queries, &all, &ref_queries, &ref_all);
            let details =
                QueryDetails::new(*field, mismatch.label(), lines, limit);
            text.push_str(&details.to_string());
        }
    }
    Ok(text)
}

/// Returns the relative change of the usable answers.
pub fn usable_answers_change(summary: &Summary, reference: &Summary) -> f64 {
    let current = summary.usable_answers() as f64;
    let reference = reference.usable_answers() as f64;
    if reference == 0. {
        if current == 0. {
            0.
        } else {
            f64::INFINITY
        }
    } else {
        (current - reference) / reference
    }
}

/// Returns the example queries of all mismatches of a summary.
fn example_queries(summary: &Summary) -> Vec<Qid> {
    summary
        .fields
        .values()
        .flat_map(|field| &field.mismatches)
        .flat_map(|mismatch| mismatch.queries.iter().copied())
        .collect()
}

/// Marks the queries of a mismatch relative to a reference.
///
/// `queries` and `ref_queries` are the queries of the mismatch in both
/// summaries, `all` and `ref_all` the queries of all their mismatches. A
/// query is new if it appears in none of the reference's mismatches, and
/// gone if it appears in none of the current mismatches. A query that
/// moved here from another mismatch has no marker, one that moved away is
/// left out.
pub fn compare_queries(
    queries: &BTreeMap<String, u64>,
    all: &BTreeMap<String, u64>,
    ref_queries: &BTreeMap<String, u64>,
    ref_all: &BTreeMap<String, u64>,
) -> Vec<DetailLine> {
    let names: BTreeSet<_> = queries.keys().chain(ref_queries.keys()).collect();
    let mut res = Vec::new();
    for name in names {
        let count = queries.get(name).copied().unwrap_or(0);
        if count > 0 && !ref_all.contains_key(name) {
            res.push(('+', count, name.clone()));
        } else if let Some(ref_count) = ref_queries.get(name) {
            if !all.contains_key(name) {
                res.push(('-', *ref_count, name.clone()));
            } else if count > 0 {
                res.push((' ', count, name.clone()));
            }
        } else if count > 0 {
            res.push((' ', count, name.clone()));
        }
    }
    res
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::test::SAMPLE;
    use crate::config::FieldName;
    use crate::dataformat::{FieldSummary, MismatchSummary};
    use crate::qprep::wire_from_text;
    use crate::store::test::store_with_servers;

    fn counts(items: &[(&str, u64)]) -> BTreeMap<String, u64> {
        items.iter().map(|(name, count)| (name.to_string(), *count)).collect()
    }

    #[test]
    fn markers() {
        let queries = counts(&[("new. A", 2), ("same. A", 1)]);
        let all = counts(&[("new. A", 2), ("same. A", 1), ("moved. A", 1)]);
        let ref_queries =
            counts(&[("same. A", 3), ("gone. A", 4), ("moved. A", 1)]);
        let ref_all = ref_queries.clone();
        let lines = compare_queries(&queries, &all, &ref_queries, &ref_all);
        assert_eq!(
            lines,
            [
                ('-', 4, "gone. A".to_string()),
                ('+', 2, "new. A".to_string()),
                (' ', 1, "same. A".to_string()),
            ]
        );
    }

    #[test]
    fn usable_answers() {
        let summary = |total| Summary {
            total,
            matches: total,
            ..Default::default()
        };
        assert_eq!(usable_answers_change(&summary(95), &summary(100)), -0.05);
        assert_eq!(usable_answers_change(&summary(0), &summary(0)), 0.);
        assert!(usable_answers_change(&summary(1), &summary(0)).is_infinite());
    }

    fn report(qids: &[Qid], got: &str) -> DiffReport {
        let mut report = DiffReport::new(Some(0), Some(10), 10, 10);
        let mut summary = Summary {
            total: 10,
            matches: 10 - qids.len() as u64,
            target_disagreements: qids.len() as u64,
            ..Default::default()
        };
        summary.fields.insert(
            FieldName::Rcode,
            FieldSummary {
                count: qids.len() as u64,
                mismatches: vec![MismatchSummary {
                    exp_val: "NOERROR".into(),
                    got_val: got.into(),
                    count: qids.len() as u64,
                    queries: qids.to_vec(),
                }],
            },
        );
        report.summary = Some(summary);
        report
    }

    #[test]
    fn compare_reports() {
        let (dir, store) = store_with_servers(&["kresd", "bind", "unbound"]);
        for (qid, name) in [(1, "a.example."), (2, "b.example."), (3, "c.example.")]
        {
            let wire = wire_from_text(&format!("{name} A")).unwrap();
            store.put_query(qid, &wire).unwrap();
        }
        let datafile = dir.path().join("report.json");
        let reference = dir.path().join("reference.json");
        report(&[1, 2], "NXDOMAIN").save(&datafile).unwrap();
        report(&[2, 3], "SERVFAIL").save(&reference).unwrap();
        let config = Config::from_toml_str(SAMPLE).unwrap();

        let text = run(&config, Some(&store), &datafile, &reference, 0)
            .unwrap();
        assert!(text.contains("Change (%)"));
        assert!(text.contains(
            "== Field \"rcode\", mismatch \"NOERROR != NXDOMAIN\" query details"
        ));
        assert!(text.contains(
            "== Field \"rcode\", mismatch \"NOERROR != SERVFAIL\" query details"
        ));
        assert!(text.to_lowercase().contains("+       1  a.example a"));
        assert!(text.to_lowercase().contains("-       1  c.example a"));
        assert!(text.to_lowercase().contains("\n        1  b.example a"));
        assert!(!text.to_lowercase().contains("-       1  b.example a"));

        let without = run(&config, None, &datafile, &reference, 0).unwrap();
        assert!(!without.contains("query details"));

        DiffReport::default().save(&reference).unwrap();
        assert!(matches!(
            run(&config, None, &datafile, &reference, 0),
            Err(crate::Error::Datafile(_))
        ));
    }
}
