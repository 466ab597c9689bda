//! Re-running queries to check whether differences are reproducible.
//!
//! Some target disagreements are flukes: a server had a network hiccup or
//! some cached data expired between the answers. diffrepro sends the
//! queries of target disagreements to all servers again and keeps track of
//! the outcome in the record's
//! [`ReproCounter`][crate::dataformat::ReproCounter]. A difference is
//! reproducible if every re-run showed exactly the same mismatching fields.
//!
//! In sequential mode, the servers are restarted before every query using
//! their restart scripts so that answers come from a clean cache.

#![warn(missing_docs)]

use crate::config::Config;
use crate::dataformat::{Classification, DiffRecord, DiffReport, FieldMismatch};
use crate::matcher::compare;
use crate::orchestrator::{self, dispatch, Job};
use crate::sendrecv::Worker;
use crate::store::{AnswerState, Reply, Store};
use crate::{Error, Qid};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

/// The result of classifying the fresh answers to a query.
type Outcome = Option<(Classification, Vec<FieldMismatch>)>;

//------------ run ------------------------------------------------------------

/// Runs diffrepro.
///
/// The updated records are written back to the datafile even if the run
/// fails halfway.
pub async fn run(
    config: Arc<Config>,
    store: Arc<Store>,
    datafile: &Path,
    sequential: bool,
) -> Result<DiffReport, Error> {
    let mut report = DiffReport::load(datafile)?;
    let selected = select(report.records()?);
    info!(
        "re-running {} target disagreements {}",
        selected.len(),
        if sequential { "sequentially" } else { "in parallel" }
    );

    let jobs = {
        let store = store.clone();
        spawn_blocking(move || load_jobs(&store, selected)).await??
    };
    let outcomes = Arc::new(Mutex::new(HashMap::new()));
    let res = if sequential {
        run_sequential(&config, jobs, &outcomes).await
    } else {
        run_parallel(&config, jobs, &outcomes).await
    };

    let outcomes = std::mem::take(&mut *outcomes.lock());
    let mut reproducible = 0;
    for record in report.records_mut()? {
        if let Some(outcome) = outcomes.get(&record.qid) {
            update_record(record, outcome.clone());
            if record.reproducible == Some(true) {
                reproducible += 1;
            }
        }
    }
    info!(
        "{} of {} re-run differences reproduced",
        reproducible,
        outcomes.len()
    );
    report.save(datafile)?;
    res?;
    Ok(report)
}

/// Selects the records to re-run in random order.
///
/// These are target disagreements whose earlier re-runs, if any, always
/// had the other servers agree and always showed the difference again.
/// A difference that failed to show up once is settled as not
/// reproducible.
pub fn select(records: &[DiffRecord]) -> Vec<Qid> {
    let mut res: Vec<_> = records
        .iter()
        .filter(|record| {
            record.classification == Classification::TargetDisagreement
                && record.repro.is_upstream_stable()
                && record.repro.is_verified()
        })
        .map(|record| record.qid)
        .collect();
    res.shuffle(&mut rand::thread_rng());
    res
}

fn load_jobs(store: &Store, qids: Vec<Qid>) -> Result<Vec<Job>, Error> {
    let mut res = Vec::with_capacity(qids.len());
    for qid in qids {
        match store.get_query(qid)? {
            Some(wire) => res.push(Job { qid, wire, first: 0 }),
            None => warn!("query {qid} missing from the store, skipping"),
        }
    }
    Ok(res)
}

/// Classifies fresh replies from all servers.
fn classify(config: &Config, replies: Vec<Reply>) -> Outcome {
    let answers: Vec<_> =
        replies.into_iter().map(AnswerState::Replied).collect();
    compare(&answers, config.target(), config.criteria())
}

async fn run_parallel(
    config: &Arc<Config>,
    jobs: Vec<Job>,
    outcomes: &Arc<Mutex<HashMap<Qid, Outcome>>>,
) -> Result<(), Error> {
    let (tx, rx) = mpsc::channel(config.sendrecv().jobs() * 2);
    let producer = tokio::spawn(async move {
        for job in jobs {
            if tx.send(job).await.is_err() {
                break;
            }
        }
    });
    let handler = {
        let config = config.clone();
        let outcomes = outcomes.clone();
        move |job: Job, replies: Vec<Reply>| {
            let outcome = classify(&config, replies);
            outcomes.lock().insert(job.qid, outcome);
            Ok(())
        }
    };
    let res = dispatch(config, config.sendrecv().jobs(), rx, None, handler)
        .await;
    producer.abort();
    Ok(res?)
}

async fn run_sequential(
    config: &Config,
    jobs: Vec<Job>,
    outcomes: &Mutex<HashMap<Qid, Outcome>>,
) -> Result<(), Error> {
    for job in jobs {
        restart_servers(config).await;
        // Restarted servers have dropped our streams.
        let mut worker = Worker::new(config.servers(), config.sendrecv())
            .map_err(orchestrator::Error::Connect)?;
        debug!("re-running query {}", job.qid);
        let replies = worker.send_recv(&job.wire, 0).await;
        outcomes.lock().insert(job.qid, classify(config, replies));
    }
    Ok(())
}

/// Runs the restart scripts of all servers.
///
/// Failing scripts are only logged.
pub async fn restart_servers(config: &Config) {
    for server in config.servers() {
        let script = match server.restart_script() {
            Some(script) => script,
            None => continue,
        };
        match Command::new(script).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(
                "restart script {} for {} failed: {}",
                script.display(),
                server.name(),
                status
            ),
            Err(err) => warn!(
                "cannot run restart script {} for {}: {}",
                script.display(),
                server.name(),
                err
            ),
        }
    }
}

/// Updates a record with the outcome of a re-run.
///
/// A re-run verifies the difference if the other servers agree and the
/// target differs from them in exactly the same fields as before.
pub fn update_record(record: &mut DiffRecord, outcome: Outcome) {
    let same_fields = match &outcome {
        Some((Classification::TargetDisagreement, mismatches)) => record
            .mismatching_fields()
            .eq(mismatches.iter().map(|m| m.field)),
        _ => false,
    };
    let repro = &mut record.repro;
    repro.retries += 1;
    match outcome {
        None | Some((Classification::UpstreamUnstable, _)) => {}
        Some((Classification::Match, _)) => repro.upstream_stable += 1,
        Some((Classification::TargetDisagreement, _)) => {
            repro.upstream_stable += 1;
            if same_fields {
                repro.verified += 1;
            } else {
                repro.different_failure += 1;
            }
        }
    }
    record.reproducible = Some(repro.verified == repro.retries);
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::FieldName;
    use crate::dataformat::ReproCounter;

    fn disagreement(qid: Qid) -> DiffRecord {
        DiffRecord::new(
            qid,
            Classification::TargetDisagreement,
            vec![FieldMismatch::new(FieldName::Rcode, "NOERROR", "NXDOMAIN")],
        )
    }

    fn outcome(fields: &[FieldName]) -> Outcome {
        Some((
            Classification::TargetDisagreement,
            fields
                .iter()
                .map(|field| FieldMismatch::new(*field, "a", "b"))
                .collect(),
        ))
    }

    #[test]
    fn verified() {
        let mut record = disagreement(1);
        update_record(&mut record, outcome(&[FieldName::Rcode]));
        update_record(&mut record, outcome(&[FieldName::Rcode]));
        assert_eq!(
            record.repro,
            ReproCounter {
                retries: 2,
                upstream_stable: 2,
                verified: 2,
                different_failure: 0
            }
        );
        assert_eq!(record.reproducible, Some(true));
    }

    #[test]
    fn not_reproduced() {
        let mut record = disagreement(1);
        update_record(&mut record, outcome(&[FieldName::Rcode]));
        update_record(
            &mut record,
            Some((Classification::Match, Vec::new())),
        );
        assert_eq!(record.repro.verified, 1);
        assert_eq!(record.repro.upstream_stable, 2);
        assert_eq!(record.reproducible, Some(false));

        let mut record = disagreement(2);
        update_record(
            &mut record,
            outcome(&[FieldName::Rcode, FieldName::Flags]),
        );
        assert_eq!(record.repro.different_failure, 1);
        assert_eq!(record.reproducible, Some(false));
    }

    #[test]
    fn unstable_rerun() {
        let mut record = disagreement(1);
        update_record(
            &mut record,
            Some((Classification::UpstreamUnstable, Vec::new())),
        );
        assert_eq!(record.repro.retries, 1);
        assert_eq!(record.repro.upstream_stable, 0);
        assert_eq!(record.reproducible, Some(false));
        assert!(select(&[record]).is_empty());
    }

    #[test]
    fn selection() {
        let mut verified = disagreement(4);
        update_record(&mut verified, outcome(&[FieldName::Rcode]));
        let mut settled = disagreement(5);
        update_record(&mut settled, outcome(&[FieldName::Rcode]));
        update_record(&mut settled, Some((Classification::Match, Vec::new())));
        assert_eq!(settled.reproducible, Some(false));

        let records = vec![
            disagreement(1),
            DiffRecord::new(2, Classification::UpstreamUnstable, Vec::new()),
            disagreement(3),
            verified,
            settled,
        ];
        let mut selected = select(&records);
        selected.sort_unstable();
        assert_eq!(selected, [1, 3, 4]);
    }
}
