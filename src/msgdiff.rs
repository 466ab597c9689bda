//! Classifying the answers of all queries.
//!
//! msgdiff reads the answers of every query from the store, compares them
//! using the criteria of the configuration, and writes the resulting diff
//! records into the datafile. Only records that are not a match are kept,
//! matches are merely counted.

#![warn(missing_docs)]

use crate::config::Config;
use crate::dataformat::{self, Classification, DiffRecord, DiffReport};
use crate::matcher::compare;
use crate::store::{self, AnswerState, Store, Table};
use crate::{Error, Qid};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{spawn_blocking, JoinSet};
use tracing::{debug, info, warn};

/// The number of queries classified by one task.
const CHUNK_SIZE: usize = 1000;

//------------ Classified -----------------------------------------------------

/// The outcome of classifying a set of queries.
#[derive(Clone, Debug, Default)]
pub struct Classified {
    /// The records of all queries that are not a match.
    pub records: Vec<DiffRecord>,

    /// The number of queries classified as a match.
    pub matches: u64,

    /// The number of queries skipped because of pending answers.
    pub incomplete: u64,
}

impl Classified {
    /// Returns the number of classified queries.
    pub fn total(&self) -> u64 {
        self.matches + self.records.len() as u64
    }

    fn merge(&mut self, other: Classified) {
        self.records.extend(other.records);
        self.matches += other.matches;
        self.incomplete += other.incomplete;
    }
}

//------------ run ------------------------------------------------------------

/// Runs msgdiff.
///
/// Adds the records to the datafile written by the orchestrator. If there
/// is no datafile, a new one is created from the store's metadata.
pub async fn run(
    config: Arc<Config>,
    store: Arc<Store>,
    datafile: &Path,
) -> Result<DiffReport, Error> {
    if !store.check_servers(&config.server_names())? {
        return Err(store::Error::NoServers.into());
    }
    let mut report = match DiffReport::load(datafile) {
        Ok(report) => report,
        Err(dataformat::Error::Io(_, err))
            if err.kind() == io::ErrorKind::NotFound =>
        {
            warn!(
                "datafile {} not found, creating a new one",
                datafile.display()
            );
            DiffReport::new(
                store.read_start_time()?,
                store.read_end_time()?,
                store.count(Table::Queries)?,
                store.count(Table::Answers)?,
            )
        }
        Err(err) => return Err(err.into()),
    };

    let classified = classify_store(config, store).await?;
    if classified.incomplete > 0 {
        warn!(
            "skipped {} queries with incomplete answers",
            classified.incomplete
        );
    }
    info!(
        "classified {} queries: {} matches, {} upstream unstable, \
         {} target disagreements",
        classified.total(),
        classified.matches,
        count(&classified.records, Classification::UpstreamUnstable),
        count(&classified.records, Classification::TargetDisagreement),
    );
    report.total_answers = Some(classified.total());
    report.matches = Some(classified.matches);
    report.records = Some(classified.records);
    report.summary = None;
    report.save(datafile)?;
    Ok(report)
}

fn count(records: &[DiffRecord], classification: Classification) -> usize {
    records
        .iter()
        .filter(|record| record.classification == classification)
        .count()
}

/// Classifies the answers of all queries in the store.
///
/// The records are returned sorted by query ID regardless of the order in
/// which the chunks finished.
pub async fn classify_store(
    config: Arc<Config>,
    store: Arc<Store>,
) -> Result<Classified, Error> {
    let (tx, mut rx) = mpsc::channel(4);
    let reader = spawn_blocking(move || read_chunks(&store, tx));
    let mut set = JoinSet::new();
    while let Some(chunk) = rx.recv().await {
        let config = config.clone();
        set.spawn_blocking(move || classify_chunk(&config, chunk));
    }
    let sent = reader.await??;
    debug!("read the answers of {sent} queries");

    let mut res = Classified::default();
    while let Some(chunk) = set.join_next().await {
        res.merge(chunk?);
    }
    res.records.sort_by_key(|record| record.qid);
    Ok(res)
}

/// Reads the answers from the store and sends them on in chunks.
///
/// Returns the number of queries sent. Reading stops if the receiver has
/// gone away.
fn read_chunks(
    store: &Store,
    tx: mpsc::Sender<Vec<(Qid, Vec<AnswerState>)>>,
) -> Result<usize, store::Error> {
    let mut sent = 0;
    let mut chunk = Vec::with_capacity(CHUNK_SIZE);
    let mut records = store.iterate_answer_records().peekable();
    while let Some(item) = records.next() {
        chunk.push(item?);
        if chunk.len() < CHUNK_SIZE && records.peek().is_some() {
            continue;
        }
        let full =
            std::mem::replace(&mut chunk, Vec::with_capacity(CHUNK_SIZE));
        let len = full.len();
        if tx.blocking_send(full).is_err() {
            warn!("classification stopped after {sent} queries");
            break;
        }
        sent += len;
    }
    Ok(sent)
}

/// Classifies a chunk of queries.
pub fn classify_chunk(
    config: &Config,
    chunk: Vec<(Qid, Vec<AnswerState>)>,
) -> Classified {
    let mut res = Classified::default();
    for (qid, answers) in chunk {
        match compare(&answers, config.target(), config.criteria()) {
            None => {
                debug!("query {qid} has pending answers");
                res.incomplete += 1;
            }
            Some((Classification::Match, _)) => res.matches += 1,
            Some((classification, mismatches)) => {
                res.records
                    .push(DiffRecord::new(qid, classification, mismatches))
            }
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
    use crate::matcher::test::answer;
    use crate::store::test::store_with_servers;
    use crate::store::Reply;
    use domain::base::iana::Rcode;

    fn fill(store: &Store) {
        let ok = Reply::answer(100, answer(1, Rcode::NOERROR, &["192.0.2.1"]));
        let nx = Reply::answer(120, answer(1, Rcode::NXDOMAIN, &[]));
        let fail = Reply::answer(90, answer(1, Rcode::SERVFAIL, &[]));
        for qid in 1..=5 {
            store.put_query(qid, b"q").unwrap();
        }
        store.put_answers(1, 0, [&ok, &ok, &ok]).unwrap();
        store.put_answers(2, 0, [&nx, &ok, &ok]).unwrap();
        store.put_answers(3, 0, [&ok, &ok, &fail]).unwrap();
        store.put_answers(4, 0, [&ok, &ok]).unwrap();
        store.put_answers(5, 0, [&Reply::Timeout, &ok, &ok]).unwrap();
    }

    #[tokio::test]
    async fn classifies_and_saves() {
        let (dir, store) = store_with_servers(&["kresd", "bind", "unbound"]);
        fill(&store);
        let config = Arc::new(Config::from_toml_str(SAMPLE).unwrap());
        let datafile = dir.path().join("report.json");

        let report =
            run(config.clone(), Arc::new(store), &datafile).await.unwrap();
        assert_eq!(report.matches, Some(1));
        assert_eq!(report.total_answers, Some(4));
        let records = report.records().unwrap();
        assert_eq!(
            records.iter().map(|r| r.qid).collect::<Vec<_>>(),
            [2, 3, 5]
        );
        assert_eq!(
            records[0].mismatching_fields().collect::<Vec<_>>(),
            [FieldName::Rcode, FieldName::Answertypes]
        );
        assert_eq!(
            records[1].classification,
            Classification::UpstreamUnstable
        );
        assert_eq!(
            records[2].mismatching_fields().collect::<Vec<_>>(),
            [FieldName::Timeout]
        );
        assert_eq!(DiffReport::load(&datafile).unwrap(), report);
    }

    #[tokio::test]
    async fn deterministic() {
        let (_dir, store) = store_with_servers(&["kresd", "bind", "unbound"]);
        fill(&store);
        let store = Arc::new(store);
        let config = Arc::new(Config::from_toml_str(SAMPLE).unwrap());
        let first =
            classify_store(config.clone(), store.clone()).await.unwrap();
        let second = classify_store(config, store).await.unwrap();
        assert_eq!(first.records, second.records);
        assert_eq!(first.incomplete, 1);
    }

    #[test]
    fn chunks_stop_without_receiver() {
        let (_dir, store) = store_with_servers(&["kresd", "bind", "unbound"]);
        fill(&store);

        let (tx, mut rx) = mpsc::channel(1);
        assert_eq!(read_chunks(&store, tx).unwrap(), 5);
        assert_eq!(rx.try_recv().unwrap().len(), 5);
        assert!(rx.try_recv().is_err());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(read_chunks(&store, tx).unwrap(), 0);
    }

    #[tokio::test]
    async fn requires_servers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config = Arc::new(Config::from_toml_str(SAMPLE).unwrap());
        let res =
            run(config, Arc::new(store), &dir.path().join("report.json"))
                .await;
        assert!(matches!(res, Err(Error::Store(store::Error::NoServers))));
    }
}
