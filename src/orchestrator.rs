//! Sending all stored queries to all servers.
//!
//! The orchestrator takes every query from the store, sends it to every
//! configured server, and records the replies in the store. Queries are
//! processed by a number of workers running in parallel, each with its own
//! set of connections. The order in which answers are written is therefore
//! arbitrary, but the store keeps them sorted by query ID.
//!
//! Queries that already have a complete set of answers are skipped, so an
//! interrupted run can simply be started again. Queries with some answers
//! are only sent to the servers that are still missing.

#![warn(missing_docs)]

use crate::config::Config;
use crate::dataformat::{self, DiffReport};
use crate::sendrecv::{TimeoutTracker, Unresponsive, Worker};
use crate::store::{self, Reply, ServerId, Store, Table};
use crate::Qid;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::{error, fmt, io};
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{spawn_blocking, JoinError, JoinSet};
use tracing::{debug, error, info};

/// How often progress is reported.
const PROGRESS_INTERVAL: u64 = 10_000;

//------------ Job ------------------------------------------------------------

/// A query to be sent to some servers.
#[derive(Clone, Debug)]
pub struct Job {
    /// The query ID.
    pub qid: Qid,

    /// The query in wire format.
    pub wire: Vec<u8>,

    /// The index of the first server to send the query to.
    ///
    /// The query is sent to this server and all servers following it.
    pub first: usize,
}

//------------ run ------------------------------------------------------------

/// Runs the orchestrator.
///
/// Records the servers and the run times in the store's metadata, sends
/// all queries still missing answers, and finally writes a new datafile
/// with the run's times and totals. The metadata and datafile are written
/// even if the run fails.
pub async fn run(
    config: Arc<Config>,
    store: Arc<Store>,
    datafile: &Path,
    ignore_timeout: bool,
) -> Result<DiffReport, Error> {
    let names = config.server_names();
    if !store.check_servers(&names)? {
        let servers: Vec<_> =
            config.servers().iter().map(ServerId::from).collect();
        store.write_servers(&servers)?;
    }
    let start_time = unix_now();
    store.write_start_time(start_time)?;
    info!(
        "sending queries to {} using {} workers",
        names.join(", "),
        config.sendrecv().jobs()
    );

    let (tx, rx) = mpsc::channel(config.sendrecv().jobs() * 2);
    let producer = {
        let store = store.clone();
        let servers = names.len();
        spawn_blocking(move || feed_missing(&store, servers, tx))
    };
    let tracker = TimeoutTracker::new(
        names,
        config.sendrecv().max_timeouts(),
        ignore_timeout,
    );
    let handler = {
        let store = store.clone();
        move |job: Job, replies: Vec<Reply>| {
            store
                .put_answers(job.qid, job.first, &replies)
                .map_err(Error::from)
        }
    };
    let res = dispatch(
        &config,
        config.sendrecv().jobs(),
        rx,
        Some(Arc::new(tracker)),
        handler,
    )
    .await;
    let fed = producer.await.map_err(Error::Join)?;

    let end_time = unix_now();
    store.write_end_time(end_time)?;
    let report = DiffReport::new(
        Some(start_time),
        Some(end_time),
        store.count(Table::Queries)?,
        store.count(Table::Answers)?,
    );
    report.save_new(datafile)?;
    if let Err(err) = &res {
        error!("orchestrator aborted: {err}");
    }
    res?;
    fed?;
    info!(
        "finished: {} queries, {} answers",
        report.total_queries.unwrap_or_default(),
        report.total_answers.unwrap_or_default()
    );
    Ok(report)
}

/// Feeds all queries with missing answers into the channel.
fn feed_missing(
    store: &Store,
    servers: usize,
    tx: mpsc::Sender<Job>,
) -> Result<(), Error> {
    let mut skipped = 0u64;
    for query in store.iterate_queries() {
        let query = query?;
        let first = store.get_replies(query.qid)?.len();
        if first >= servers {
            skipped += 1;
            continue;
        }
        let job = Job {
            qid: query.qid,
            wire: query.wire,
            first,
        };
        if tx.blocking_send(job).is_err() {
            // All workers are gone, the run has been aborted.
            break;
        }
    }
    if skipped > 0 {
        info!("skipped {skipped} queries with complete answers");
    }
    Ok(())
}

//------------ dispatch -------------------------------------------------------

/// Processes jobs with a number of parallel workers.
///
/// Each worker takes the next job from `jobs`, sends the query, and hands
/// the replies to `handler`, which is run on the blocking thread pool. If
/// `tracker` is given, too many consecutive timeouts of a server abort all
/// workers. The first error of any worker aborts all others.
pub async fn dispatch<H>(
    config: &Config,
    workers: usize,
    jobs: mpsc::Receiver<Job>,
    tracker: Option<Arc<TimeoutTracker>>,
    handler: H,
) -> Result<(), Error>
where
    H: Fn(Job, Vec<Reply>) -> Result<(), Error> + Send + Sync + 'static,
{
    let jobs = Arc::new(Mutex::new(jobs));
    let handler = Arc::new(handler);
    let done = Arc::new(AtomicU64::new(0));
    let mut set: JoinSet<Result<(), Error>> = JoinSet::new();
    for _ in 0..workers.max(1) {
        let mut worker = Worker::new(config.servers(), config.sendrecv())
            .map_err(Error::Connect)?;
        let jobs = jobs.clone();
        let tracker = tracker.clone();
        let handler = handler.clone();
        let done = done.clone();
        set.spawn(async move {
            loop {
                let job = match jobs.lock().await.recv().await {
                    Some(job) => job,
                    None => return Ok(()),
                };
                debug!("sending query {}", job.qid);
                let replies = worker.send_recv(&job.wire, job.first).await;
                let verdict = tracker
                    .as_ref()
                    .map(|tracker| tracker.record(job.first, &replies));
                let handler = handler.clone();
                spawn_blocking(move || handler(job, replies))
                    .await
                    .map_err(Error::Join)??;
                if let Some(Err(err)) = verdict {
                    return Err(Error::Unresponsive(err));
                }
                let count = done.fetch_add(1, Ordering::Relaxed) + 1;
                if count % PROGRESS_INTERVAL == 0 {
                    info!("received {count} answers");
                }
            }
        });
    }

    let mut res = Ok(());
    while let Some(joined) = set.join_next().await {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(err) if err.is_cancelled() => continue,
            Err(err) => Error::Join(err),
        };
        if res.is_ok() {
            set.abort_all();
            res = Err(err);
        }
    }
    res
}

/// Returns the current time in UNIX seconds.
pub fn unix_now() -> u32 {
    u32::try_from(OffsetDateTime::now_utc().unix_timestamp())
        .unwrap_or_default()
}

//============ Error Types ===================================================

/// The orchestrator failed.
#[derive(Debug)]
pub enum Error {
    /// The store failed.
    Store(store::Error),

    /// The datafile could not be written.
    Datafile(dataformat::Error),

    /// A server stopped answering.
    Unresponsive(Unresponsive),

    /// The connections could not be set up.
    Connect(io::Error),

    /// A task failed.
    Join(JoinError),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        Error::Store(err)
    }
}

impl From<dataformat::Error> for Error {
    fn from(err: dataformat::Error) -> Self {
        Error::Datafile(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Store(err) => err.fmt(f),
            Error::Datafile(err) => err.fmt(f),
            Error::Unresponsive(err) => err.fmt(f),
            Error::Connect(err) => {
                write!(f, "cannot set up connections: {err}")
            }
            Error::Join(err) => write!(f, "worker failed: {err}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Store(err) => Some(err),
            Error::Datafile(err) => Some(err),
            Error::Unresponsive(err) => Some(err),
            Error::Connect(err) => Some(err),
            Error::Join(err) => Some(err),
        }
    }
}
