//! The respdiff command line tool.
//!
//! Every step of the toolchain is a subcommand. The steps of a run share an
//! environment directory holding the store and, by default, the datafile.

use clap::{Args, Parser, Subcommand};
use respdiff::config::Config;
use respdiff::logging::init_logging;
use respdiff::stats::{SummaryStatistics, STATS_FILENAME};
use respdiff::store::Store;
use respdiff::{
    diffrepro, diffsum, histogram, msgdiff, orchestrator, qprep, stats,
    sumcmp, Error,
};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// The default name of the datafile in the environment directory.
const DATAFILE_NAME: &str = "report.json";

/// The exit code for a regression found by statcmp.
const EXIT_REGRESSION: u8 = 3;

/// Arguments parser.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by most subcommands.
#[derive(Args, Debug)]
struct Common {
    /// The environment directory holding the store.
    envdir: PathBuf,

    /// The configuration file.
    #[arg(short, long, default_value = "respdiff.toml")]
    config: PathBuf,

    /// The JSON datafile [default: <envdir>/report.json].
    #[arg(short, long)]
    datafile: Option<PathBuf>,
}

impl Common {
    fn config(&self) -> Result<Arc<Config>, Error> {
        Ok(Arc::new(Config::from_file(&self.config)?))
    }

    fn store(&self) -> Result<Arc<Store>, Error> {
        Ok(Arc::new(Store::open(&self.envdir)?))
    }

    fn datafile(&self) -> PathBuf {
        self.datafile
            .clone()
            .unwrap_or_else(|| self.envdir.join(DATAFILE_NAME))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read queries in the form '<qname> <RRtype>' into the store.
    Qprep {
        /// The environment directory holding the store.
        envdir: PathBuf,

        /// Read queries from this file instead of standard input.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Send all queries to all servers and store the answers.
    Orchestrator {
        #[command(flatten)]
        common: Common,

        /// Keep going if a server stops answering.
        #[arg(long)]
        ignore_timeout: bool,
    },

    /// Compare the answers and write the differences to the datafile.
    Msgdiff {
        #[command(flatten)]
        common: Common,
    },

    /// Re-run target disagreements to check they are reproducible.
    Diffrepro {
        #[command(flatten)]
        common: Common,

        /// Send one query at a time, restarting servers before each.
        #[arg(long)]
        sequential: bool,
    },

    /// Summarize the differences.
    Diffsum {
        #[command(flatten)]
        common: Common,

        /// The number of example queries per mismatch, 0 for all.
        #[arg(short, long, default_value_t = diffsum::DEFAULT_LIMIT)]
        limit: usize,

        /// A reference datafile of an earlier run.
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Ignore queries upstream unstable in the reference.
        #[arg(long, requires = "reference")]
        without_ref_unstable: bool,

        /// Ignore queries with target disagreements in the reference.
        #[arg(long, requires = "reference")]
        without_ref_failing: bool,

        /// Do not print the queries of each mismatch.
        #[arg(long)]
        without_details: bool,
    },

    /// Compare the summary of a datafile with that of a reference.
    Sumcmp {
        /// The configuration file.
        #[arg(short, long, default_value = "respdiff.toml")]
        config: PathBuf,

        /// The environment directory for the queries of each mismatch.
        #[arg(short, long)]
        envdir: Option<PathBuf>,

        /// The number of queries per mismatch, 0 for all.
        #[arg(short, long, default_value_t = diffsum::DEFAULT_LIMIT)]
        limit: usize,

        /// The reference datafile.
        reference: PathBuf,

        /// The datafile to compare.
        datafile: PathBuf,
    },

    /// Create reference statistics from the summaries of many datafiles.
    Sumstat {
        /// The configuration file.
        #[arg(short, long, default_value = "respdiff.toml")]
        config: PathBuf,

        /// The statistics file to write.
        #[arg(short, long, default_value = STATS_FILENAME)]
        stats: PathBuf,

        /// Use counts relative to the number of answers.
        #[arg(long)]
        normalize: bool,

        /// The datafiles.
        #[arg(required = true)]
        reports: Vec<PathBuf>,
    },

    /// Compare datafiles against reference statistics.
    Statcmp {
        /// The statistics file.
        #[arg(short, long, default_value = STATS_FILENAME)]
        stats: PathBuf,

        /// The datafiles.
        #[arg(required = true)]
        reports: Vec<PathBuf>,
    },

    /// Write response time histograms of all servers.
    Histogram {
        #[command(flatten)]
        common: Common,

        /// The output file.
        #[arg(short, long, default_value = histogram::HISTOGRAM_FILENAME)]
        output: PathBuf,

        /// Only include answers with this rcode.
        #[arg(long)]
        rcode: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    let res = run(cli.command).await;
    if let Err(err) = &res {
        error!("{err}");
    }
    ExitCode::from(exit_code(&res))
}

/// Returns the process exit code for the result of a subcommand.
fn exit_code(res: &Result<bool, Error>) -> u8 {
    match res {
        Ok(true) => 0,
        Ok(false) => EXIT_REGRESSION,
        Err(_) => 1,
    }
}

/// Runs a subcommand.
///
/// Returns `Ok(false)` if statcmp found a regression.
async fn run(command: Command) -> Result<bool, Error> {
    match command {
        Command::Qprep { envdir, input } => {
            let store = Store::open(&envdir)?;
            match input {
                Some(path) => {
                    let file = std::fs::File::open(&path)
                        .map_err(|err| Error::Io(path.clone(), err))?;
                    qprep::run(&store, io::BufReader::new(file))?;
                }
                None => {
                    qprep::run(&store, io::stdin().lock())?;
                }
            }
        }
        Command::Orchestrator {
            common,
            ignore_timeout,
        } => {
            orchestrator::run(
                common.config()?,
                common.store()?,
                &common.datafile(),
                ignore_timeout,
            )
            .await?;
        }
        Command::Msgdiff { common } => {
            msgdiff::run(common.config()?, common.store()?, &common.datafile())
                .await?;
        }
        Command::Diffrepro { common, sequential } => {
            diffrepro::run(
                common.config()?,
                common.store()?,
                &common.datafile(),
                sequential,
            )
            .await?;
        }
        Command::Diffsum {
            common,
            limit,
            reference,
            without_ref_unstable,
            without_ref_failing,
            without_details,
        } => {
            let config = common.config()?;
            let store = if without_details {
                None
            } else {
                Some(common.store()?)
            };
            let options = diffsum::Options {
                limit,
                reference,
                without_ref_unstable,
                without_ref_failing,
            };
            let text = diffsum::run(
                &config,
                store.as_deref(),
                &common.datafile(),
                &options,
            )?;
            print!("{text}");
        }
        Command::Sumcmp {
            config,
            envdir,
            limit,
            reference,
            datafile,
        } => {
            let config = Config::from_file(&config)?;
            let store = envdir.map(Store::open).transpose()?;
            let text = sumcmp::run(
                &config,
                store.as_ref(),
                &datafile,
                &reference,
                limit,
            )?;
            print!("{text}");
        }
        Command::Sumstat {
            config,
            stats,
            normalize,
            reports,
        } => {
            let config = Config::from_file(&config)?;
            let res = SummaryStatistics::from_reports(
                &reports,
                config.field_weights(),
                normalize,
            )?;
            res.save(&stats)?;
            info!(
                "statistics of {} reports written to {}",
                res.sample_size,
                stats.display()
            );
        }
        Command::Statcmp {
            stats: stats_file,
            reports,
        } => {
            let reference = SummaryStatistics::load(&stats_file)?;
            let (text, failed) = stats::statcmp(&reference, &reports)?;
            print!("{text}");
            return Ok(!failed);
        }
        Command::Histogram {
            common,
            output,
            rcode,
        } => {
            let config = common.config()?;
            let store = common.store()?;
            histogram::run(&config, &store, &output, rcode)?;
        }
    }
    Ok(true)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use respdiff::dataformat::{DiffReport, Summary};

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&Ok(true)), 0);
        assert_eq!(exit_code(&Ok(false)), 3);
        let err = Error::Io(
            PathBuf::from("missing"),
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert_eq!(exit_code(&Err(err)), 1);
    }

    #[tokio::test]
    async fn statcmp_regression() {
        let dir = tempfile::tempdir().unwrap();
        let report = |name: &str, disagreements: u64| {
            let path = dir.path().join(name);
            let mut report = DiffReport::new(None, None, 1000, 1000);
            report.summary = Some(Summary {
                total: 1000,
                matches: 1000 - disagreements,
                target_disagreements: disagreements,
                ..Default::default()
            });
            report.save(&path).unwrap();
            path
        };
        let references = vec![
            report("a.json", 10),
            report("b.json", 12),
            report("c.json", 11),
        ];
        let stats = dir.path().join(STATS_FILENAME);
        SummaryStatistics::from_reports(&references, &[], false)
            .unwrap()
            .save(&stats)
            .unwrap();

        let res = run(Command::Statcmp {
            stats: stats.clone(),
            reports: vec![report("normal.json", 11)],
        })
        .await;
        assert_eq!(exit_code(&res), 0);

        let res = run(Command::Statcmp {
            stats: stats.clone(),
            reports: vec![report("regressed.json", 20)],
        })
        .await;
        assert_eq!(exit_code(&res), EXIT_REGRESSION);

        let res = run(Command::Statcmp {
            stats,
            reports: vec![dir.path().join("missing.json")],
        })
        .await;
        assert_eq!(exit_code(&res), 1);
    }
}
