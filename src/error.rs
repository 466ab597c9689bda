//! The error type of the respdiff steps.

use crate::{config, dataformat, diffsum, orchestrator, stats, store};
use std::path::PathBuf;
use std::{error, fmt, io};
use tokio::task::JoinError;

//------------ Error ----------------------------------------------------------

/// An error that ends a respdiff step.
#[derive(Debug)]
pub enum Error {
    /// The configuration is invalid.
    Config(config::Error),

    /// The store failed.
    Store(store::Error),

    /// A datafile could not be processed.
    Datafile(dataformat::Error),

    /// Sending queries failed.
    Orchestrator(orchestrator::Error),

    /// The differences could not be summarized.
    Summary(diffsum::Error),

    /// Statistics could not be computed.
    Stats(stats::Error),

    /// A file could not be read or written.
    Io(PathBuf, io::Error),

    /// An input file is invalid.
    Input(PathBuf, String),

    /// A background task failed.
    Join(JoinError),
}

impl From<config::Error> for Error {
    fn from(err: config::Error) -> Self {
        Error::Config(err)
    }
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

impl From<orchestrator::Error> for Error {
    fn from(err: orchestrator::Error) -> Self {
        match err {
            orchestrator::Error::Store(err) => Error::Store(err),
            orchestrator::Error::Datafile(err) => Error::Datafile(err),
            orchestrator::Error::Join(err) => Error::Join(err),
            err => Error::Orchestrator(err),
        }
    }
}

impl From<diffsum::Error> for Error {
    fn from(err: diffsum::Error) -> Self {
        Error::Summary(err)
    }
}

impl From<stats::Error> for Error {
    fn from(err: stats::Error) -> Self {
        Error::Stats(err)
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Error::Join(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(err) => err.fmt(f),
            Error::Store(err) => write!(f, "store: {err}"),
            Error::Datafile(err) => err.fmt(f),
            Error::Orchestrator(err) => err.fmt(f),
            Error::Summary(err) => err.fmt(f),
            Error::Stats(err) => err.fmt(f),
            Error::Io(path, err) => write!(f, "{}: {}", path.display(), err),
            Error::Input(path, err) => write!(f, "{}: {}", path.display(), err),
            Error::Join(err) => write!(f, "task failed: {err}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Config(err) => Some(err),
            Error::Store(err) => Some(err),
            Error::Datafile(err) => Some(err),
            Error::Orchestrator(err) => Some(err),
            Error::Summary(err) => Some(err),
            Error::Stats(err) => Some(err),
            Error::Io(_, err) => Some(err),
            Error::Input(..) => None,
            Error::Join(err) => Some(err),
        }
    }
}
