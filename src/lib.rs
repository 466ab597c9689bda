//! Finding differences between the answers of DNS servers.
//!
//! This crate sends the same set of queries to several DNS servers, records
//! their answers, and classifies how one designated server, the _target_,
//! differs from the consensus of the _others_. It is meant for validating a
//! resolver implementation against reference implementations with millions
//! of queries and produces replayable artifacts at every step.
//!
//! # Modules
//!
//! The toolchain is a pipeline. Data only ever flows downstream:
//!
//! * [store] keeps queries, answers, and run metadata in a binary store,
//! * [qprep] fills the store with queries from a text list,
//! * [orchestrator] sends every stored query to all servers via the
//!   connections of [sendrecv] and records the answers,
//! * [msgdiff] classifies the answers using the comparisons of [matcher],
//! * [diffrepro] re-runs disagreeing queries to weed out flukes,
//! * [diffsum] summarizes the differences into a report,
//! * [sumcmp] compares the summary of a run with that of a reference run,
//! * [stats] aggregates many reports into reference statistics and
//!   compares new reports against them, and
//! * [histogram] reduces response times into percentile series.
//!
//! The diff records and reports produced by these steps are defined in
//! [dataformat]. All steps share one immutable [config::Config].
//!
//! The `respdiff` binary exposes every step as a subcommand.

#![warn(missing_docs)]

pub mod config;
pub mod dataformat;
pub mod diffrepro;
pub mod diffsum;
pub mod error;
pub mod histogram;
pub mod logging;
pub mod matcher;
pub mod msgdiff;
pub mod orchestrator;
pub mod qprep;
pub mod sendrecv;
pub mod stats;
pub mod store;
pub mod sumcmp;

pub use self::error::Error;

/// The ID of a query.
///
/// Query IDs are dense and unique across a run. They are the keys of both
/// the queries and answers tables of the [store].
pub type Qid = u32;
