//! Configuration of a respdiff run.
//!
//! The configuration is read once from a TOML file and converted into an
//! immutable [`Config`] which is then handed to every component. All
//! validation happens while loading, so that a misconfigured run fails
//! before any query is sent.
//!
//! The file has a fixed set of sections plus one section per server:
//!
//! ```toml
//! [sendrecv]
//! timeout = 16.0
//! jobs = 64
//! time_delay_min = 0.0
//! time_delay_max = 0.0
//! max_timeouts = 10
//!
//! [servers]
//! names = ["kresd", "bind", "unbound"]
//!
//! [kresd]
//! ip = "127.0.0.1"
//! port = 53
//! transport = "udp"
//! graph_color = "#00a2e2"
//! restart_script = "./restart-kresd.sh"
//!
//! # ... sections for bind and unbound ...
//!
//! [diff]
//! target = "kresd"
//! criteria = ["opcode", "rcode", "flags", "question", "answertypes"]
//!
//! [report]
//! field_weights = ["timeout", "malformed", "opcode", "question", "rcode",
//!                  "flags", "answertypes", "answerrrsigs", "answer"]
//! ```

#![warn(missing_docs)]

use core::cmp;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{error, fs, io};

//------------ Configuration Constants ----------------------------------------

/// Configuration limits for the number of parallel workers.
const JOBS: DefMinMax<usize> = DefMinMax::new(16, 1, 4096);

/// Configuration limits for the per-query timeout.
const TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(16),
    Duration::from_millis(1),
    Duration::from_secs(3600),
);

/// Configuration limits for the consecutive timeouts of a single server.
const MAX_TIMEOUTS: DefMinMax<u32> = DefMinMax::new(10, 1, u32::MAX);

/// Upper bound for the artificial delay between queries.
const MAX_DELAY: Duration = Duration::from_secs(3600);

//------------ DefMinMax ------------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy)]
pub struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    pub fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    pub fn limit(self, value: T) -> T
    where
        T: Ord,
    {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

//------------ FieldName ------------------------------------------------------

/// The name of an aspect of a DNS message that can differ between servers.
///
/// Most variants are comparison criteria selected in `[diff] criteria`.
/// [`FieldName::Timeout`] and [`FieldName::Malformed`] are synthetic: they
/// are reported when one of the compared answers is missing or cannot be
/// parsed, and can only appear in `[report] field_weights`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FieldName {
    /// One server timed out while the other answered.
    Timeout,

    /// One answer could not be parsed as a DNS message.
    Malformed,

    /// The opcode of the header.
    Opcode,

    /// The type of the first question.
    Qtype,

    /// The name of the first question, compared case-insensitively.
    Qname,

    /// The exact spelling of the first question name.
    Qcase,

    /// The header flags.
    Flags,

    /// The (extended) response code.
    Rcode,

    /// The question section.
    Question,

    /// The records of the answer section, ignoring TTLs.
    Answer,

    /// The TTLs of the answer section.
    Ttl,

    /// The set of record types in the answer section.
    Answertypes,

    /// The set of types covered by RRSIGs in the answer section.
    Answerrrsigs,

    /// The records of the authority section.
    Authority,

    /// The records of the additional section, except OPT.
    Additional,

    /// EDNS version, flags and UDP payload size.
    Edns,

    /// The content of the NSID option.
    Nsid,
}

impl FieldName {
    /// All field names in declaration order.
    pub const ALL: [FieldName; 17] = [
        FieldName::Timeout,
        FieldName::Malformed,
        FieldName::Opcode,
        FieldName::Qtype,
        FieldName::Qname,
        FieldName::Qcase,
        FieldName::Flags,
        FieldName::Rcode,
        FieldName::Question,
        FieldName::Answer,
        FieldName::Ttl,
        FieldName::Answertypes,
        FieldName::Answerrrsigs,
        FieldName::Authority,
        FieldName::Additional,
        FieldName::Edns,
        FieldName::Nsid,
    ];

    /// Returns the name as used in configuration and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::Timeout => "timeout",
            FieldName::Malformed => "malformed",
            FieldName::Opcode => "opcode",
            FieldName::Qtype => "qtype",
            FieldName::Qname => "qname",
            FieldName::Qcase => "qcase",
            FieldName::Flags => "flags",
            FieldName::Rcode => "rcode",
            FieldName::Question => "question",
            FieldName::Answer => "answer",
            FieldName::Ttl => "ttl",
            FieldName::Answertypes => "answertypes",
            FieldName::Answerrrsigs => "answerrrsigs",
            FieldName::Authority => "authority",
            FieldName::Additional => "additional",
            FieldName::Edns => "edns",
            FieldName::Nsid => "nsid",
        }
    }

    /// Returns whether the field is produced by the comparison itself
    /// rather than selected as a criterion.
    pub fn is_synthetic(self) -> bool {
        matches!(self, FieldName::Timeout | FieldName::Malformed)
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldName::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| Error::UnknownField(s.into()))
    }
}

//------------ Transport ------------------------------------------------------

/// The transport protocol used to talk to a server.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain DNS over UDP.
    Udp,

    /// Plain DNS over TCP.
    Tcp,

    /// DNS over TLS.
    Tls,
}

impl Transport {
    /// Returns the lowercase name of the transport.
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            _ => Err(Error::UnknownTransport(s.into())),
        }
    }
}

//------------ ServerConfig ---------------------------------------------------

/// Configuration of a single server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The name of the server as listed in `[servers] names`.
    name: String,

    /// Address and port to send queries to.
    addr: SocketAddr,

    /// The transport protocol.
    transport: Transport,

    /// Color used by external plotting tools.
    graph_color: Option<String>,

    /// Script to run to restart the server with a clean cache.
    restart_script: Option<PathBuf>,

    /// Name to verify the server's certificate against.
    ///
    /// If this is `None`, TLS certificates are not verified.
    tls_server_name: Option<String>,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        transport: Transport,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            transport,
            graph_color: None,
            restart_script: None,
            tls_server_name: None,
        }
    }

    /// Returns the name of the server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the address to send queries to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the transport protocol.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Returns the plotting color, if any.
    pub fn graph_color(&self) -> Option<&str> {
        self.graph_color.as_deref()
    }

    /// Returns the path of the restart script, if any.
    pub fn restart_script(&self) -> Option<&Path> {
        self.restart_script.as_deref()
    }

    /// Sets the path of the restart script.
    pub fn set_restart_script(&mut self, path: Option<PathBuf>) {
        self.restart_script = path
    }

    /// Returns the TLS server name, if any.
    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }
}

//------------ SendRecvConfig -------------------------------------------------

/// Configuration of sending queries and receiving answers.
#[derive(Clone, Debug)]
pub struct SendRecvConfig {
    /// Time to wait for the answers to a single query.
    timeout: Duration,

    /// Number of parallel workers.
    jobs: usize,

    /// Range of the random delay before each query.
    time_delay: Option<(Duration, Duration)>,

    /// Number of consecutive timeouts from one server that abort a run.
    max_timeouts: u32,
}

impl SendRecvConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the time to wait for answers to a single query.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the timeout.
    ///
    /// If this value is too small or too large, it will be caped.
    pub fn set_timeout(&mut self, value: Duration) {
        self.timeout = TIMEOUT.limit(value)
    }

    /// Returns the number of parallel workers.
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Sets the number of parallel workers.
    ///
    /// If this value is too small or too large, it will be caped.
    pub fn set_jobs(&mut self, value: usize) {
        self.jobs = JOBS.limit(value)
    }

    /// Returns the range of the delay before each query.
    ///
    /// Returns `None` if queries should be sent without delay.
    pub fn time_delay(&self) -> Option<(Duration, Duration)> {
        self.time_delay
    }

    /// Sets the range of the delay before each query.
    ///
    /// A zero maximum disables the delay.
    pub fn set_time_delay(&mut self, min: Duration, max: Duration) {
        let max = cmp::min(max, MAX_DELAY);
        let min = cmp::min(min, max);
        self.time_delay = if max.is_zero() { None } else { Some((min, max)) }
    }

    /// Returns the number of consecutive timeouts that abort a run.
    pub fn max_timeouts(&self) -> u32 {
        self.max_timeouts
    }

    /// Sets the number of consecutive timeouts that abort a run.
    pub fn set_max_timeouts(&mut self, value: u32) {
        self.max_timeouts = MAX_TIMEOUTS.limit(value)
    }
}

impl Default for SendRecvConfig {
    fn default() -> Self {
        Self {
            timeout: TIMEOUT.default(),
            jobs: JOBS.default(),
            time_delay: None,
            max_timeouts: MAX_TIMEOUTS.default(),
        }
    }
}

//------------ Config ---------------------------------------------------------

/// The complete, validated configuration of a run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Send and receive parameters.
    sendrecv: SendRecvConfig,

    /// The servers in the order that fixes their server index.
    servers: Vec<ServerConfig>,

    /// Index of the target server in `servers`.
    target: usize,

    /// The comparison criteria in order.
    criteria: Vec<FieldName>,

    /// The fields in order of significance for the summary.
    field_weights: Vec<FieldName>,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Io(path.into(), err))?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|err| Error::Parse(err.to_string()))?;
        raw.into_config()
    }

    /// Creates a configuration from its parts and validates it.
    pub fn new(
        sendrecv: SendRecvConfig,
        servers: Vec<ServerConfig>,
        target: &str,
        criteria: Vec<FieldName>,
        field_weights: Vec<FieldName>,
    ) -> Result<Self, Error> {
        if servers.len() < 2 {
            return Err(Error::NotEnoughServers);
        }
        let mut seen = HashSet::new();
        for server in &servers {
            if !seen.insert(server.name.as_str()) {
                return Err(Error::DuplicateServer(server.name.clone()));
            }
        }
        let target = servers
            .iter()
            .position(|server| server.name == target)
            .ok_or_else(|| Error::UnknownTarget(target.into()))?;
        if criteria.is_empty() {
            return Err(Error::NoCriteria);
        }
        for field in &criteria {
            if field.is_synthetic() {
                return Err(Error::SyntheticCriterion(*field));
            }
        }
        check_unique("criteria", &criteria)?;
        check_unique("field_weights", &field_weights)?;
        let required = [FieldName::Timeout, FieldName::Malformed];
        for field in criteria.iter().chain(required.iter()) {
            if !field_weights.contains(field) {
                return Err(Error::MissingFieldWeight(*field));
            }
        }
        Ok(Self {
            sendrecv,
            servers,
            target,
            criteria,
            field_weights,
        })
    }

    /// Returns the send and receive parameters.
    pub fn sendrecv(&self) -> &SendRecvConfig {
        &self.sendrecv
    }

    /// Returns the servers in server index order.
    pub fn servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    /// Returns the names of the servers in server index order.
    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// Returns the server index of the target.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Returns the server configuration of the target.
    pub fn target_server(&self) -> &ServerConfig {
        &self.servers[self.target]
    }

    /// Returns the comparison criteria.
    pub fn criteria(&self) -> &[FieldName] {
        &self.criteria
    }

    /// Returns the fields in order of significance.
    pub fn field_weights(&self) -> &[FieldName] {
        &self.field_weights
    }
}

/// Checks that a list of fields contains no duplicates.
fn check_unique(key: &'static str, fields: &[FieldName]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(*field) {
            return Err(Error::DuplicateField(key, *field));
        }
    }
    Ok(())
}

//------------ Raw configuration ----------------------------------------------

/// The configuration file as deserialized from TOML.
#[derive(Deserialize)]
struct RawConfig {
    /// The `[sendrecv]` section.
    sendrecv: RawSendRecv,

    /// The `[servers]` section.
    servers: RawServers,

    /// The `[diff]` section.
    diff: RawDiff,

    /// The `[report]` section.
    report: RawReport,

    /// All other sections, which must be server sections.
    #[serde(flatten)]
    sections: BTreeMap<String, toml::Value>,
}

/// The `[sendrecv]` section.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSendRecv {
    /// Timeout in seconds.
    timeout: f64,

    /// Number of parallel workers.
    jobs: usize,

    /// Minimum delay in seconds.
    #[serde(default)]
    time_delay_min: f64,

    /// Maximum delay in seconds.
    #[serde(default)]
    time_delay_max: f64,

    /// Consecutive timeouts before aborting.
    max_timeouts: Option<u32>,
}

/// The `[servers]` section.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServers {
    /// Server names in order.
    names: Vec<String>,
}

/// A per-server section.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    /// IP address.
    ip: String,

    /// Port.
    port: u16,

    /// Transport protocol.
    transport: Transport,

    /// Plotting color.
    graph_color: Option<String>,

    /// Restart hook.
    restart_script: Option<PathBuf>,

    /// TLS certificate name.
    tls_server_name: Option<String>,
}

/// The `[diff]` section.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDiff {
    /// Name of the target server.
    target: String,

    /// Comparison criteria.
    criteria: Vec<FieldName>,
}

/// The `[report]` section.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReport {
    /// Field significance order.
    field_weights: Vec<FieldName>,
}

impl RawConfig {
    /// Converts the raw data into a validated config.
    fn into_config(mut self) -> Result<Config, Error> {
        let mut sendrecv = SendRecvConfig::new();
        sendrecv.set_timeout(seconds("timeout", self.sendrecv.timeout)?);
        sendrecv.set_jobs(self.sendrecv.jobs);
        let min = seconds("time_delay_min", self.sendrecv.time_delay_min)?;
        let max = seconds("time_delay_max", self.sendrecv.time_delay_max)?;
        if min > max {
            return Err(Error::InvalidValue(
                "time_delay_min",
                "must not exceed time_delay_max".into(),
            ));
        }
        sendrecv.set_time_delay(min, max);
        if let Some(value) = self.sendrecv.max_timeouts {
            sendrecv.set_max_timeouts(value);
        }

        if self.servers.names.is_empty() {
            return Err(Error::NotEnoughServers);
        }
        let mut servers = Vec::with_capacity(self.servers.names.len());
        for name in &self.servers.names {
            let section = self
                .sections
                .remove(name)
                .ok_or_else(|| Error::MissingSection(name.clone()))?;
            let raw: RawServer = section.try_into().map_err(
                |err: toml::de::Error| {
                    Error::InvalidSection(name.clone(), err.to_string())
                },
            )?;
            let ip = IpAddr::from_str(raw.ip.trim()).map_err(|_| {
                Error::InvalidSection(
                    name.clone(),
                    format!("invalid IP address '{}'", raw.ip),
                )
            })?;
            servers.push(ServerConfig {
                name: name.clone(),
                addr: SocketAddr::new(ip, raw.port),
                transport: raw.transport,
                graph_color: raw.graph_color,
                restart_script: raw.restart_script,
                tls_server_name: raw.tls_server_name,
            });
        }
        if let Some(section) = self.sections.keys().next() {
            return Err(Error::UnexpectedSection(section.clone()));
        }

        Config::new(
            sendrecv,
            servers,
            &self.diff.target,
            self.diff.criteria,
            self.report.field_weights,
        )
    }
}

/// Converts a number of seconds into a duration.
fn seconds(key: &'static str, value: f64) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        Error::InvalidValue(key, format!("{value} is not a valid duration"))
    })
}

//============ Error Types ===================================================

/// A configuration error.
#[derive(Debug)]
pub enum Error {
    /// The configuration file could not be read.
    Io(PathBuf, io::Error),

    /// The configuration is not valid TOML or has the wrong structure.
    Parse(String),

    /// A value is out of range.
    InvalidValue(&'static str, String),

    /// A field name is not known.
    UnknownField(String),

    /// A transport is not known.
    UnknownTransport(String),

    /// Fewer than two servers are configured.
    NotEnoughServers,

    /// A server is listed twice.
    DuplicateServer(String),

    /// A listed server has no section.
    MissingSection(String),

    /// A server section is invalid.
    InvalidSection(String, String),

    /// A section is neither a known section nor a listed server.
    UnexpectedSection(String),

    /// The target is not among the listed servers.
    UnknownTarget(String),

    /// No comparison criteria are given.
    NoCriteria,

    /// A synthetic field is used as a criterion.
    SyntheticCriterion(FieldName),

    /// A field appears twice in a list.
    DuplicateField(&'static str, FieldName),

    /// A field that can be reported is missing from the field weights.
    MissingFieldWeight(FieldName),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(path, err) => {
                write!(f, "cannot read config {}: {}", path.display(), err)
            }
            Error::Parse(err) => write!(f, "invalid config: {err}"),
            Error::InvalidValue(key, err) => {
                write!(f, "config key \"{key}\" has invalid value: {err}")
            }
            Error::UnknownField(name) => {
                write!(f, "unknown field name \"{name}\"")
            }
            Error::UnknownTransport(name) => {
                write!(f, "unknown transport \"{name}\"")
            }
            Error::NotEnoughServers => {
                write!(f, "[servers] names must list at least two servers")
            }
            Error::DuplicateServer(name) => {
                write!(f, "server \"{name}\" is listed more than once")
            }
            Error::MissingSection(name) => {
                write!(f, "config section [{name}] not found")
            }
            Error::InvalidSection(name, err) => {
                write!(f, "config section [{name}] is invalid: {err}")
            }
            Error::UnexpectedSection(name) => {
                write!(f, "unexpected config section [{name}]")
            }
            Error::UnknownTarget(name) => write!(
                f,
                "[diff] target value \"{name}\" must be listed in [servers] names"
            ),
            Error::NoCriteria => write!(f, "[diff] criteria must not be empty"),
            Error::SyntheticCriterion(field) => write!(
                f,
                "field \"{field}\" cannot be used in [diff] criteria"
            ),
            Error::DuplicateField(key, field) => {
                write!(f, "field \"{field}\" appears twice in {key}")
            }
            Error::MissingFieldWeight(field) => write!(
                f,
                "field \"{field}\" is missing in [report] field_weights"
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(_, err) => Some(err),
            _ => None,
        }
    }
}

//============ Testing =======================================================
