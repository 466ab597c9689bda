//! Response time histograms.
//!
//! The histogram of a server is a logarithmic percentile histogram: for a
//! range of percentiles `p` between 0.001 and 100, it gives the response
//! time that the slowest `p` percent of the answers took at least. The
//! series are written as JSON for external plotting tools.

#![warn(missing_docs)]

use crate::config::Config;
use crate::store::{AnswerState, Store};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// The default name of the histogram file.
pub const HISTOGRAM_FILENAME: &str = "histogram.json";

/// The number of points of a series.
const POINTS: usize = 100;

//------------ Histogram ------------------------------------------------------

/// The response time histograms of all servers.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Histogram {
    /// The rcode the answers were limited to, if any.
    pub rcode: Option<u8>,

    /// The series of all servers in server order.
    pub servers: Vec<Series>,
}

/// The response time series of a single server.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Series {
    /// The name of the server.
    pub name: String,

    /// The color to draw the series with.
    pub graph_color: Option<String>,

    /// The number of answers.
    pub samples: usize,

    /// Pairs of slowest percentile and response time in milliseconds.
    pub points: Vec<(f64, f64)>,
}

impl Series {
    /// Creates a series from response times in milliseconds.
    pub fn new(
        name: String,
        graph_color: Option<String>,
        mut times: Vec<f64>,
    ) -> Self {
        times.sort_by(|a, b| b.total_cmp(a));
        let points = if times.is_empty() {
            Vec::new()
        } else {
            percentiles()
                .map(|pct| (pct, slowest(&times, pct)))
                .collect()
        };
        Series {
            name,
            graph_color,
            samples: times.len(),
            points,
        }
    }
}

/// Returns the log-spaced percentiles of a series.
pub fn percentiles() -> impl Iterator<Item = f64> {
    (0..POINTS).map(|i| {
        10f64.powf(-3. + 5. * i as f64 / (POINTS - 1) as f64)
    })
}

/// Returns the time the slowest `pct` percent took at least.
///
/// The times must be sorted in descending order and not be empty.
pub fn slowest(times: &[f64], pct: f64) -> f64 {
    let index = (pct * times.len() as f64 / 100.).ceil() as usize;
    times[index.clamp(1, times.len()) - 1]
}

//------------ run ------------------------------------------------------------

/// Creates the histograms from the answers in the store.
///
/// Timeouts are excluded. If `rcode` is given, only answers with that
/// rcode are included.
pub fn histogram(
    config: &Config,
    store: &Store,
    rcode: Option<u8>,
) -> Result<Histogram, crate::Error> {
    let names: Vec<String> = match store.read_servers()? {
        Some(servers) => servers.into_iter().map(|s| s.name).collect(),
        None => return Err(crate::store::Error::NoServers.into()),
    };
    let mut times = vec![Vec::new(); names.len()];
    for item in store.iterate_answer_records() {
        let (_, answers) = item?;
        for (index, state) in answers.iter().enumerate() {
            let reply = match state {
                AnswerState::Replied(reply) => reply,
                AnswerState::Pending => continue,
            };
            let (elapsed, wire) = match (reply.elapsed_usec(), reply.wire()) {
                (Some(elapsed), Some(wire)) => (elapsed, wire),
                _ => continue,
            };
            if rcode.is_some() && rcode != header_rcode(wire) {
                continue;
            }
            times[index].push(f64::from(elapsed) / 1000.);
        }
    }
    let servers = names
        .into_iter()
        .zip(times)
        .map(|(name, times)| {
            let color = config
                .servers()
                .iter()
                .find(|server| server.name() == name)
                .and_then(|server| server.graph_color())
                .map(Into::into);
            Series::new(name, color, times)
        })
        .collect();
    Ok(Histogram { rcode, servers })
}

/// Returns the rcode of a message with a complete header.
fn header_rcode(wire: &[u8]) -> Option<u8> {
    if wire.len() < 12 {
        return None;
    }
    wire.get(3).map(|b| b & 0x0F)
}

/// Creates the histograms and writes them to a file.
pub fn run(
    config: &Config,
    store: &Store,
    output: &Path,
    rcode: Option<u8>,
) -> Result<Histogram, crate::Error> {
    let res = histogram(config, store, rcode)?;
    let data = serde_json::to_vec_pretty(&res)
        .map_err(|err| crate::Error::Input(output.into(), err.to_string()))?;
    fs::write(output, data)
        .map_err(|err| crate::Error::Io(output.into(), err))?;
    Ok(res)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::test::SAMPLE;
    use crate::matcher::test::answer;
    use crate::store::test::store_with_servers;
    use crate::store::Reply;
    use domain::base::iana::Rcode;

    #[test]
    fn log_spaced() {
        let pcts: Vec<_> = percentiles().collect();
        assert_eq!(pcts.len(), 100);
        assert!((pcts[0] - 0.001).abs() < 1e-12);
        assert!((pcts[99] - 100.).abs() < 1e-9);
        assert!(pcts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn slowest_percent() {
        let times: Vec<f64> = (1..=100).rev().map(f64::from).collect();
        assert_eq!(slowest(&times, 0.001), 100.);
        assert_eq!(slowest(&times, 1.), 100.);
        assert_eq!(slowest(&times, 1.5), 99.);
        assert_eq!(slowest(&times, 50.), 51.);
        assert_eq!(slowest(&times, 100.), 1.);
    }

    #[test]
    fn from_store() {
        let (_dir, store) = store_with_servers(&["kresd", "bind", "unbound"]);
        let ok = answer(1, Rcode::NOERROR, &["192.0.2.1"]);
        let nx = answer(1, Rcode::NXDOMAIN, &[]);
        for qid in 0..10u32 {
            let replies = [
                Reply::answer(1000 * (qid + 1), ok.clone()),
                Reply::answer(2000, nx.clone()),
                Reply::Timeout,
            ];
            store.put_query(qid, b"q").unwrap();
            store.put_answers(qid, 0, &replies).unwrap();
        }
        let config = Config::from_toml_str(SAMPLE).unwrap();

        let all = histogram(&config, &store, None).unwrap();
        assert_eq!(all.servers[0].name, "kresd");
        assert_eq!(all.servers[0].graph_color.as_deref(), Some("#00a2e2"));
        assert_eq!(all.servers[0].samples, 10);
        assert_eq!(all.servers[0].points.len(), 100);
        assert_eq!(all.servers[0].points[0].1, 10.);
        assert_eq!(all.servers[0].points[99].1, 1.);
        assert_eq!(all.servers[2].samples, 0);
        assert!(all.servers[2].points.is_empty());

        let nxdomain = histogram(&config, &store, Some(3)).unwrap();
        assert_eq!(nxdomain.servers[0].samples, 0);
        assert_eq!(nxdomain.servers[1].samples, 10);
    }

    #[test]
    fn rcode_needs_header() {
        let (_dir, store) = store_with_servers(&["kresd", "bind", "unbound"]);
        let nx = answer(1, Rcode::NXDOMAIN, &[]);
        let short = vec![0, 1, 0x81, 0x83];
        store.put_query(1, b"q").unwrap();
        store
            .put_answers(
                1,
                0,
                &[
                    Reply::answer(1000, short),
                    Reply::answer(2000, nx),
                    Reply::Timeout,
                ],
            )
            .unwrap();
        let config = Config::from_toml_str(SAMPLE).unwrap();

        let all = histogram(&config, &store, None).unwrap();
        assert_eq!(all.servers[0].samples, 1);
        let nxdomain = histogram(&config, &store, Some(3)).unwrap();
        assert_eq!(nxdomain.servers[0].samples, 0);
        assert_eq!(nxdomain.servers[1].samples, 1);
    }
}
