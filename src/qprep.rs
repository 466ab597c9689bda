//! Filling the store with queries.
//!
//! The input is text with one query per line in the form `<qname>
//! <RRtype>`. The type can be given by its mnemonic or as a number. Every
//! non-empty line gets the next query ID starting at 1, so that query IDs
//! are line numbers. Lines that cannot be parsed and blacklisted queries
//! are skipped and leave a gap in the IDs.

#![warn(missing_docs)]

use crate::store::Store;
use crate::{Error, Qid};
use domain::base::iana::{Class, Rtype};
use domain::base::{Message, MessageBuilder, Name};
use std::io::BufRead;
use std::str::FromStr;
use tracing::{debug, error, info};

/// The number of queries stored in one transaction.
const BATCH_SIZE: usize = 1000;

/// How often progress is reported.
const PROGRESS_INTERVAL: u64 = 10_000;

/// The UDP payload size advertised in queries.
const UDP_PAYLOAD_SIZE: u16 = 4096;

/// Domains that are never queried.
const BLACKLISTED_DOMAINS: &[&str] = &[
    "local.",
    // Used for single-query measurements, repeating them is pointless.
    "dotnxdomain.net.",
    "dashnxdomain.net.",
];

//------------ Blacklist ------------------------------------------------------

/// Decides which queries are not worth sending.
///
/// Responses, queries for ANY and RRSIG, and queries for names below a
/// blacklisted domain are blacklisted. Queries that cannot be parsed are
/// not: they are a test case of their own.
#[derive(Clone, Debug)]
pub struct Blacklist {
    domains: Vec<Name<Vec<u8>>>,
}

impl Default for Blacklist {
    fn default() -> Self {
        Blacklist {
            domains: BLACKLISTED_DOMAINS
                .iter()
                .filter_map(|name| Name::from_str(name).ok())
                .collect(),
        }
    }
}

impl Blacklist {
    /// Returns whether a query is blacklisted.
    pub fn is_blacklisted(&self, wire: &[u8]) -> bool {
        let msg = match Message::from_octets(wire) {
            Ok(msg) => msg,
            Err(_) => return false,
        };
        if msg.header().qr() {
            return true;
        }
        if msg.header_counts().qdcount() != 1 {
            return false;
        }
        let question = match msg.first_question() {
            Some(question) => question,
            None => return false,
        };
        if matches!(question.qtype(), Rtype::ANY | Rtype::RRSIG) {
            return true;
        }
        self.domains
            .iter()
            .any(|domain| question.qname().ends_with(domain))
    }
}

//------------ Parsing --------------------------------------------------------

/// Creates a query from a line of text.
///
/// The query asks for the IN class with recursion desired and EDNS with
/// the DO bit set.
pub fn wire_from_text(line: &str) -> Result<Vec<u8>, String> {
    let (qname, qtype) = line
        .trim()
        .rsplit_once(char::is_whitespace)
        .ok_or("expected '<qname> <RRtype>'")?;
    let qname = Name::<Vec<u8>>::from_str(qname.trim_end())
        .map_err(|err| format!("invalid name: {err}"))?;
    let qtype = match qtype.parse::<u16>() {
        Ok(value) => Rtype::from_int(value),
        Err(_) => Rtype::from_str(qtype)
            .map_err(|_| format!("unknown type '{qtype}'"))?,
    };

    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_id(rand::random());
    msg.header_mut().set_rd(true);
    let mut msg = msg.question();
    msg.push((&qname, qtype, Class::IN))
        .map_err(|err| err.to_string())?;
    let mut msg = msg.additional();
    msg.opt(|opt| {
        opt.set_udp_payload_size(UDP_PAYLOAD_SIZE);
        opt.set_dnssec_ok(true);
        Ok(())
    })
    .map_err(|err| err.to_string())?;
    Ok(msg.finish())
}

//------------ run ------------------------------------------------------------

/// The outcome of reading queries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Outcome {
    /// The number of non-empty lines.
    pub read: u64,

    /// The number of stored queries.
    pub stored: u64,

    /// The number of lines that could not be parsed.
    pub invalid: u64,

    /// The number of blacklisted queries.
    pub blacklisted: u64,
}

/// Reads queries from text and adds them to an empty store.
pub fn run(store: &Store, input: impl BufRead) -> Result<Outcome, Error> {
    if store.count(crate::store::Table::Queries)? > 0 {
        return Err(Error::Input(
            store.path().into(),
            "store already contains queries".into(),
        ));
    }
    let blacklist = Blacklist::default();
    let mut outcome = Outcome::default();
    let mut batch: Vec<(Qid, Vec<u8>)> = Vec::with_capacity(BATCH_SIZE);
    let mut qid: Qid = 0;
    for line in input.lines() {
        let line = line.map_err(|err| Error::Io("<input>".into(), err))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        qid += 1;
        outcome.read += 1;
        if outcome.read % PROGRESS_INTERVAL == 0 {
            info!("read {} queries", outcome.read);
        }
        let wire = match wire_from_text(line) {
            Ok(wire) => wire,
            Err(err) => {
                error!("invalid query '{line}': {err} (skipping query {qid})");
                outcome.invalid += 1;
                continue;
            }
        };
        if blacklist.is_blacklisted(&wire) {
            debug!("query '{line}' blacklisted (skipping query {qid})");
            outcome.blacklisted += 1;
            continue;
        }
        batch.push((qid, wire));
        if batch.len() == BATCH_SIZE {
            store_batch(store, &mut batch, &mut outcome)?;
        }
    }
    store_batch(store, &mut batch, &mut outcome)?;
    info!(
        "stored {} of {} queries, {} invalid, {} blacklisted",
        outcome.stored, outcome.read, outcome.invalid, outcome.blacklisted
    );
    Ok(outcome)
}

fn store_batch(
    store: &Store,
    batch: &mut Vec<(Qid, Vec<u8>)>,
    outcome: &mut Outcome,
) -> Result<(), Error> {
    store.put_queries(batch.iter().map(|(qid, wire)| (*qid, wire.as_slice())))?;
    outcome.stored += batch.len() as u64;
    batch.clear();
    Ok(())
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::matcher::describe_query;
    use crate::store::test::store_with_servers;
    use rstest::rstest;

    #[test]
    fn query_from_text() {
        let wire = wire_from_text("Example.COM. AAAA").unwrap();
        let msg = Message::from_octets(wire.as_slice()).unwrap();
        assert!(msg.header().rd());
        assert!(!msg.header().qr());
        let opt = msg.opt().unwrap();
        assert!(opt.dnssec_ok());
        assert_eq!(opt.udp_payload_size(), 4096);
        assert_eq!(
            describe_query(&wire).unwrap().to_lowercase(),
            "example.com aaaa"
        );

        let numeric = wire_from_text("example.com 28").unwrap();
        assert_eq!(
            describe_query(&numeric).unwrap().to_lowercase(),
            "example.com aaaa"
        );
    }

    #[rstest]
    #[case("example.com")]
    #[case("example.com. NOSUCHTYPE")]
    #[case("exa..mple.com. A")]
    fn invalid_lines(#[case] line: &str) {
        assert!(wire_from_text(line).is_err());
    }

    #[rstest]
    #[case("example.com. A", false)]
    #[case("example.com. ANY", true)]
    #[case("example.com. RRSIG", true)]
    #[case("printer.local. A", true)]
    #[case("a.b.dotnxdomain.net. AAAA", true)]
    #[case("dashnxdomain.net. A", true)]
    #[case("notlocal. A", false)]
    fn blacklisted(#[case] line: &str, #[case] expected: bool) {
        let wire = wire_from_text(line).unwrap();
        assert_eq!(Blacklist::default().is_blacklisted(&wire), expected);
    }

    #[test]
    fn responses_are_blacklisted() {
        let mut wire = wire_from_text("example.com. A").unwrap();
        wire[2] |= 0x80;
        assert!(Blacklist::default().is_blacklisted(&wire));
        assert!(!Blacklist::default().is_blacklisted(b"garbage"));
    }

    #[test]
    fn fills_store() {
        let (_dir, store) = store_with_servers(&["a", "b"]);
        let input = "example.com. A\n\nexample.net. ANY\nbroken\n\
                     example.org. MX\n";
        let outcome = run(&store, input.as_bytes()).unwrap();
        assert_eq!(
            outcome,
            Outcome {
                read: 4,
                stored: 2,
                invalid: 1,
                blacklisted: 1
            }
        );
        let qids: Vec<_> = store
            .iterate_queries()
            .map(|query| query.unwrap().qid)
            .collect();
        assert_eq!(qids, [1, 4]);
        assert!(run(&store, "example.com. A\n".as_bytes()).is_err());
    }
}
