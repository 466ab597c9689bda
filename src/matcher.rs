//! Comparing answers.
//!
//! Answers are compared field by field. Each answer is parsed once into
//! [`AnswerFields`], which holds a canonical textual rendering of every
//! field that can be compared. Two answers differ in a field if the
//! renderings differ.
//!
//! Timeouts and answers that cannot be parsed are handled before any field
//! is looked at. Two timeouts are equal and a timeout against an answer is
//! a mismatch in the synthetic [`FieldName::Timeout`] field. Likewise, two
//! answers broken in the same way are equal while any other combination
//! involving a broken answer is a [`FieldName::Malformed`] mismatch.

#![warn(missing_docs)]

use crate::config::FieldName;
use crate::dataformat::{Classification, FieldMismatch, MismatchValue};
use crate::store::{AnswerState, Reply};
use domain::base::iana::Rtype;
use domain::base::{Header, Message, ParsedName, ParsedRecord};
use domain::rdata::AllRecordData;
use tracing::warn;

//------------ Malformed ------------------------------------------------------

/// The reason why an answer could not be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Malformed {
    /// The message is shorter than a header.
    ShortMessage,

    /// The question section is broken.
    Question,

    /// A record is broken.
    Record,
}

impl Malformed {
    /// Returns the reason as reported in mismatches.
    pub fn as_str(self) -> &'static str {
        match self {
            Malformed::ShortMessage => "short message",
            Malformed::Question => "invalid question",
            Malformed::Record => "invalid record",
        }
    }
}

//------------ Parsed ---------------------------------------------------------

/// A reply prepared for comparison.
#[derive(Clone, Debug)]
pub enum Parsed {
    /// The server did not answer.
    Timeout,

    /// The answer could not be parsed.
    Malformed(Malformed),

    /// The fields of a valid answer.
    Answer(Box<AnswerFields>),
}

impl Parsed {
    /// Prepares a reply for comparison.
    pub fn new(reply: &Reply) -> Self {
        match reply.wire() {
            None => Parsed::Timeout,
            Some(wire) => match AnswerFields::from_wire(wire) {
                Ok(fields) => Parsed::Answer(Box::new(fields)),
                Err(err) => Parsed::Malformed(err),
            },
        }
    }
}

//------------ AnswerFields ---------------------------------------------------

/// The comparable fields of an answer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AnswerFields {
    opcode: String,
    qtype: String,
    qname: String,
    qcase: String,
    flags: String,
    rcode: String,
    question: Vec<String>,
    answer: Vec<String>,
    ttl: Vec<String>,
    answertypes: Vec<String>,
    answerrrsigs: Vec<String>,
    authority: Vec<String>,
    additional: Vec<String>,
    edns: String,
    nsid: String,
}

impl AnswerFields {
    /// Parses an answer in wire format.
    ///
    /// Every record of the message is parsed, so a message that is broken
    /// anywhere is rejected.
    pub fn from_wire(wire: &[u8]) -> Result<Self, Malformed> {
        let msg =
            Message::from_octets(wire).map_err(|_| Malformed::ShortMessage)?;
        let header = msg.header();
        let mut res = AnswerFields {
            opcode: header.opcode().to_string(),
            flags: flags_text(header),
            rcode: msg.opt_rcode().to_string(),
            ..Default::default()
        };

        let question = msg.question();
        for item in question {
            let item = item.map_err(|_| Malformed::Question)?;
            let qname = item.qname().to_string();
            if res.question.is_empty() {
                res.qtype = item.qtype().to_string();
                res.qname = qname.to_ascii_lowercase();
                res.qcase.clone_from(&qname);
            }
            res.question.push(format!(
                "{} {} {}",
                qname,
                item.qclass(),
                item.qtype()
            ));
        }

        let mut section = question.answer().map_err(|_| Malformed::Record)?;
        let mut answertypes = Vec::new();
        let mut answerrrsigs = Vec::new();
        for rr in &mut section {
            let rr = rr.map_err(|_| Malformed::Record)?;
            let info = RecordInfo::parse(rr)?;
            res.ttl
                .push(format!("{} {} {}", info.owner, info.rtype, info.ttl));
            match info.covered {
                Some(covered) => answerrrsigs.push(covered),
                None => answertypes.push(info.rtype),
            }
            res.answer.push(info.text());
        }
        res.answertypes = type_set(answertypes, |rtype| rtype.to_string());
        res.answerrrsigs =
            type_set(answerrrsigs, |rtype| format!("RRSIG({rtype})"));

        let mut section = section
            .next_section()
            .map_err(|_| Malformed::Record)?
            .ok_or(Malformed::Record)?;
        for rr in &mut section {
            let rr = rr.map_err(|_| Malformed::Record)?;
            res.authority.push(RecordInfo::parse(rr)?.text());
        }

        let section = section
            .next_section()
            .map_err(|_| Malformed::Record)?
            .ok_or(Malformed::Record)?;
        for rr in section {
            let rr = rr.map_err(|_| Malformed::Record)?;
            if rr.rtype() == Rtype::OPT {
                continue;
            }
            res.additional.push(RecordInfo::parse(rr)?.text());
        }

        res.answer.sort();
        res.ttl.sort();
        res.authority.sort();
        res.additional.sort();

        match msg.opt() {
            Some(opt) => {
                res.edns = format!(
                    "version {} {} udp_payload {}",
                    opt.version(),
                    if opt.dnssec_ok() { "DO" } else { "no DO" },
                    opt.udp_payload_size()
                );
                if let Some(nsid) = opt.opt().nsid() {
                    res.nsid = nsid_text(nsid.as_slice());
                }
            }
            None => res.edns = "no EDNS".into(),
        }
        Ok(res)
    }

    /// Returns the value of a criterion.
    ///
    /// The synthetic fields have no value in an answer and return `None`.
    pub fn value(&self, field: FieldName) -> Option<MismatchValue> {
        use self::MismatchValue::{List, Text};

        Some(match field {
            FieldName::Timeout | FieldName::Malformed => return None,
            FieldName::Opcode => Text(self.opcode.clone()),
            FieldName::Qtype => Text(self.qtype.clone()),
            FieldName::Qname => Text(self.qname.clone()),
            FieldName::Qcase => Text(self.qcase.clone()),
            FieldName::Flags => Text(self.flags.clone()),
            FieldName::Rcode => Text(self.rcode.clone()),
            FieldName::Question => List(self.question.clone()),
            FieldName::Answer => List(self.answer.clone()),
            FieldName::Ttl => List(self.ttl.clone()),
            FieldName::Answertypes => List(self.answertypes.clone()),
            FieldName::Answerrrsigs => List(self.answerrrsigs.clone()),
            FieldName::Authority => List(self.authority.clone()),
            FieldName::Additional => List(self.additional.clone()),
            FieldName::Edns => Text(self.edns.clone()),
            FieldName::Nsid => Text(self.nsid.clone()),
        })
    }
}

/// The parts of a record relevant for comparison.
struct RecordInfo {
    /// The owner in lowercase.
    owner: String,

    /// The class mnemonic.
    class: String,

    /// The record type.
    rtype: Rtype,

    /// The TTL in seconds.
    ttl: u32,

    /// The record data in presentation format.
    data: String,

    /// The type covered if this is an RRSIG record.
    covered: Option<Rtype>,
}

impl RecordInfo {
    fn parse(rr: ParsedRecord<'_, &[u8]>) -> Result<Self, Malformed> {
        let record = rr
            .into_record::<AllRecordData<_, ParsedName<_>>>()
            .map_err(|_| Malformed::Record)?
            .ok_or(Malformed::Record)?;
        let covered = match record.data() {
            AllRecordData::Rrsig(rrsig) => Some(rrsig.type_covered()),
            _ => None,
        };
        Ok(RecordInfo {
            owner: record.owner().to_string().to_ascii_lowercase(),
            class: record.class().to_string(),
            rtype: record.rtype(),
            ttl: record.ttl().as_secs(),
            data: record.data().to_string(),
            covered,
        })
    }

    /// Returns the record without its TTL.
    fn text(&self) -> String {
        format!("{} {} {} {}", self.owner, self.class, self.rtype, self.data)
    }
}

/// Returns the header flags in presentation format.
fn flags_text(header: Header) -> String {
    [
        (header.qr(), "QR"),
        (header.aa(), "AA"),
        (header.tc(), "TC"),
        (header.rd(), "RD"),
        (header.ra(), "RA"),
        (header.ad(), "AD"),
        (header.cd(), "CD"),
    ]
    .iter()
    .filter(|(set, _)| *set)
    .map(|(_, name)| *name)
    .collect::<Vec<_>>()
    .join(" ")
}

/// Returns the sorted set of record types.
fn type_set(
    mut types: Vec<Rtype>,
    text: impl Fn(Rtype) -> String,
) -> Vec<String> {
    types.sort_by_key(|rtype| rtype.to_int());
    types.dedup();
    types.into_iter().map(text).collect()
}

/// Returns the content of an NSID option.
///
/// Printable identifiers are returned as is, anything else as hex.
fn nsid_text(data: &[u8]) -> String {
    if data.iter().all(|ch| ch.is_ascii_graphic() || *ch == b' ') {
        String::from_utf8_lossy(data).into_owned()
    } else {
        data.iter().map(|ch| format!("{ch:02x}")).collect()
    }
}

//------------ Comparison -----------------------------------------------------

/// Compares two replies.
///
/// Returns the mismatches in the order of `criteria`.
pub fn match_replies(
    expected: &Reply,
    got: &Reply,
    criteria: &[FieldName],
) -> Vec<FieldMismatch> {
    match_parsed(&Parsed::new(expected), &Parsed::new(got), criteria)
}

/// Compares two prepared replies.
pub fn match_parsed(
    expected: &Parsed,
    got: &Parsed,
    criteria: &[FieldName],
) -> Vec<FieldMismatch> {
    match (expected, got) {
        (Parsed::Timeout, Parsed::Timeout) => Vec::new(),
        (Parsed::Timeout, _) => {
            vec![FieldMismatch::new(FieldName::Timeout, "timeout", "answer")]
        }
        (_, Parsed::Timeout) => {
            vec![FieldMismatch::new(FieldName::Timeout, "answer", "timeout")]
        }
        (Parsed::Malformed(exp), Parsed::Malformed(got)) if exp == got => {
            warn!("answers malformed in the same way: {}", exp.as_str());
            Vec::new()
        }
        (Parsed::Malformed(exp), Parsed::Malformed(got)) => {
            vec![FieldMismatch::new(
                FieldName::Malformed,
                exp.as_str(),
                got.as_str(),
            )]
        }
        (Parsed::Malformed(exp), Parsed::Answer(_)) => {
            vec![FieldMismatch::new(FieldName::Malformed, exp.as_str(), "valid")]
        }
        (Parsed::Answer(_), Parsed::Malformed(got)) => {
            vec![FieldMismatch::new(FieldName::Malformed, "valid", got.as_str())]
        }
        (Parsed::Answer(exp), Parsed::Answer(got)) => criteria
            .iter()
            .filter_map(|field| {
                let exp_val = exp.value(*field)?;
                let got_val = got.value(*field)?;
                (exp_val != got_val).then(|| FieldMismatch {
                    field: *field,
                    exp_val,
                    got_val,
                })
            })
            .collect(),
    }
}

/// Classifies the answers of all servers to one query.
///
/// The answers of the other servers are compared against the first other
/// server. If any of them differ, the query is upstream unstable.
/// Otherwise the first other server is compared against the target.
///
/// Returns `None` if the answer of any server is still pending.
pub fn compare(
    answers: &[AnswerState],
    target: usize,
    criteria: &[FieldName],
) -> Option<(Classification, Vec<FieldMismatch>)> {
    let parsed = answers
        .iter()
        .map(|state| state.reply().map(Parsed::new))
        .collect::<Option<Vec<_>>>()?;
    let target_answer = parsed.get(target)?;
    let mut others = parsed
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != target)
        .map(|(_, parsed)| parsed);
    let first = others.next()?;
    for other in others {
        if !match_parsed(first, other, criteria).is_empty() {
            return Some((Classification::UpstreamUnstable, Vec::new()));
        }
    }
    let mismatches = match_parsed(first, target_answer, criteria);
    if mismatches.is_empty() {
        Some((Classification::Match, mismatches))
    } else {
        Some((Classification::TargetDisagreement, mismatches))
    }
}

/// Returns the question of a query as `qname qtype`.
pub fn describe_query(wire: &[u8]) -> Option<String> {
    let msg = Message::from_octets(wire).ok()?;
    let question = msg.first_question()?;
    Some(format!("{} {}", question.qname(), question.qtype()))
}

//============ Testing =======================================================
