//! Binary encoding of keys and answer records.
//!
//! Keys are query IDs encoded as four big-endian octets so that the
//! lexicographic order of the keys equals the numeric order of the IDs.
//!
//! The value stored for a query ID in the answers table is the
//! concatenation of one entry per server in server order:
//!
//! ```text
//! +-----------+-------------+----------------------+
//! | time (u32)| length (u16)| wire (length octets) |
//! +-----------+-------------+----------------------+
//! ```
//!
//! Both integers are little-endian. A time of `0xFFFF_FFFF` marks a
//! timeout, in which case the length is present and zero.

use super::Error;
use crate::Qid;

/// The time value marking a timeout.
pub const TIMEOUT_SENTINEL: u32 = 0xFFFF_FFFF;

/// Size of the fixed part of an answer entry.
const ENTRY_HEADER_LEN: usize = 6;

//------------ Reply ----------------------------------------------------------

/// The reply of a single server to a single query.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Reply {
    /// The server answered.
    Answer {
        /// Time between sending the query and receiving the answer.
        elapsed_usec: u32,

        /// The answer in wire format.
        wire: Vec<u8>,
    },

    /// No usable answer arrived in time.
    Timeout,
}

impl Reply {
    /// Creates an answer.
    ///
    /// An elapsed time equal to the timeout sentinel is reduced by one so
    /// that it cannot be mistaken for a timeout.
    pub fn answer(elapsed_usec: u32, wire: Vec<u8>) -> Self {
        Reply::Answer {
            elapsed_usec: elapsed_usec.min(TIMEOUT_SENTINEL - 1),
            wire,
        }
    }

    /// Returns whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Reply::Timeout)
    }

    /// Returns the wire data of an answer.
    pub fn wire(&self) -> Option<&[u8]> {
        match self {
            Reply::Answer { wire, .. } => Some(wire),
            Reply::Timeout => None,
        }
    }

    /// Returns the elapsed time of an answer.
    pub fn elapsed_usec(&self) -> Option<u32> {
        match self {
            Reply::Answer { elapsed_usec, .. } => Some(*elapsed_usec),
            Reply::Timeout => None,
        }
    }

    /// Appends the binary encoding of the reply to `target`.
    pub fn encode_into(&self, target: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            Reply::Answer { elapsed_usec, wire } => {
                let len = u16::try_from(wire.len())
                    .map_err(|_| Error::AnswerTooLong(wire.len()))?;
                target.extend_from_slice(&elapsed_usec.to_le_bytes());
                target.extend_from_slice(&len.to_le_bytes());
                target.extend_from_slice(wire);
            }
            Reply::Timeout => {
                target.extend_from_slice(&TIMEOUT_SENTINEL.to_le_bytes());
                target.extend_from_slice(&0u16.to_le_bytes());
            }
        }
        Ok(())
    }
}

//------------ Key encoding ---------------------------------------------------

/// Encodes a query ID as a table key.
pub fn qid_to_key(qid: Qid) -> [u8; 4] {
    qid.to_be_bytes()
}

/// Decodes a table key into a query ID.
pub fn key_to_qid(table: &'static str, key: &[u8]) -> Result<Qid, Error> {
    let key: [u8; 4] = key.try_into().map_err(|_| Error::Corrupt {
        table,
        key: key.to_vec(),
        reason: "key is not four octets long",
    })?;
    Ok(Qid::from_be_bytes(key))
}

//------------ Answer blobs ---------------------------------------------------

/// Encodes the replies of consecutive servers.
pub fn encode_replies<'a>(
    replies: impl IntoIterator<Item = &'a Reply>,
) -> Result<Vec<u8>, Error> {
    let mut res = Vec::new();
    for reply in replies {
        reply.encode_into(&mut res)?;
    }
    Ok(res)
}

/// Decodes an answer blob.
///
/// The blob must consist of complete entries only and contain at most
/// `max_entries` of them.
pub fn decode_replies(
    key: &[u8],
    mut blob: &[u8],
    max_entries: usize,
) -> Result<Vec<Reply>, Error> {
    let corrupt = |reason| Error::Corrupt {
        table: "answers",
        key: key.to_vec(),
        reason,
    };
    let mut res = Vec::new();
    while !blob.is_empty() {
        if res.len() == max_entries {
            return Err(corrupt("more answers than servers"));
        }
        if blob.len() < ENTRY_HEADER_LEN {
            return Err(corrupt("truncated answer header"));
        }
        let time = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        let len = usize::from(u16::from_le_bytes([blob[4], blob[5]]));
        blob = &blob[ENTRY_HEADER_LEN..];
        if blob.len() < len {
            return Err(corrupt("truncated answer data"));
        }
        let (wire, rest) = blob.split_at(len);
        blob = rest;
        if time == TIMEOUT_SENTINEL {
            if len != 0 {
                return Err(corrupt("timeout with answer data"));
            }
            res.push(Reply::Timeout);
        } else {
            res.push(Reply::Answer {
                elapsed_usec: time,
                wire: wire.to_vec(),
            });
        }
    }
    Ok(res)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn answer_layout() {
        let blob = encode_replies(&[Reply::answer(1000, b"ab".to_vec())])
            .unwrap();
        assert_eq!(blob, [0xe8, 0x03, 0, 0, 2, 0, b'a', b'b']);
        assert_eq!(
            decode_replies(b"key0", &blob, 1).unwrap(),
            [Reply::answer(1000, b"ab".to_vec())]
        );
    }

    #[test]
    fn timeout_layout() {
        let blob = encode_replies(&[Reply::Timeout]).unwrap();
        assert_eq!(blob, [0xff, 0xff, 0xff, 0xff, 0, 0]);
        let replies = decode_replies(b"key0", &blob, 1).unwrap();
        assert_eq!(replies, [Reply::Timeout]);
        assert_eq!(replies[0].wire(), None);
    }

    #[test]
    fn multiple_servers() {
        let replies = [
            Reply::answer(3_000_000_000, Vec::new()),
            Reply::answer(3_000_000_000, b"ab".to_vec()),
            Reply::Timeout,
        ];
        let blob = encode_replies(&replies).unwrap();
        assert_eq!(decode_replies(b"key0", &blob, 3).unwrap(), replies);
    }

    #[test]
    fn sentinel_time_is_not_a_timeout() {
        assert_eq!(
            Reply::answer(TIMEOUT_SENTINEL, vec![1]).elapsed_usec(),
            Some(TIMEOUT_SENTINEL - 1)
        );
    }

    #[test]
    fn corrupt_blobs() {
        let good = encode_replies(&[Reply::answer(5, b"abc".to_vec())])
            .unwrap();
        // truncated data
        assert!(decode_replies(b"k", &good[..good.len() - 1], 1).is_err());
        // truncated header
        assert!(decode_replies(b"k", &good[..4], 1).is_err());
        // trailing garbage forms an incomplete second entry
        let mut trailing = good.clone();
        trailing.push(0);
        assert!(decode_replies(b"k", &trailing, 2).is_err());
        // too many entries
        let mut two = good.clone();
        two.extend_from_slice(&good);
        assert!(decode_replies(b"k", &two, 1).is_err());
        // timeout carrying data
        let bad_timeout = [0xff, 0xff, 0xff, 0xff, 1, 0, b'x'];
        assert!(decode_replies(b"k", &bad_timeout, 1).is_err());
    }

    #[test]
    fn keys_sort_numerically() {
        assert!(qid_to_key(255) < qid_to_key(256));
        assert_eq!(key_to_qid("queries", &qid_to_key(70000)).unwrap(), 70000);
        assert!(key_to_qid("queries", b"abc").is_err());
    }

    #[test]
    fn oversized_answer() {
        let reply = Reply::answer(1, vec![0; 70000]);
        assert!(matches!(
            reply.encode_into(&mut Vec::new()),
            Err(Error::AnswerTooLong(70000))
        ));
    }
}
