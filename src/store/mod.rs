//! The record store holding queries, answers, and run metadata.
//!
//! A store lives in a directory and consists of three tables:
//!
//! * `queries` maps a query ID to the query in wire format,
//! * `answers` maps a query ID to the replies of all servers, and
//! * `meta` maps textual keys to metadata such as the server list.
//!
//! The tables are kept in an SQLite database with a write-ahead log. All
//! writes are serialized through a single locked connection and each write
//! is one transaction, so concurrent writers never see or produce partial
//! records. Reads use a second connection and see a consistent snapshot
//! per statement, so they can proceed while a run is writing answers.
//!
//! Keys and values are binary and follow the layout described in
//! [`codec`], which allows external tools to produce or consume the data.

#![warn(missing_docs)]

pub mod codec;

pub use self::codec::{Reply, TIMEOUT_SENTINEL};

use self::codec::{decode_replies, key_to_qid, qid_to_key};
use crate::config::{ServerConfig, Transport};
use crate::Qid;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{error, fmt, fs, io};
use tracing::debug;

/// The name of the database file inside the store directory.
pub const DB_FILENAME: &str = "respdiff.sqlite3";

/// The version of the binary format.
pub const VERSION: &str = "2018-05-21";

/// How many rows are fetched at once while iterating a table.
const PAGE_SIZE: i64 = 1024;

/// How long to wait for a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

//------------ Table ----------------------------------------------------------

/// The tables of a store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Table {
    /// Queries by query ID.
    Queries,

    /// Answers by query ID.
    Answers,

    /// Metadata by name.
    Meta,
}

impl Table {
    /// Returns the SQL name of the table.
    pub fn name(self) -> &'static str {
        match self {
            Table::Queries => "queries",
            Table::Answers => "answers",
            Table::Meta => "meta",
        }
    }
}

//------------ Query ----------------------------------------------------------

/// A stored query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Query {
    /// The query ID.
    pub qid: Qid,

    /// The query in wire format.
    pub wire: Vec<u8>,
}

//------------ AnswerState ----------------------------------------------------

/// The state of the answer of one server to one query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AnswerState {
    /// Nothing has been recorded for this server yet.
    Pending,

    /// The reply has been recorded.
    Replied(Reply),
}

impl AnswerState {
    /// Returns the recorded reply, if any.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            AnswerState::Pending => None,
            AnswerState::Replied(reply) => Some(reply),
        }
    }
}

//------------ ServerId -------------------------------------------------------

/// The identity of a server as recorded in the metadata.
///
/// Only the name is required. Transport and endpoint are recorded by
/// respdiff but may be missing in stores created by other tools.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerId {
    /// The name of the server.
    pub name: String,

    /// The transport protocol.
    pub transport: Option<String>,

    /// The address and port.
    pub endpoint: Option<String>,
}

impl ServerId {
    /// Creates a server identity with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: None,
            endpoint: None,
        }
    }
}

impl From<&ServerConfig> for ServerId {
    fn from(server: &ServerConfig) -> Self {
        Self {
            name: server.name().into(),
            transport: Some(server.transport().to_string()),
            endpoint: Some(server.addr().to_string()),
        }
    }
}

impl From<(&str, Transport, &str)> for ServerId {
    fn from((name, transport, endpoint): (&str, Transport, &str)) -> Self {
        Self {
            name: name.into(),
            transport: Some(transport.to_string()),
            endpoint: Some(endpoint.into()),
        }
    }
}

//------------ Store ----------------------------------------------------------

/// A record store.
pub struct Store {
    /// The path of the database file.
    path: PathBuf,

    /// The connection used for all writes.
    writer: Mutex<Connection>,

    /// The connection used for reads.
    reader: Mutex<Connection>,

    /// The number of servers according to the metadata.
    ///
    /// Zero if the server list has not been written yet.
    server_count: RwLock<usize>,
}

impl Store {
    /// Opens the store in the given directory.
    ///
    /// The directory and the tables are created if necessary. A store with
    /// a different format version is rejected.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|err| Error::Io(dir.into(), err))?;
        let path = dir.join(DB_FILENAME);

        let writer = Connection::open(&path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = writer.pragma_update_and_check(
            None,
            "journal_mode",
            "WAL",
            |row| row.get(0),
        )?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        for table in [Table::Queries, Table::Answers, Table::Meta] {
            writer.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key BLOB PRIMARY KEY NOT NULL,
                    value BLOB NOT NULL
                ) WITHOUT ROWID;",
                table.name()
            ))?;
        }

        let reader = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        let store = Self {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            server_count: RwLock::new(0),
        };
        match store.read_version()? {
            Some(version) if version != VERSION => {
                return Err(Error::Version(version));
            }
            Some(_) => {}
            None => store.set_meta("version", VERSION.as_bytes())?,
        }
        if let Some(servers) = store.read_servers()? {
            *store.server_count.write() = servers.len();
        }
        debug!("opened store {}", store.path.display());
        Ok(store)
    }

    /// Returns the path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of records in a table.
    pub fn count(&self, table: Table) -> Result<u64, Error> {
        let conn = self.reader.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count.unsigned_abs())
    }

    //--- Queries

    /// Stores a query.
    ///
    /// Queries are immutable, storing a query ID twice is an error.
    pub fn put_query(&self, qid: Qid, wire: &[u8]) -> Result<(), Error> {
        self.put_queries([(qid, wire)])
    }

    /// Stores several queries in one transaction.
    pub fn put_queries<'a>(
        &self,
        queries: impl IntoIterator<Item = (Qid, &'a [u8])>,
    ) -> Result<(), Error> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO queries (key, value) VALUES (?1, ?2)",
            )?;
            for (qid, wire) in queries {
                let key = qid_to_key(qid);
                if tx
                    .query_row(
                        "SELECT 1 FROM queries WHERE key = ?1",
                        [&key[..]],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some()
                {
                    return Err(Error::QueryExists(qid));
                }
                stmt.execute(params![&key[..], wire])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns the query with the given ID.
    pub fn get_query(&self, qid: Qid) -> Result<Option<Vec<u8>>, Error> {
        self.get(Table::Queries, &qid_to_key(qid))
    }

    /// Returns an iterator over all queries in query ID order.
    ///
    /// The iterator fetches the queries in pages and can be created again
    /// to restart from the beginning.
    pub fn iterate_queries(
        &self,
    ) -> impl Iterator<Item = Result<Query, Error>> + '_ {
        TableIter::new(self, Table::Queries).map(|item| {
            let (key, wire) = item?;
            Ok(Query {
                qid: key_to_qid("queries", &key)?,
                wire,
            })
        })
    }

    //--- Answers

    /// Appends the reply of a single server to the answers for a query.
    ///
    /// Replies must be appended in server order, i.e., `server_index` must
    /// be equal to the number of replies already stored for the query.
    pub fn append_answer(
        &self,
        qid: Qid,
        server_index: u8,
        reply: &Reply,
    ) -> Result<(), Error> {
        self.put_answers(qid, usize::from(server_index), [reply])
    }

    /// Appends the replies of consecutive servers in one transaction.
    ///
    /// The first reply belongs to the server with index `first_index`.
    /// The query must have been stored before.
    pub fn put_answers<'a>(
        &self,
        qid: Qid,
        first_index: usize,
        replies: impl IntoIterator<Item = &'a Reply>,
    ) -> Result<(), Error> {
        let servers = self.server_count()?;
        let key = qid_to_key(qid);
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        if tx
            .query_row(
                "SELECT 1 FROM queries WHERE key = ?1",
                [&key[..]],
                |_| Ok(()),
            )
            .optional()?
            .is_none()
        {
            return Err(Error::UnknownQuery(qid));
        }
        let mut blob: Vec<u8> = tx
            .query_row(
                "SELECT value FROM answers WHERE key = ?1",
                [&key[..]],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or_default();
        let present = decode_replies(&key, &blob, servers)?.len();
        if present != first_index {
            return Err(Error::AnswerOutOfOrder {
                qid,
                expected: present,
                got: first_index,
            });
        }
        let mut index = first_index;
        for reply in replies {
            if index >= servers {
                return Err(Error::ServerIndex(index));
            }
            reply.encode_into(&mut blob)?;
            index += 1;
        }
        tx.execute(
            "INSERT OR REPLACE INTO answers (key, value) VALUES (?1, ?2)",
            params![&key[..], blob],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns the replies recorded for a query in server order.
    ///
    /// Servers without a recorded reply are missing at the end.
    pub fn get_replies(&self, qid: Qid) -> Result<Vec<Reply>, Error> {
        let servers = self.server_count()?;
        let key = qid_to_key(qid);
        match self.get(Table::Answers, &key)? {
            Some(blob) => decode_replies(&key, &blob, servers),
            None => Ok(Vec::new()),
        }
    }

    /// Returns the answer state of every server for a query.
    ///
    /// The result has one entry per server in server order.
    pub fn iterate_answers(&self, qid: Qid) -> Result<Vec<AnswerState>, Error> {
        let servers = self.server_count()?;
        Ok(pad_states(self.get_replies(qid)?, servers))
    }

    /// Returns whether all servers have a reply for a query.
    pub fn has_complete_answer(&self, qid: Qid) -> Result<bool, Error> {
        Ok(self.get_replies(qid)?.len() == self.server_count()?)
    }

    /// Returns an iterator over the answers of all queries in ID order.
    pub fn iterate_answer_records(
        &self,
    ) -> impl Iterator<Item = Result<(Qid, Vec<AnswerState>), Error>> + '_
    {
        TableIter::new(self, Table::Answers).map(|item| {
            let (key, blob) = item?;
            let servers = self.server_count()?;
            let qid = key_to_qid("answers", &key)?;
            let replies = decode_replies(&key, &blob, servers)?;
            Ok((qid, pad_states(replies, servers)))
        })
    }

    //--- Metadata

    /// Returns the value of a metadata key.
    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.get(Table::Meta, key.as_bytes())
    }

    /// Sets the value of a metadata key.
    pub fn set_meta(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key.as_bytes(), value],
        )?;
        Ok(())
    }

    /// Returns the format version recorded in the metadata.
    pub fn read_version(&self) -> Result<Option<String>, Error> {
        self.get_meta_str("version")
    }

    /// Returns the list of servers recorded in the metadata.
    pub fn read_servers(&self) -> Result<Option<Vec<ServerId>>, Error> {
        let count = match self.get_meta_u32("servers")? {
            Some(count) => count,
            None => return Ok(None),
        };
        let mut res = Vec::new();
        for i in 0..count {
            let key = format!("name{i}");
            let name = self.get_meta_str(&key)?.ok_or_else(|| {
                Error::Corrupt {
                    table: "meta",
                    key: key.into_bytes(),
                    reason: "missing server name",
                }
            })?;
            res.push(ServerId {
                name,
                transport: self.get_meta_str(&format!("transport{i}"))?,
                endpoint: self.get_meta_str(&format!("endpoint{i}"))?,
            });
        }
        Ok(Some(res))
    }

    /// Records the list of servers in the metadata.
    ///
    /// The server list fixes the meaning of the server index and can only
    /// be written once.
    pub fn write_servers(&self, servers: &[ServerId]) -> Result<(), Error> {
        if self.read_servers()?.is_some() {
            return Err(Error::ServersExist);
        }
        let count = u32::try_from(servers.len())
            .ok()
            .filter(|count| *count <= u32::from(u8::MAX) + 1)
            .ok_or(Error::ServerIndex(servers.len()))?;
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            )?;
            stmt.execute(params![&b"servers"[..], &count.to_le_bytes()[..]])?;
            for (i, server) in servers.iter().enumerate() {
                stmt.execute(params![
                    format!("name{i}").as_bytes(),
                    server.name.as_bytes()
                ])?;
                if let Some(transport) = server.transport.as_ref() {
                    stmt.execute(params![
                        format!("transport{i}").as_bytes(),
                        transport.as_bytes()
                    ])?;
                }
                if let Some(endpoint) = server.endpoint.as_ref() {
                    stmt.execute(params![
                        format!("endpoint{i}").as_bytes(),
                        endpoint.as_bytes()
                    ])?;
                }
            }
        }
        tx.commit()?;
        *self.server_count.write() = servers.len();
        Ok(())
    }

    /// Checks that the recorded servers have the given names.
    ///
    /// Returns `Ok(false)` if no servers are recorded yet.
    pub fn check_servers(&self, names: &[String]) -> Result<bool, Error> {
        match self.read_servers()? {
            None => Ok(false),
            Some(servers) => {
                let recorded: Vec<_> =
                    servers.into_iter().map(|s| s.name).collect();
                if recorded.as_slice() == names {
                    Ok(true)
                } else {
                    Err(Error::ServerMismatch {
                        recorded,
                        configured: names.to_vec(),
                    })
                }
            }
        }
    }

    /// Returns the start time of the run in UNIX seconds.
    pub fn read_start_time(&self) -> Result<Option<u32>, Error> {
        self.get_meta_u32("start_time")
    }

    /// Records the start time of the run.
    pub fn write_start_time(&self, time: u32) -> Result<(), Error> {
        self.set_meta("start_time", &time.to_le_bytes())
    }

    /// Returns the end time of the run in UNIX seconds.
    pub fn read_end_time(&self) -> Result<Option<u32>, Error> {
        self.get_meta_u32("end_time")
    }

    /// Records the end time of the run.
    pub fn write_end_time(&self, time: u32) -> Result<(), Error> {
        self.set_meta("end_time", &time.to_le_bytes())
    }

    //--- Helpers

    /// Returns the number of servers or an error if it is unknown.
    fn server_count(&self) -> Result<usize, Error> {
        match *self.server_count.read() {
            0 => Err(Error::NoServers),
            count => Ok(count),
        }
    }

    /// Returns the value for a key.
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT value FROM {} WHERE key = ?1",
            table.name()
        ))?;
        Ok(stmt.query_row([key], |row| row.get(0)).optional()?)
    }

    /// Returns up to a page of records with keys greater than `after`.
    fn page(
        &self,
        table: Table,
        after: &[u8],
    ) -> Result<VecDeque<(Vec<u8>, Vec<u8>)>, Error> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT key, value FROM {} WHERE key > ?1 ORDER BY key LIMIT ?2",
            table.name()
        ))?;
        let rows = stmt.query_map(params![after, PAGE_SIZE], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut res = VecDeque::new();
        for row in rows {
            res.push_back(row?);
        }
        Ok(res)
    }

    /// Returns a metadata value as text.
    fn get_meta_str(&self, key: &str) -> Result<Option<String>, Error> {
        self.get_meta(key)?
            .map(|value| {
                String::from_utf8(value).map_err(|_| Error::Corrupt {
                    table: "meta",
                    key: key.as_bytes().to_vec(),
                    reason: "value is not valid UTF-8",
                })
            })
            .transpose()
    }

    /// Returns a metadata value as a little-endian `u32`.
    fn get_meta_u32(&self, key: &str) -> Result<Option<u32>, Error> {
        self.get_meta(key)?
            .map(|value| {
                <[u8; 4]>::try_from(value.as_slice())
                    .map(u32::from_le_bytes)
                    .map_err(|_| Error::Corrupt {
                        table: "meta",
                        key: key.as_bytes().to_vec(),
                        reason: "value is not a 32 bit integer",
                    })
            })
            .transpose()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

/// Converts stored replies into one state per server.
fn pad_states(replies: Vec<Reply>, servers: usize) -> Vec<AnswerState> {
    let mut res: Vec<_> =
        replies.into_iter().map(AnswerState::Replied).collect();
    res.resize(servers, AnswerState::Pending);
    res
}

//------------ TableIter ------------------------------------------------------

/// An iterator over the raw records of a table in key order.
struct TableIter<'a> {
    /// The store to read from.
    store: &'a Store,

    /// The table to read.
    table: Table,

    /// The last key returned.
    last: Vec<u8>,

    /// The records fetched but not yet returned.
    page: VecDeque<(Vec<u8>, Vec<u8>)>,

    /// Whether the end of the table has been reached.
    done: bool,
}

impl<'a> TableIter<'a> {
    /// Creates an iterator starting at the first record.
    fn new(store: &'a Store, table: Table) -> Self {
        Self {
            store,
            table,
            last: Vec::new(),
            page: VecDeque::new(),
            done: false,
        }
    }
}

impl Iterator for TableIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            match self.store.page(self.table, &self.last) {
                Ok(page) => {
                    self.done = page.len() < PAGE_SIZE as usize;
                    self.page = page;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        let (key, value) = self.page.pop_front()?;
        self.last.clone_from(&key);
        Some(Ok((key, value)))
    }
}

//============ Error Types ===================================================

/// An error happened while accessing a store.
#[derive(Debug)]
pub enum Error {
    /// The store directory could not be created.
    Io(PathBuf, io::Error),

    /// The database reported an error.
    Sqlite(rusqlite::Error),

    /// The store has an unsupported format version.
    Version(String),

    /// A stored record is malformed.
    Corrupt {
        /// The table of the record.
        table: &'static str,

        /// The key of the record.
        key: Vec<u8>,

        /// What is wrong with it.
        reason: &'static str,
    },

    /// A query with this ID already exists.
    QueryExists(Qid),

    /// There is no query with this ID.
    UnknownQuery(Qid),

    /// Answers were appended out of server order.
    AnswerOutOfOrder {
        /// The query ID.
        qid: Qid,

        /// The index of the next server.
        expected: usize,

        /// The index of the server given.
        got: usize,
    },

    /// The server index is beyond the list of servers.
    ServerIndex(usize),

    /// An answer is longer than 65535 octets.
    AnswerTooLong(usize),

    /// The server list has not been recorded.
    NoServers,

    /// The server list has already been recorded.
    ServersExist,

    /// The recorded servers differ from the configured ones.
    ServerMismatch {
        /// The recorded server names.
        recorded: Vec<String>,

        /// The configured server names.
        configured: Vec<String>,
    },
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(path, err) => {
                write!(f, "cannot create store {}: {}", path.display(), err)
            }
            Error::Sqlite(err) => write!(f, "database error: {err}"),
            Error::Version(version) => write!(
                f,
                "unsupported store version {version} (expected {VERSION})"
            ),
            Error::Corrupt { table, key, reason } => write!(
                f,
                "corrupt record in table {table}, key {key:02x?}: {reason}"
            ),
            Error::QueryExists(qid) => {
                write!(f, "query {qid} already exists")
            }
            Error::UnknownQuery(qid) => {
                write!(f, "answer for unknown query {qid}")
            }
            Error::AnswerOutOfOrder { qid, expected, got } => write!(
                f,
                "answer for query {qid}: expected server index {expected}, \
                 got {got}"
            ),
            Error::ServerIndex(index) => {
                write!(f, "server index {index} out of range")
            }
            Error::AnswerTooLong(len) => {
                write!(f, "answer of {len} octets is too long")
            }
            Error::NoServers => write!(f, "no server list in store metadata"),
            Error::ServersExist => {
                write!(f, "server list already present in store metadata")
            }
            Error::ServerMismatch {
                recorded,
                configured,
            } => write!(
                f,
                "store was created for servers {} but config lists {}",
                recorded.join(", "),
                configured.join(", ")
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(_, err) => Some(err),
            Error::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Opens a store with the given servers in a temporary directory.
    pub(crate) fn store_with_servers(
        names: &[&str],
    ) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let servers: Vec<_> =
            names.iter().map(|name| ServerId::named(*name)).collect();
        store.write_servers(&servers).unwrap();
        (dir, store)
    }

    #[test]
    fn queries_in_order() {
        let (_dir, store) = store_with_servers(&["a", "b"]);
        for qid in [300, 2, 70000, 1] {
            store.put_query(qid, &qid.to_le_bytes()).unwrap();
        }
        let qids: Vec<_> = store
            .iterate_queries()
            .map(|query| query.unwrap().qid)
            .collect();
        assert_eq!(qids, [1, 2, 300, 70000]);
        assert_eq!(store.get_query(300).unwrap(), Some(300u32.to_le_bytes().to_vec()));
        assert_eq!(store.get_query(4).unwrap(), None);
        assert!(matches!(
            store.put_query(2, b"x"),
            Err(Error::QueryExists(2))
        ));
    }

    #[test]
    fn iteration_crosses_pages() {
        let (_dir, store) = store_with_servers(&["a", "b"]);
        let count = PAGE_SIZE as u32 * 2 + 5;
        let wires: Vec<_> = (0..count).map(|qid| (qid, vec![1u8])).collect();
        store
            .put_queries(wires.iter().map(|(qid, w)| (*qid, w.as_slice())))
            .unwrap();
        assert_eq!(store.iterate_queries().count(), count as usize);
        assert_eq!(store.count(Table::Queries).unwrap(), u64::from(count));
        // restartable
        assert_eq!(store.iterate_queries().count(), count as usize);
    }

    #[test]
    fn pending_answers() {
        let (_dir, store) = store_with_servers(&["a", "b", "c"]);
        store.put_query(1, b"q").unwrap();
        assert_eq!(
            store.iterate_answers(1).unwrap(),
            [AnswerState::Pending, AnswerState::Pending, AnswerState::Pending]
        );
        let reply = Reply::answer(10, b"r".to_vec());
        store.append_answer(1, 0, &reply).unwrap();
        store.append_answer(1, 1, &Reply::Timeout).unwrap();
        assert_eq!(
            store.iterate_answers(1).unwrap(),
            [
                AnswerState::Replied(reply),
                AnswerState::Replied(Reply::Timeout),
                AnswerState::Pending
            ]
        );
        assert!(!store.has_complete_answer(1).unwrap());
    }

    #[test]
    fn answers_in_server_order() {
        let (_dir, store) = store_with_servers(&["a", "b"]);
        store.put_query(1, b"q").unwrap();
        assert!(matches!(
            store.append_answer(1, 1, &Reply::Timeout),
            Err(Error::AnswerOutOfOrder {
                expected: 0,
                got: 1,
                ..
            })
        ));
        store
            .put_answers(1, 0, &[Reply::Timeout, Reply::Timeout])
            .unwrap();
        assert!(store.has_complete_answer(1).unwrap());
        assert!(matches!(
            store.append_answer(1, 2, &Reply::Timeout),
            Err(Error::ServerIndex(2))
        ));
    }

    #[test]
    fn answers_need_a_query() {
        let (_dir, store) = store_with_servers(&["a", "b"]);
        assert!(matches!(
            store.put_answers(99, 0, &[Reply::Timeout]),
            Err(Error::UnknownQuery(99))
        ));
        assert_eq!(store.count(Table::Answers).unwrap(), 0);
        assert!(store.iterate_answer_records().next().is_none());
    }

    #[test]
    fn corrupt_answer_is_detected() {
        let (_dir, store) = store_with_servers(&["a", "b"]);
        {
            let conn = store.writer.lock();
            conn.execute(
                "INSERT INTO answers (key, value) VALUES (?1, ?2)",
                params![&qid_to_key(7)[..], &[1u8, 0, 0, 0, 9, 0, 1][..]],
            )
            .unwrap();
        }
        assert!(matches!(
            store.iterate_answers(7),
            Err(Error::Corrupt { .. })
        ));
        assert!(store.iterate_answer_records().any(|item| item.is_err()));
    }

    #[test]
    fn metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.read_version().unwrap().as_deref(), Some(VERSION));
        assert_eq!(store.read_servers().unwrap(), None);
        assert!(matches!(
            store.append_answer(1, 0, &Reply::Timeout),
            Err(Error::NoServers)
        ));
        let servers = [
            ServerId::from(("kresd", Transport::Udp, "127.0.0.1:53")),
            ServerId::named("bind"),
        ];
        store.write_servers(&servers).unwrap();
        assert_eq!(store.read_servers().unwrap().unwrap(), servers);
        assert!(matches!(
            store.write_servers(&servers),
            Err(Error::ServersExist)
        ));
        assert!(store
            .check_servers(&["kresd".into(), "bind".into()])
            .unwrap());
        assert!(store.check_servers(&["bind".into()]).is_err());

        assert_eq!(store.read_start_time().unwrap(), None);
        store.write_start_time(3_000_000_000).unwrap();
        assert_eq!(store.read_start_time().unwrap(), Some(3_000_000_000));
        assert_eq!(
            store.get_meta("start_time").unwrap().unwrap(),
            [0x00, 0x5e, 0xd0, 0xb2]
        );
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store
                .write_servers(&[ServerId::named("a"), ServerId::named("b")])
                .unwrap();
            store.put_query(1, b"q").unwrap();
            store
                .put_answers(1, 0, &[Reply::Timeout, Reply::Timeout])
                .unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_replies(1).unwrap().len(), 2);
    }

    #[test]
    fn version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.set_meta("version", b"1999-01-01").unwrap();
        }
        assert!(matches!(Store::open(dir.path()), Err(Error::Version(_))));
    }
}
