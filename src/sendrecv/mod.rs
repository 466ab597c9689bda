//! Sending queries to all servers and collecting their replies.
//!
//! A [`Worker`] owns one connection to every configured server. It sends a
//! query to all servers at once and waits for each reply independently
//! until a deadline shared by all servers of that query. Answers with a
//! message ID different from the query's are late answers to an earlier
//! query and are dropped.
//!
//! Transport problems are not errors here. A server that does not answer
//! in time, closes its stream, or cannot be reached at all simply produces
//! a [`Reply::Timeout`] and its connection is re-established for the next
//! query. Whether too many timeouts should end a run is decided by the
//! [`TimeoutTracker`].

#![warn(missing_docs)]

pub mod protocol;

use self::protocol::{
    AsyncConnect, TcpConnect, TlsConnect, UdpConnect, UdpDgram,
};
use crate::config::{SendRecvConfig, ServerConfig, Transport};
use crate::store::Reply;
use futures_util::future::join_all;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use std::{error, fmt, io};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

//------------ Worker ---------------------------------------------------------

/// A set of connections to all servers.
pub struct Worker {
    /// One connection per server in server order.
    servers: Vec<ServerConn>,

    /// Time to wait for the replies to one query.
    timeout: Duration,

    /// Range of the random delay before each query.
    time_delay: Option<(Duration, Duration)>,
}

impl Worker {
    /// Creates a worker for the given servers.
    ///
    /// Connections are established lazily when the first query is sent.
    pub fn new(
        servers: &[ServerConfig],
        config: &SendRecvConfig,
    ) -> Result<Self, io::Error> {
        let servers = servers
            .iter()
            .map(ServerConn::new)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            servers,
            timeout: config.timeout(),
            time_delay: config.time_delay(),
        })
    }

    /// Returns the number of servers.
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Sends a query to the servers starting at index `first`.
    ///
    /// Returns one reply for each of these servers in server order. If a
    /// delay is configured, a random time within its range passes before
    /// the query is sent.
    pub async fn send_recv(&mut self, query: &[u8], first: usize) -> Vec<Reply> {
        if let Some((min, max)) = self.time_delay {
            let delay = rand::thread_rng().gen_range(min..=max);
            trace!("delaying query by {delay:?}");
            sleep(delay).await;
        }
        let start = Instant::now();
        let deadline = start + self.timeout;
        join_all(
            self.servers
                .iter_mut()
                .skip(first)
                .map(|server| server.exchange(query, start, deadline)),
        )
        .await
    }
}

//------------ ServerConn -----------------------------------------------------

/// The connection to a single server.
struct ServerConn {
    /// The name of the server for logging.
    name: String,

    /// How to connect to the server.
    connector: Connector,

    /// The current connection, if any.
    conn: Option<Conn>,
}

impl ServerConn {
    fn new(config: &ServerConfig) -> Result<Self, io::Error> {
        let connector = match config.transport() {
            Transport::Udp => Connector::Udp(UdpConnect::new(config.addr())),
            Transport::Tcp => Connector::Tcp(TcpConnect::new(config.addr())),
            Transport::Tls => Connector::Tls(TlsConnect::new(
                config.addr(),
                config.tls_server_name(),
            )?),
        };
        Ok(Self {
            name: config.name().into(),
            connector,
            conn: None,
        })
    }

    /// Sends a query and waits for the answer until `deadline`.
    async fn exchange(
        &mut self,
        query: &[u8],
        start: Instant,
        deadline: Instant,
    ) -> Reply {
        // The connection is only put back after a successful exchange. A
        // connection that failed or timed out may still deliver stale data
        // and is replaced.
        let conn = self.conn.take();
        let res = timeout_at(deadline, async {
            let mut conn = match conn {
                Some(conn) => conn,
                None => self.connector.connect().await?,
            };
            let answer = conn.exchange(query).await?;
            Ok::<_, io::Error>((conn, answer))
        })
        .await;
        match res {
            Ok(Ok((conn, answer))) => {
                self.conn = Some(conn);
                let elapsed = u32::try_from(start.elapsed().as_micros())
                    .unwrap_or(u32::MAX);
                Reply::answer(elapsed, answer)
            }
            Ok(Err(err)) => {
                debug!("{}: {}", self.name, err);
                Reply::Timeout
            }
            Err(_) => {
                trace!("{}: timeout", self.name);
                Reply::Timeout
            }
        }
    }
}

//------------ Connector ------------------------------------------------------

/// How to connect to a server.
enum Connector {
    Udp(UdpConnect),
    Tcp(TcpConnect),
    Tls(TlsConnect),
}

impl Connector {
    async fn connect(&self) -> Result<Conn, io::Error> {
        Ok(match self {
            Connector::Udp(connect) => Conn::Udp(connect.connect().await?),
            Connector::Tcp(connect) => Conn::Tcp(connect.connect().await?),
            Connector::Tls(connect) => {
                Conn::Tls(Box::new(connect.connect().await?))
            }
        })
    }
}

//------------ Conn -----------------------------------------------------------

/// An established connection.
enum Conn {
    Udp(UdpDgram),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Conn {
    /// Sends a query and returns the answer with the same message ID.
    async fn exchange(&mut self, query: &[u8]) -> Result<Vec<u8>, io::Error> {
        match self {
            Conn::Udp(sock) => {
                sock.send(query).await?;
                loop {
                    let answer = sock.recv().await?;
                    if same_id(query, &answer) {
                        return Ok(answer);
                    }
                    trace!("dropping datagram with wrong message ID");
                }
            }
            Conn::Tcp(stream) => stream_exchange(stream, query).await,
            Conn::Tls(stream) => stream_exchange(stream.as_mut(), query).await,
        }
    }
}

/// Exchanges messages on a stream.
///
/// Messages are preceded by their length as a two octet integer, as
/// described in RFC 1035, section 4.2.2.
async fn stream_exchange<S>(
    stream: &mut S,
    query: &[u8],
) -> Result<Vec<u8>, io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "query too long")
    })?;
    let mut buf = Vec::with_capacity(query.len() + 2);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(query);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    loop {
        let len = stream.read_u16().await?;
        let mut answer = vec![0; usize::from(len)];
        stream.read_exact(&mut answer).await?;
        if same_id(query, &answer) {
            return Ok(answer);
        }
        trace!("dropping message with wrong message ID");
    }
}

/// Returns whether two messages have the same message ID.
fn same_id(query: &[u8], answer: &[u8]) -> bool {
    query.len() >= 2 && answer.len() >= 2 && query[..2] == answer[..2]
}

//------------ TimeoutTracker -------------------------------------------------

/// Counts consecutive timeouts per server across all workers.
///
/// A server that fails to answer `max_timeouts` queries in a row is most
/// likely dead and continuing the run would only record garbage.
#[derive(Debug)]
pub struct TimeoutTracker {
    /// The server names in server order.
    names: Vec<String>,

    /// The current number of consecutive timeouts per server.
    counters: Vec<AtomicU32>,

    /// The number of timeouts that is fatal.
    max_timeouts: u32,

    /// Never fail, only count.
    ignore: bool,
}

impl TimeoutTracker {
    /// Creates a new tracker.
    pub fn new(names: Vec<String>, max_timeouts: u32, ignore: bool) -> Self {
        let counters = names.iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            names,
            counters,
            max_timeouts,
            ignore,
        }
    }

    /// Records the replies of the servers starting at index `first`.
    pub fn record(
        &self,
        first: usize,
        replies: &[Reply],
    ) -> Result<(), Unresponsive> {
        let mut res = Ok(());
        for (index, reply) in replies.iter().enumerate() {
            let index = first + index;
            let Some(counter) = self.counters.get(index) else {
                continue;
            };
            if !reply.is_timeout() {
                counter.store(0, Ordering::Relaxed);
                continue;
            }
            let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if count >= self.max_timeouts && !self.ignore && res.is_ok() {
                res = Err(Unresponsive {
                    server: self.names[index].clone(),
                    timeouts: count,
                });
            }
        }
        res
    }
}

//============ Error Types ===================================================

/// A server stopped answering.
#[derive(Clone, Debug)]
pub struct Unresponsive {
    /// The name of the server.
    pub server: String,

    /// The number of consecutive timeouts.
    pub timeouts: u32,
}

impl fmt::Display for Unresponsive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server '{}' timed out {} times in a row, \
             use '--ignore-timeout' to suppress this error",
            self.server, self.timeouts
        )
    }
}

impl error::Error for Unresponsive {}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, UdpSocket};

    fn query(id: u16) -> Vec<u8> {
        let mut res = id.to_be_bytes().to_vec();
        res.extend_from_slice(&[1, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        res
    }

    fn sendrecv_config(timeout: Duration) -> SendRecvConfig {
        let mut res = SendRecvConfig::new();
        res.set_timeout(timeout);
        res
    }

    /// Starts a UDP server that first sends a stale answer, then the echo.
    async fn udp_echo() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0; 512];
            loop {
                let (len, peer) = sock.recv_from(&mut buf).await.unwrap();
                let mut stale = buf[..len].to_vec();
                stale[0] ^= 0xff;
                sock.send_to(&stale, peer).await.unwrap();
                sock.send_to(&buf[..len], peer).await.unwrap();
            }
        });
        addr
    }

    /// Starts a TCP server that echoes length-prefixed messages.
    async fn tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    while let Ok(len) = stream.read_u16().await {
                        let mut buf = vec![0; usize::from(len)];
                        stream.read_exact(&mut buf).await.unwrap();
                        stream.write_u16(len).await.unwrap();
                        stream.write_all(&buf).await.unwrap();
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn replies_in_server_order() {
        let udp = udp_echo().await;
        let tcp = tcp_echo().await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let servers = [
            ServerConfig::new("udp", udp, Transport::Udp),
            ServerConfig::new("tcp", tcp, Transport::Tcp),
            ServerConfig::new(
                "silent",
                silent.local_addr().unwrap(),
                Transport::Udp,
            ),
        ];
        let mut worker = Worker::new(
            &servers,
            &sendrecv_config(Duration::from_millis(300)),
        )
        .unwrap();
        for id in [7, 8] {
            let replies = worker.send_recv(&query(id), 0).await;
            assert_eq!(replies.len(), 3);
            assert_eq!(replies[0].wire(), Some(query(id).as_slice()));
            assert_eq!(replies[1].wire(), Some(query(id).as_slice()));
            assert_eq!(replies[2], Reply::Timeout);
        }
        let replies = worker.send_recv(&query(9), 1).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].wire(), Some(query(9).as_slice()));
    }

    #[tokio::test]
    async fn refused_stream_is_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let servers = [
            ServerConfig::new("tcp", addr, Transport::Tcp),
            ServerConfig::new("udp", udp_echo().await, Transport::Udp),
        ];
        let mut worker =
            Worker::new(&servers, &sendrecv_config(Duration::from_secs(2)))
                .unwrap();
        let replies = worker.send_recv(&query(1), 0).await;
        assert!(replies[0].is_timeout());
        assert!(!replies[1].is_timeout());
    }

    #[test]
    fn tracker_trips_on_consecutive_timeouts() {
        let tracker =
            TimeoutTracker::new(vec!["a".into(), "b".into()], 3, false);
        let answer = Reply::answer(1, vec![0, 0]);
        tracker.record(0, &[Reply::Timeout, answer.clone()]).unwrap();
        tracker.record(0, &[Reply::Timeout, answer.clone()]).unwrap();
        tracker.record(0, &[answer.clone(), answer.clone()]).unwrap();
        tracker.record(0, &[Reply::Timeout, Reply::Timeout]).unwrap();
        tracker.record(1, &[Reply::Timeout]).unwrap();
        let err = tracker.record(1, &[Reply::Timeout]).unwrap_err();
        assert_eq!(err.server, "b");
        assert_eq!(err.timeouts, 3);
    }

    #[test]
    fn tracker_can_be_ignored() {
        let tracker = TimeoutTracker::new(vec!["a".into()], 1, true);
        tracker.record(0, &[Reply::Timeout]).unwrap();
        tracker.record(0, &[Reply::Timeout]).unwrap();
    }
}
