//! Fake DNS servers and helpers for driving a complete run.

#![allow(dead_code)]

use domain::base::iana::Rcode;
use domain::base::{Message, MessageBuilder};
use domain::rdata::A;
use respdiff::config::{
    Config, FieldName, SendRecvConfig, ServerConfig, Transport,
};
use respdiff::qprep;
use respdiff::store::Store;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::ServerConfig as TlsConfig;
use tokio_rustls::TlsAcceptor;

//------------ Servers -------------------------------------------------------

/// Starts a UDP server answering with whatever `respond` returns.
///
/// If `respond` returns `None`, the query is not answered.
pub async fn udp_server<F>(respond: F) -> SocketAddr
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0; 65535];
        loop {
            let (len, peer) = match sock.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(_) => continue,
            };
            if let Some(answer) = respond(&buf[..len]) {
                let _ = sock.send_to(&answer, peer).await;
            }
        }
    });
    addr
}

/// Starts a server answering every query with the given rcode.
pub async fn answering(rcode: Rcode) -> SocketAddr {
    udp_server(move |query| answer(query, rcode)).await
}

/// Starts a server that never answers.
pub async fn silent() -> SocketAddr {
    udp_server(|_| None).await
}

/// Starts a DNS over TLS server answering every query with the given rcode.
///
/// The server uses the self-signed certificate in `tests/data`.
pub async fn tls_server(rcode: Rcode) -> SocketAddr {
    let acceptor = TlsAcceptor::from(Arc::new(tls_config()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (tcp, _) = match listener.accept().await {
                Ok(res) => res,
                Err(_) => continue,
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut stream) = acceptor.accept(tcp).await {
                    let _ = serve_stream(&mut stream, rcode).await;
                }
            });
        }
    });
    addr
}

fn tls_config() -> TlsConfig {
    let data = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data");
    let open =
        |name: &str| BufReader::new(File::open(data.join(name)).unwrap());
    let certs = rustls_pemfile::certs(&mut open("server.crt"))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut open("server.key"))
        .unwrap()
        .unwrap();
    TlsConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap()
}

/// Answers length-prefixed queries on a stream until it is closed.
async fn serve_stream<S>(stream: &mut S, rcode: Rcode) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let len = stream.read_u16().await?;
        let mut query = vec![0; usize::from(len)];
        stream.read_exact(&mut query).await?;
        if let Some(answer) = answer(&query, rcode) {
            let mut buf = Vec::with_capacity(answer.len() + 2);
            buf.extend_from_slice(&(answer.len() as u16).to_be_bytes());
            buf.extend_from_slice(&answer);
            stream.write_all(&buf).await?;
            stream.flush().await?;
        }
    }
}

/// Creates the answer to a query.
///
/// Successful answers carry a single A record.
pub fn answer(query: &[u8], rcode: Rcode) -> Option<Vec<u8>> {
    let msg = Message::from_octets(query).ok()?;
    let mut builder =
        MessageBuilder::new_vec().start_answer(&msg, rcode).ok()?;
    builder.header_mut().set_ra(true);
    if rcode == Rcode::NOERROR {
        let question = msg.first_question()?;
        builder
            .push((question.qname(), 300, A::from_octets(192, 0, 2, 1)))
            .ok()?;
    }
    Some(builder.finish())
}

//------------ Configuration -------------------------------------------------

/// The criteria used by all tests.
pub const CRITERIA: &[FieldName] = &[
    FieldName::Opcode,
    FieldName::Rcode,
    FieldName::Flags,
    FieldName::Question,
    FieldName::Answertypes,
];

/// Creates a configuration for servers on localhost.
///
/// The first server is the target.
pub fn config(
    servers: &[(&str, SocketAddr)],
    jobs: usize,
    max_timeouts: u32,
) -> Config {
    let servers = servers
        .iter()
        .map(|(name, addr)| ServerConfig::new(*name, *addr, Transport::Udp))
        .collect();
    config_with(servers, jobs, max_timeouts)
}

/// Creates a configuration for the given servers.
///
/// The server named `target` is the target.
pub fn config_with(
    servers: Vec<ServerConfig>,
    jobs: usize,
    max_timeouts: u32,
) -> Config {
    let mut sendrecv = SendRecvConfig::new();
    sendrecv.set_timeout(Duration::from_millis(200));
    sendrecv.set_jobs(jobs);
    sendrecv.set_max_timeouts(max_timeouts);
    let mut weights = vec![FieldName::Timeout, FieldName::Malformed];
    weights.extend_from_slice(CRITERIA);
    Config::new(sendrecv, servers, "target", CRITERIA.to_vec(), weights)
        .unwrap()
}

/// Fills a store with `count` queries.
pub fn fill_queries(store: &Store, count: usize) {
    let input: String = (0..count)
        .map(|i| format!("host{i}.example.com. A\n"))
        .collect();
    let outcome = qprep::run(store, input.as_bytes()).unwrap();
    assert_eq!(outcome.stored, count as u64);
}
