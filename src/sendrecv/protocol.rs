//! Underlying transport protocols.

use core::future::Future;
use core::pin::Pin;
use std::boxed::Box;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::vec::Vec;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// How many times do we try a new random port if we get ‘address in use.’
const RETRY_RANDOM_PORT: usize = 10;

/// The largest DNS message we expect over UDP.
const MAX_DGRAM_LEN: usize = 65535;

//------------ AsyncConnect --------------------------------------------------

/// Establish a connection asynchronously.
pub trait AsyncConnect {
    /// The type of an established connection.
    type Connection;

    /// The future establishing the connection.
    type Fut: Future<Output = Result<Self::Connection, io::Error>> + Send;

    /// Returns a future that establishing a connection.
    fn connect(&self) -> Self::Fut;
}

//------------ TcpConnect --------------------------------------------------

/// Create new TCP connections.
#[derive(Clone, Copy, Debug)]
pub struct TcpConnect {
    /// Remote address to connect to.
    addr: SocketAddr,
}

impl TcpConnect {
    /// Create new TCP connections.
    ///
    /// addr is the destination address to connect to.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl AsyncConnect for TcpConnect {
    type Connection = TcpStream;
    type Fut = Pin<
        Box<dyn Future<Output = Result<Self::Connection, io::Error>> + Send>,
    >;

    fn connect(&self) -> Self::Fut {
        let addr = self.addr;
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

//------------ TlsConnect -----------------------------------------------------

/// Create new TLS connections
#[derive(Clone, Debug)]
pub struct TlsConnect {
    /// Configuration for setting up a TLS connection.
    client_config: Arc<ClientConfig>,

    /// Server name for certificate verification.
    server_name: ServerName<'static>,

    /// Remote address to connect to.
    addr: SocketAddr,
}

impl TlsConnect {
    /// Creates TLS connections to `addr`.
    ///
    /// If `server_name` is given, the server certificate is verified
    /// against the web PKI roots for that name. Otherwise, any certificate
    /// is accepted, which is what test setups with self-signed
    /// certificates need.
    pub fn new(
        addr: SocketAddr,
        server_name: Option<&str>,
    ) -> Result<Self, io::Error> {
        let provider = Arc::new(ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(io::Error::other)?;
        let (client_config, server_name) = match server_name {
            Some(name) => {
                let roots = RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                };
                let name =
                    ServerName::try_from(name.to_owned()).map_err(|err| {
                        io::Error::new(io::ErrorKind::InvalidInput, err)
                    })?;
                (
                    builder
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                    name,
                )
            }
            None => (
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier(
                        provider,
                    )))
                    .with_no_client_auth(),
                ServerName::from(addr.ip()),
            ),
        };
        Ok(Self {
            client_config: Arc::new(client_config),
            server_name,
            addr,
        })
    }
}

impl AsyncConnect for TlsConnect {
    type Connection = TlsStream<TcpStream>;
    type Fut = Pin<
        Box<dyn Future<Output = Result<Self::Connection, io::Error>> + Send>,
    >;

    fn connect(&self) -> Self::Fut {
        let tls_connection = TlsConnector::from(self.client_config.clone());
        let server_name = self.server_name.clone();
        let tcp = TcpConnect::new(self.addr).connect();
        Box::pin(async move {
            let tcp = tcp.await?;
            tls_connection.connect(server_name, tcp).await
        })
    }
}

//------------ NoVerifier -----------------------------------------------------

/// A certificate verifier that accepts every certificate.
///
/// Handshake signatures are still checked so that the connection is at
/// least consistent with the presented certificate.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

//------------ UdpConnect --------------------------------------------------

/// Create new UDP 'connections'.
#[derive(Clone, Copy, Debug)]
pub struct UdpConnect {
    /// Remote address to connect to.
    addr: SocketAddr,
}

impl UdpConnect {
    /// Create new UDP connections.
    ///
    /// addr is the destination address to connect to.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl AsyncConnect for UdpConnect {
    type Connection = UdpDgram;
    type Fut = Pin<
        Box<dyn Future<Output = Result<Self::Connection, io::Error>> + Send>,
    >;

    fn connect(&self) -> Self::Fut {
        Box::pin(UdpDgram::new(self.addr))
    }
}

//------------ UdpDgram -------------------------------------------------------

/// A single UDP 'connection'
#[derive(Debug)]
pub struct UdpDgram {
    /// Underlying UDP socket
    sock: UdpSocket,
}

impl UdpDgram {
    /// Create a new UdpDgram object.
    async fn new(addr: SocketAddr) -> Result<Self, io::Error> {
        let sock = Self::udp_bind(addr.is_ipv4()).await?;
        sock.connect(addr).await?;
        Ok(Self { sock })
    }

    /// Bind to a local UDP port.
    async fn udp_bind(v4: bool) -> Result<UdpSocket, io::Error> {
        let mut i = 0;
        loop {
            let local: SocketAddr = if v4 {
                ([0u8; 4], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            match UdpSocket::bind(&local).await {
                Ok(sock) => return Ok(sock),
                Err(err) => {
                    if i == RETRY_RANDOM_PORT {
                        return Err(err);
                    } else {
                        i += 1
                    }
                }
            }
        }
    }

    /// Sends a datagram to the server.
    pub async fn send(&self, buf: &[u8]) -> Result<usize, io::Error> {
        self.sock.send(buf).await
    }

    /// Receives the next datagram from the server.
    pub async fn recv(&self) -> Result<Vec<u8>, io::Error> {
        let mut buf = vec![0; MAX_DGRAM_LEN];
        let len = self.sock.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }
}
