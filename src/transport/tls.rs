use crate::{
    identifier::ConnectionId,
    transport::{
        stream::{StreamConnection, StreamConnectionInner},
        TransportSender,
    },
    Error, Result,
};
use rsip::SipMessage;
use std::{fmt, net::SocketAddr, sync::Arc, time::Instant};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{
        client::danger::ServerCertVerifier,
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
        ClientConfig, RootCertStore, ServerConfig,
    },
    TlsAcceptor, TlsConnector, TlsStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// TLS material, all PEM encoded.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Server certificate chain; required to accept connections.
    pub cert: Option<Vec<u8>>,
    /// Server private key.
    pub key: Option<Vec<u8>>,
    /// Roots trusted when dialing out.
    pub ca_certs: Option<Vec<u8>>,
    /// Replaces root-store verification of server certificates.
    pub verifier: Option<Arc<dyn ServerCertVerifier>>,
}

/// Acceptor and connector built once from a [`TlsConfig`].
#[derive(Clone)]
pub struct TlsContext {
    pub acceptor: Option<TlsAcceptor>,
    pub connector: TlsConnector,
}

impl TlsContext {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let acceptor = match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => Some(create_acceptor(cert, key)?),
            _ => None,
        };
        Ok(Self {
            acceptor,
            connector: create_connector(config)?,
        })
    }
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, std::io::Error>>()
        .map_err(|e| Error::TlsError(format!("failed to parse certificate: {}", e)))
}

fn create_acceptor(cert: &[u8], key: &[u8]) -> Result<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let mut reader = std::io::BufReader::new(key);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::TlsError(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::TlsError("no valid private key found".to_string()))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::TlsError(format!("TLS configuration error: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn create_connector(config: &TlsConfig) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    if let Some(ca_certs) = &config.ca_certs {
        for cert in load_certs(ca_certs)? {
            root_store
                .add(cert)
                .map_err(|e| Error::TlsError(format!("invalid CA certificate: {}", e)))?;
        }
    }
    let mut client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if let Some(verifier) = &config.verifier {
        client_config
            .dangerous()
            .set_certificate_verifier(verifier.clone());
    }
    Ok(TlsConnector::from(Arc::new(client_config)))
}

type TlsInner = StreamConnectionInner<
    tokio::io::ReadHalf<TlsStream<TcpStream>>,
    tokio::io::WriteHalf<TlsStream<TcpStream>>,
>;

#[derive(Clone)]
pub struct TlsConnection {
    pub inner: Arc<TlsInner>,
}

impl TlsConnection {
    /// Dials `remote` and completes the handshake, verifying the peer as
    /// `server_name`.
    pub async fn connect(
        remote: SocketAddr,
        server_name: &str,
        connector: &TlsConnector,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsError(format!("invalid DNS name: {}", server_name)))?;
        let stream = TcpStream::connect(remote).await?;
        let local_addr = stream.local_addr()?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::TlsError(format!("TLS handshake with {} failed: {}", remote, e)))?;

        let connection = Self::from_parts(tls_stream.into(), local_addr, remote, cancel_token);
        info!("created TLS client connection: {}", connection);
        Ok(connection)
    }

    pub async fn accept(
        stream: TcpStream,
        acceptor: &TlsAcceptor,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let remote = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::TlsError(format!("TLS handshake with {} failed: {}", remote, e)))?;
        debug!(%remote, "TLS handshake completed");

        let connection = Self::from_parts(tls_stream.into(), local_addr, remote, cancel_token);
        info!("created TLS server connection: {}", connection);
        Ok(connection)
    }

    fn from_parts(
        stream: TlsStream<TcpStream>,
        local_addr: SocketAddr,
        remote: SocketAddr,
        cancel_token: CancellationToken,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        TlsConnection {
            inner: Arc::new(StreamConnectionInner::new(
                ConnectionId::new(rsip::Transport::Tls, remote),
                local_addr,
                read_half,
                write_half,
                cancel_token,
            )),
        }
    }
}

#[async_trait::async_trait]
impl StreamConnection for TlsConnection {
    fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    fn last_activity(&self) -> Instant {
        self.inner.last_activity()
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner.serve_loop(sender).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS {} -> {}", self.inner.local_addr, self.inner.id.remote)
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
