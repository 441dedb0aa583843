use crate::{
    identifier::ConnectionId,
    message,
    transport::{
        listener::StreamListener, tcp::TcpConnection, ConnectionPool,
        ConnectionMode, StreamConnectionRef, TransportEvent, TransportOptions, TransportSender,
    },
    Error, Result,
};
use rsip::SipMessage;
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "rustls")]
use crate::transport::tls::{TlsConnection, TlsContext};

enum StreamKind {
    Tcp,
    #[cfg(feature = "rustls")]
    Tls(TlsContext),
}

enum Payload<'a> {
    Message(&'a SipMessage),
    Raw(&'a [u8]),
}

struct StreamTransportInner {
    kind: StreamKind,
    local_addr: SocketAddr,
    pool: ConnectionPool,
    sender: TransportSender,
    cancel_token: CancellationToken,
    force_sent_by: AtomicBool,
}

/// Connection-oriented transport: accepts on a listening socket, dials on
/// demand and owns the pool of live connections.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamTransportInner>,
}

impl StreamTransport {
    pub async fn tcp(
        options: &TransportOptions,
        sender: TransportSender,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        Self::listen(StreamKind::Tcp, options, sender, cancel_token).await
    }

    #[cfg(feature = "rustls")]
    pub async fn tls(
        options: &TransportOptions,
        sender: TransportSender,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let context = TlsContext::new(&options.tls.clone().unwrap_or_default())?;
        Self::listen(StreamKind::Tls(context), options, sender, cancel_token).await
    }

    async fn listen(
        kind: StreamKind,
        options: &TransportOptions,
        sender: TransportSender,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(options.local_addr).await?;
        let transport = StreamTransport {
            inner: Arc::new(StreamTransportInner {
                kind,
                local_addr: listener.local_addr()?,
                pool: ConnectionPool::new(options.max_connections, options.connection_mode),
                sender,
                cancel_token: cancel_token.clone(),
                force_sent_by: AtomicBool::new(options.force_sent_by),
            }),
        };
        info!("created stream transport: {}", transport);
        StreamListener::new(listener, transport.clone()).spawn(cancel_token);
        Ok(transport)
    }

    pub fn protocol(&self) -> rsip::Transport {
        match self.inner.kind {
            StreamKind::Tcp => rsip::Transport::Tcp,
            #[cfg(feature = "rustls")]
            StreamKind::Tls(_) => rsip::Transport::Tls,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn force_sent_by(&self) -> bool {
        self.inner.force_sent_by.load(Ordering::Relaxed)
    }

    pub fn set_force_sent_by(&self, enabled: bool) {
        self.inner.force_sent_by.store(enabled, Ordering::Relaxed);
    }

    pub fn set_max_connections(&self, max_connections: usize) {
        for evicted in self.inner.pool.set_max_connections(max_connections) {
            close_in_background(evicted);
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.inner.cancel_token.is_cancelled() {
            return Err(Error::Halted(format!("{} is halted", self)));
        }
        Ok(())
    }

    /// Wraps an accepted socket, running the TLS handshake when needed.
    pub(super) async fn accept_stream(&self, stream: TcpStream) -> Result<StreamConnectionRef> {
        self.check_running()?;
        let cancel_token = self.inner.cancel_token.child_token();
        match &self.inner.kind {
            StreamKind::Tcp => Ok(Arc::new(TcpConnection::from_stream(stream, cancel_token)?)),
            #[cfg(feature = "rustls")]
            StreamKind::Tls(context) => {
                let acceptor = context.acceptor.as_ref().ok_or_else(|| {
                    Error::TlsError("no server certificate configured".to_string())
                })?;
                Ok(Arc::new(
                    TlsConnection::accept(stream, acceptor, cancel_token).await?,
                ))
            }
        }
    }

    /// Opens a new outbound connection and registers it.
    pub async fn dial(&self, remote: SocketAddr) -> Result<StreamConnectionRef> {
        self.check_running()?;
        let cancel_token = self.inner.cancel_token.child_token();
        let connection: StreamConnectionRef = match &self.inner.kind {
            StreamKind::Tcp => Arc::new(TcpConnection::connect(remote, cancel_token).await?),
            #[cfg(feature = "rustls")]
            StreamKind::Tls(context) => Arc::new(
                TlsConnection::connect(
                    remote,
                    &remote.ip().to_string(),
                    &context.connector,
                    cancel_token,
                )
                .await?,
            ),
        };
        self.register(connection.clone());
        Ok(connection)
    }

    /// Pools a connection and spawns its receive loop. A connection it
    /// displaces is closed.
    pub fn register(&self, connection: StreamConnectionRef) {
        for displaced in self.inner.pool.insert(connection.clone()) {
            close_in_background(displaced);
        }
        let transport = self.clone();
        tokio::spawn(async move { transport.serve_connection(connection).await });
    }

    async fn serve_connection(&self, connection: StreamConnectionRef) {
        let id = connection.id().clone();
        if self.inner.sender.send(TransportEvent::New(id.clone())).is_err() {
            warn!(%id, "no receiver for new connection event");
        }
        let reason = match connection.serve_loop(self.inner.sender.clone()).await {
            Ok(()) => None,
            Err(e) => {
                warn!(%id, "connection failed: {}", e);
                Some(e.to_string())
            }
        };
        self.inner.pool.remove_if_same(&connection);
        connection.close().await.ok();
        info!(%id, "connection closed");
        self.inner
            .sender
            .send(TransportEvent::Closed(id, reason))
            .ok();
    }

    #[instrument(skip(self, msg), fields(transport = %self))]
    pub async fn send(&self, msg: &SipMessage, dest: SocketAddr) -> Result<ConnectionId> {
        self.send_payload(Payload::Message(msg), dest).await
    }

    pub async fn send_raw(&self, data: &[u8], dest: SocketAddr) -> Result<ConnectionId> {
        self.send_payload(Payload::Raw(data), dest).await
    }

    /// Sends on an existing pooled connection; never dials.
    pub async fn send_pinned(&self, id: &ConnectionId, msg: &SipMessage) -> Result<ConnectionId> {
        self.check_running()?;
        let connection = self
            .inner
            .pool
            .get(id)
            .ok_or_else(|| Error::ConnectionError("connection is gone".to_string(), id.clone()))?;
        if let Err(e) = self.deliver(&connection, &Payload::Message(msg)).await {
            self.drop_connection(&connection).await;
            return Err(e);
        }
        Ok(id.clone())
    }

    async fn send_payload(&self, payload: Payload<'_>, dest: SocketAddr) -> Result<ConnectionId> {
        self.check_running()?;
        let id = ConnectionId::new(self.protocol(), dest);

        if let Some(connection) = self.inner.pool.get(&id) {
            match self.deliver(&connection, &payload).await {
                Ok(()) => return Ok(id),
                Err(e) => {
                    warn!(%id, "send on pooled connection failed, retrying: {}", e);
                    self.drop_connection(&connection).await;
                }
            }
        }

        if self.inner.pool.mode() == ConnectionMode::Manual {
            return Err(Error::ConnectionError(
                "no pooled connection and dialing is disabled".to_string(),
                id,
            ));
        }

        debug!(%id, "dialing");
        let connection = self.dial(dest).await?;
        if let Err(e) = self.deliver(&connection, &payload).await {
            self.drop_connection(&connection).await;
            return Err(e);
        }
        Ok(id)
    }

    async fn deliver(&self, connection: &StreamConnectionRef, payload: &Payload<'_>) -> Result<()> {
        match payload {
            Payload::Raw(data) => connection.send_raw(data).await,
            Payload::Message(msg) if self.force_sent_by() => {
                let msg = self.rewrite_sent_by((*msg).clone(), connection.local_addr());
                connection.send_message(msg).await
            }
            Payload::Message(msg) => connection.send_message((*msg).clone()).await,
        }
    }

    async fn drop_connection(&self, connection: &StreamConnectionRef) {
        self.inner.pool.remove_if_same(connection);
        connection.close().await.ok();
    }

    /// Points the top Via of a request at the connection's real local
    /// address. Responses carry the requester's Via and are left alone.
    fn rewrite_sent_by(&self, mut msg: SipMessage, local: SocketAddr) -> SipMessage {
        if !matches!(msg, SipMessage::Request(_)) {
            return msg;
        }
        match message::top_via(&msg) {
            Some(Ok(mut via)) => {
                via.set_sent_by(self.protocol(), &local.ip().to_string(), Some(local.port()));
                message::replace_top_via(&mut msg, via);
            }
            Some(Err(e)) => warn!("cannot rewrite unparsable Via: {}", e),
            None => {}
        }
        msg
    }

    pub fn halt(&self) {
        self.inner.cancel_token.cancel();
        // cancelled receive loops close their own connections
        let drained = self.inner.pool.drain();
        info!("halted {}, dropped {} connections", self, drained.len());
    }
}

fn close_in_background(connection: StreamConnectionRef) {
    tokio::spawn(async move {
        if let Err(e) = connection.close().await {
            debug!(id = %connection.id(), "error closing connection: {}", e);
        }
    });
}

impl fmt::Display for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.protocol(),
            self.inner.local_addr
        )
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
