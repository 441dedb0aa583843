use crate::{
    identifier::ConnectionId,
    transport::{
        stream::{StreamConnection, StreamConnectionInner},
        TransportSender,
    },
    Result,
};
use rsip::SipMessage;
use std::{fmt, net::SocketAddr, sync::Arc, time::Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

type TcpInner =
    StreamConnectionInner<tokio::io::ReadHalf<TcpStream>, tokio::io::WriteHalf<TcpStream>>;

#[derive(Clone)]
pub struct TcpConnection {
    pub inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(remote: SocketAddr, cancel_token: CancellationToken) -> Result<Self> {
        let stream = TcpStream::connect(remote).await?;
        let connection = Self::from_parts(stream, remote, cancel_token)?;
        info!("created TCP client connection: {}", connection);
        Ok(connection)
    }

    pub fn from_stream(stream: TcpStream, cancel_token: CancellationToken) -> Result<Self> {
        let remote = stream.peer_addr()?;
        let connection = Self::from_parts(stream, remote, cancel_token)?;
        info!("created TCP server connection: {}", connection);
        Ok(connection)
    }

    fn from_parts(
        stream: TcpStream,
        remote: SocketAddr,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                ConnectionId::new(rsip::Transport::Tcp, remote),
                local_addr,
                read_half,
                write_half,
                cancel_token,
            )),
        })
    }
}

#[async_trait::async_trait]
impl StreamConnection for TcpConnection {
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

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCP {} -> {}", self.inner.local_addr, self.inner.id.remote)
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
