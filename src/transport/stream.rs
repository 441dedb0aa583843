use crate::{
    identifier::ConnectionId,
    message::{IncomingMessage, SipCodec, SipCodecType, KEEPALIVE_RESPONSE, MAX_SIP_MESSAGE_SIZE},
    transport::{TransportEvent, TransportSender},
    Error, Result,
};
use bytes::BytesMut;
use rsip::SipMessage;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::Mutex as AsyncMutex,
};
use tokio_util::{codec::Decoder, sync::CancellationToken};
use tracing::{debug, info, trace, warn};

/// One live TCP or TLS connection.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn id(&self) -> &ConnectionId;
    fn local_addr(&self) -> SocketAddr;
    /// Updated on every send and receive; the pool evicts the oldest.
    fn last_activity(&self) -> Instant;
    async fn send_message(&self, msg: SipMessage) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    /// Reads until the peer closes, an I/O error occurs or the connection is
    /// closed locally. Each framed message is reported as
    /// [`TransportEvent::Incoming`].
    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub type StreamConnectionRef = Arc<dyn StreamConnection>;

/// Shared state of a stream connection, generic over the split halves so TCP
/// and TLS run the same framing loop.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub id: ConnectionId,
    pub local_addr: SocketAddr,
    last_activity: Mutex<Instant>,
    cancel_token: CancellationToken,
    read_half: AsyncMutex<Option<R>>,
    write_half: AsyncMutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: ConnectionId,
        local_addr: SocketAddr,
        read_half: R,
        write_half: W,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            id,
            local_addr,
            last_activity: Mutex::new(Instant::now()),
            cancel_token,
            read_half: AsyncMutex::new(Some(read_half)),
            write_half: AsyncMutex::new(write_half),
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        let buf = msg.to_string();
        trace!(id = %self.id, "sending {} bytes\n{}", buf.len(), buf);
        self.send_raw(buf.as_bytes()).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::ConnectionError(
                "connection closed".to_string(),
                self.id.clone(),
            ));
        }
        let mut write_half = self.write_half.lock().await;
        write_half
            .write_all(data)
            .await
            .map_err(|e| Error::ConnectionError(e.to_string(), self.id.clone()))?;
        write_half
            .flush()
            .await
            .map_err(|e| Error::ConnectionError(e.to_string(), self.id.clone()))?;
        self.touch();
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!(id = %self.id, "serve loop already running");
                return Ok(());
            }
        };

        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_SIP_MESSAGE_SIZE);
        let mut read_buf = vec![0u8; MAX_SIP_MESSAGE_SIZE];

        loop {
            let n = select! {
                _ = self.cancel_token.cancelled() => {
                    debug!(id = %self.id, "connection cancelled");
                    return Ok(());
                }
                r = read_half.read(&mut read_buf) => r.map_err(|e| Error::ConnectionError(e.to_string(), self.id.clone()))?,
            };
            if n == 0 {
                info!(id = %self.id, "connection closed by peer");
                return Ok(());
            }
            self.touch();
            buffer.extend_from_slice(&read_buf[..n]);

            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(SipCodecType::Message(msg))) => {
                        debug!(id = %self.id, "received {}", msg);
                        let incoming = IncomingMessage::new(msg, self.id.clone());
                        sender.send(TransportEvent::Incoming(incoming))?;
                    }
                    Ok(Some(SipCodecType::KeepaliveRequest)) => {
                        self.send_raw(KEEPALIVE_RESPONSE).await?;
                    }
                    Ok(Some(SipCodecType::KeepaliveResponse)) => {}
                    Ok(Some(SipCodecType::Discarded(reason))) => {
                        debug!(id = %self.id, "discarding malformed frame: {}", reason);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // framing is lost once a message cannot be delimited
                        warn!(id = %self.id, "error decoding stream: {}", e);
                        return Err(Error::ConnectionError(e.to_string(), self.id.clone()));
                    }
                }
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.cancel_token.cancel();
        let mut write_half = self.write_half.lock().await;
        write_half
            .shutdown()
            .await
            .map_err(|e| Error::ConnectionError(e.to_string(), self.id.clone()))
    }
}
