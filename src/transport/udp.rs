use crate::{
    identifier::ConnectionId,
    message::{parse_datagram, Datagram, IncomingMessage, KEEPALIVE_RESPONSE, MAX_SIP_MESSAGE_SIZE},
    transport::{SipAddr, TransportEvent, TransportSender},
    Error, Result,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    select,
    sync::{Mutex as AsyncMutex, Notify},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

pub const REBIND_BACKOFF: Duration = Duration::from_secs(1);
pub const REBIND_ATTEMPTS: usize = 3;

struct UdpTransportInner {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    down: AtomicBool,
    reset: Notify,
    /// Serializes sends that change the multicast TTL of the shared socket.
    ttl_lock: AsyncMutex<()>,
}

#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

impl UdpTransport {
    pub async fn bind(local: SocketAddr, cancel_token: CancellationToken) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let local_addr = socket.local_addr()?;
        let t = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket: Mutex::new(Some(Arc::new(socket))),
                local_addr,
                cancel_token,
                down: AtomicBool::new(false),
                reset: Notify::new(),
                ttl_lock: AsyncMutex::new(()),
            }),
        };
        info!("created UDP transport: {}", t);
        Ok(t)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Set once self-healing gave up; the transport stays down until it is
    /// recreated.
    pub fn is_down(&self) -> bool {
        self.inner.down.load(Ordering::Relaxed)
    }

    pub(crate) fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                Error::TransportLayerError(
                    "UDP socket not bound".to_string(),
                    SipAddr::new(rsip::Transport::Udp, self.local_addr().into()),
                )
            })
    }

    /// Spawns the receive loop under a supervisor that rebinds the socket
    /// when the loop fails.
    pub fn start(&self, sender: TransportSender) {
        let transport = self.clone();
        tokio::spawn(async move { transport.serve(sender).await });
    }

    async fn serve(&self, sender: TransportSender) {
        loop {
            let result = select! {
                _ = self.inner.cancel_token.cancelled() => break,
                r = self.serve_loop(sender.clone()) => r,
            };
            if sender.is_closed() {
                debug!("UDP transport {} has no receiver, stopping", self);
                break;
            }
            warn!("UDP receive loop on {} ended: {:?}", self, result.err());
            if !self.heal().await {
                break;
            }
        }
    }

    /// Fails the receive loop on purpose, for example after a network
    /// change. The supervisor then releases the socket and rebinds it.
    pub fn reset(&self) {
        self.inner.reset.notify_one();
    }

    /// Releases the failed socket, then rebinds after a fixed backoff, a
    /// bounded number of times. Returns false when the transport should stop.
    async fn heal(&self) -> bool {
        self.inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for attempt in 1..=REBIND_ATTEMPTS {
            select! {
                _ = self.inner.cancel_token.cancelled() => return false,
                _ = tokio::time::sleep(REBIND_BACKOFF) => {}
            }
            match self.rebind().await {
                Ok(()) => return true,
                Err(e) => warn!(attempt, "rebinding UDP transport {} failed: {}", self, e),
            }
        }
        error!("UDP transport {} is down", self);
        self.inner.down.store(true, Ordering::Relaxed);
        false
    }

    /// Replaces the socket with a fresh one bound to the same address.
    pub async fn rebind(&self) -> Result<()> {
        let old = self
            .inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(old);
        let socket = UdpSocket::bind(self.inner.local_addr).await?;
        *self
            .inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(socket));
        info!("rebound UDP transport: {}", self);
        Ok(())
    }

    /// Receives until the socket fails. Pings are answered here and never
    /// reach the provider, pongs and noise are dropped.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let socket = self.socket()?;
        let mut buf = vec![0u8; MAX_SIP_MESSAGE_SIZE];
        loop {
            let (len, addr) = select! {
                _ = self.inner.reset.notified() => {
                    return Err(Error::TransportLayerError(
                        "UDP socket reset".to_string(),
                        SipAddr::new(rsip::Transport::Udp, self.local_addr().into()),
                    ));
                }
                r = socket.recv_from(&mut buf) => r?,
            };
            match parse_datagram(&buf[..len]) {
                Datagram::Ping => {
                    trace!(%addr, "keepalive ping");
                    if let Err(e) = socket.send_to(KEEPALIVE_RESPONSE, addr).await {
                        warn!(%addr, "failed to answer keepalive: {}", e);
                    }
                }
                Datagram::Pong => trace!(%addr, "keepalive pong"),
                Datagram::Noise => trace!(%addr, len, "discarding noise"),
                Datagram::Message(msg) => {
                    debug!("received {} {} -> {}", len, addr, self);
                    let id = ConnectionId::new(rsip::Transport::Udp, addr);
                    sender.send(TransportEvent::Incoming(IncomingMessage::new(msg, id)))?;
                }
            }
        }
    }

    #[instrument(skip(self, msg), fields(addr = %self.local_addr()))]
    pub async fn send(
        &self,
        msg: &rsip::SipMessage,
        dest: SocketAddr,
        ttl: Option<u8>,
    ) -> Result<ConnectionId> {
        let buf = msg.to_string();
        trace!("sending {} -> {} {}", buf.len(), dest, buf);
        self.send_raw(buf.as_bytes(), dest, ttl).await
    }

    /// Sends one datagram. `ttl` scopes IPv4 multicast sends only; the
    /// socket's previous multicast TTL is restored afterwards.
    pub async fn send_raw(
        &self,
        data: &[u8],
        dest: SocketAddr,
        ttl: Option<u8>,
    ) -> Result<ConnectionId> {
        let socket = self.socket()?;
        let result = match ttl {
            Some(ttl) if dest.ip().is_multicast() && dest.is_ipv4() => {
                let _guard = self.inner.ttl_lock.lock().await;
                let previous = socket.multicast_ttl_v4()?;
                socket.set_multicast_ttl_v4(ttl as u32)?;
                let result = socket.send_to(data, dest).await;
                socket.set_multicast_ttl_v4(previous)?;
                result
            }
            Some(ttl) => {
                trace!(%dest, ttl, "ignoring ttl for a unicast destination");
                socket.send_to(data, dest).await
            }
            None => socket.send_to(data, dest).await,
        };
        result.map_err(|e| {
            Error::TransportLayerError(e.to_string(), SipAddr::new(rsip::Transport::Udp, dest.into()))
        })?;
        Ok(ConnectionId::new(rsip::Transport::Udp, dest))
    }

    pub fn halt(&self) {
        self.inner.cancel_token.cancel();
        self.inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Display for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UDP {}", self.inner.local_addr)
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
