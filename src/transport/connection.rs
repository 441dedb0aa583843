use super::{StreamTransport, UdpTransport};
use crate::{identifier::ConnectionId, message::IncomingMessage, Error, Result};
use rsip::SipMessage;
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Incoming(IncomingMessage),
    /// A stream connection was dialed or accepted.
    New(ConnectionId),
    /// A stream connection ended, with the error that ended it if any.
    Closed(ConnectionId, Option<String>),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

/// The closed set of transports a provider can own.
#[derive(Clone)]
pub enum SipTransport {
    Udp(UdpTransport),
    Stream(StreamTransport),
}

impl SipTransport {
    pub fn protocol(&self) -> rsip::Transport {
        match self {
            SipTransport::Udp(_) => rsip::Transport::Udp,
            SipTransport::Stream(transport) => transport.protocol(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self, SipTransport::Udp(_))
    }

    /// Bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            SipTransport::Udp(transport) => transport.local_addr(),
            SipTransport::Stream(transport) => transport.local_addr(),
        }
    }

    pub async fn send(
        &self,
        msg: &SipMessage,
        dest: SocketAddr,
        ttl: Option<u8>,
    ) -> Result<ConnectionId> {
        match self {
            SipTransport::Udp(transport) => transport.send(msg, dest, ttl).await,
            SipTransport::Stream(transport) => transport.send(msg, dest).await,
        }
    }

    pub async fn send_raw(
        &self,
        data: &[u8],
        dest: SocketAddr,
        ttl: Option<u8>,
    ) -> Result<ConnectionId> {
        match self {
            SipTransport::Udp(transport) => transport.send_raw(data, dest, ttl).await,
            SipTransport::Stream(transport) => transport.send_raw(data, dest).await,
        }
    }

    /// Sends on the connection named by `id` without dialing. For UDP the id
    /// only names the peer.
    pub async fn send_pinned(&self, id: &ConnectionId, msg: &SipMessage) -> Result<ConnectionId> {
        if id.transport != self.protocol() {
            return Err(Error::ConnectionError(
                format!("connection is not {}", self),
                id.clone(),
            ));
        }
        match self {
            SipTransport::Udp(transport) => transport.send(msg, id.remote, None).await,
            SipTransport::Stream(transport) => transport.send_pinned(id, msg).await,
        }
    }

    /// Pooled connection ids; always empty for UDP.
    pub fn connections(&self) -> Vec<ConnectionId> {
        match self {
            SipTransport::Udp(_) => Vec::new(),
            SipTransport::Stream(transport) => transport.pool().ids(),
        }
    }

    pub fn halt(&self) {
        match self {
            SipTransport::Udp(transport) => transport.halt(),
            SipTransport::Stream(transport) => transport.halt(),
        }
    }
}

impl fmt::Display for SipTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipTransport::Udp(t) => write!(f, "{}", t),
            SipTransport::Stream(t) => write!(f, "{}", t),
        }
    }
}

impl fmt::Debug for SipTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<UdpTransport> for SipTransport {
    fn from(transport: UdpTransport) -> Self {
        SipTransport::Udp(transport)
    }
}

impl From<StreamTransport> for SipTransport {
    fn from(transport: StreamTransport) -> Self {
        SipTransport::Stream(transport)
    }
}
