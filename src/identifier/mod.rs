//! Value-type keys used for connection pooling and listener dispatch.
use crate::{Error, Result};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Method, SipMessage,
};
use std::{fmt, hash::Hash, net::SocketAddr};

pub mod generator;
mod transaction;

pub use transaction::{TransactionId, TransactionKey, TransactionRole};

/// Pool key: at most one live connection per `ConnectionId` in a pool. For
/// UDP it names the remote peer of a datagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub transport: rsip::Transport,
    pub remote: SocketAddr,
}

impl ConnectionId {
    pub fn new(transport: rsip::Transport, remote: SocketAddr) -> Self {
        Self { transport, remote }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.transport,
            self.remote.ip(),
            self.remote.port()
        )
    }
}

/// Call-ID plus the local and remote tags. Which header carries the local tag
/// depends on whether this side sent or received the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Dialog of a received message: for a request the local tag is in To,
    /// for a response it is in From.
    pub fn incoming(msg: &SipMessage) -> Result<Self> {
        let (call_id, from_tag, to_tag) = dialog_parts(msg)?;
        match msg {
            SipMessage::Request(_) => Ok(Self::new(call_id, to_tag, from_tag)),
            SipMessage::Response(_) => Ok(Self::new(call_id, from_tag, to_tag)),
        }
    }

    /// Dialog of a message this side is sending.
    pub fn outgoing(msg: &SipMessage) -> Result<Self> {
        let (call_id, from_tag, to_tag) = dialog_parts(msg)?;
        match msg {
            SipMessage::Request(_) => Ok(Self::new(call_id, from_tag, to_tag)),
            SipMessage::Response(_) => Ok(Self::new(call_id, to_tag, from_tag)),
        }
    }
}

fn dialog_parts(msg: &SipMessage) -> Result<(String, String, String)> {
    let missing = |which: &str| Error::SipMessageError(format!("{} tag missing", which));
    let (call_id, from_tag, to_tag) = match msg {
        SipMessage::Request(req) => (
            req.call_id_header()?.value().to_string(),
            req.from_header()?.tag()?,
            req.to_header()?.tag()?,
        ),
        SipMessage::Response(resp) => (
            resp.call_id_header()?.value().to_string(),
            resp.from_header()?.tag()?,
            resp.to_header()?.tag()?,
        ),
    };
    Ok((
        call_id,
        from_tag.ok_or_else(|| missing("From"))?.value().to_string(),
        to_tag.ok_or_else(|| missing("To"))?.value().to_string(),
    ))
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// "Any message of method X", or the wildcard matching every method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodId {
    Method(Method),
    Any,
}

impl Hash for MethodId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            MethodId::Method(method) => method.to_string().hash(state),
            MethodId::Any => "*".hash(state),
        }
    }
}

impl MethodId {
    /// Method of a request, or the CSeq method of a response.
    pub fn from_message(msg: &SipMessage) -> Result<Self> {
        match msg {
            SipMessage::Request(req) => Ok(MethodId::Method(req.method().clone())),
            SipMessage::Response(resp) => Ok(MethodId::Method(resp.cseq_header()?.method()?)),
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodId::Method(method) => write!(f, "{}", method),
            MethodId::Any => write!(f, "*"),
        }
    }
}

/// Key a selective listener is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    Transaction(TransactionId),
    Dialog(DialogId),
    Method(MethodId),
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKey::Transaction(id) => write!(f, "transaction {}", id),
            ListenerKey::Dialog(id) => write!(f, "dialog {}", id),
            ListenerKey::Method(id) => write!(f, "method {}", id),
        }
    }
}

impl From<TransactionId> for ListenerKey {
    fn from(id: TransactionId) -> Self {
        ListenerKey::Transaction(id)
    }
}

impl From<DialogId> for ListenerKey {
    fn from(id: DialogId) -> Self {
        ListenerKey::Dialog(id)
    }
}

impl From<MethodId> for ListenerKey {
    fn from(id: MethodId) -> Self {
        ListenerKey::Method(id)
    }
}
