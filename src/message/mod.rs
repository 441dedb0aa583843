//! Message framing and the structured message types handed across the
//! transport boundary.
//!
//! Byte-level SIP parsing is delegated to [`rsip`]; this module decides what
//! is worth parsing at all (keep-alive pings, noise), frames stream
//! connections, and gives access to the header list in the places where
//! order matters (the topmost Via).
use crate::{identifier::ConnectionId, Result};
use rsip::{prelude::UntypedHeader, Header, SipMessage};
use std::{net::SocketAddr, time::Instant};
use tracing::debug;

pub mod codec;
pub mod via;

pub use codec::{SipCodec, SipCodecType};
pub use via::{Rport, ViaHeader};

/// RFC 5626 double-CRLF keep-alive ping.
pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
/// RFC 5626 single-CRLF keep-alive pong.
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";
/// Datagrams at or below this size are discarded as noise.
pub const MIN_MESSAGE_LEN: usize = 16;
pub const MAX_SIP_MESSAGE_SIZE: usize = 65535;

const PROTOCOL_TOKEN: &[u8] = b"SIP/2.0";

/// What a received datagram turned out to be.
#[derive(Debug, Clone)]
pub enum Datagram {
    Ping,
    Pong,
    Message(SipMessage),
    Noise,
}

/// Classifies one datagram: keep-alive ping, keep-alive pong, a parsed SIP
/// message, or noise that must be dropped without reaching any listener.
pub fn parse_datagram(buf: &[u8]) -> Datagram {
    match buf {
        KEEPALIVE_REQUEST => return Datagram::Ping,
        KEEPALIVE_RESPONSE => return Datagram::Pong,
        _ => {}
    }
    if !looks_like_sip(buf) {
        return Datagram::Noise;
    }
    match SipMessage::try_from(buf) {
        Ok(msg) => Datagram::Message(msg),
        Err(e) => {
            debug!(len = buf.len(), "discarding unparsable datagram: {}", e);
            Datagram::Noise
        }
    }
}

/// Cheap pre-parse filter: longer than [`MIN_MESSAGE_LEN`] and the first line
/// carries the `SIP/2.0` protocol token.
pub fn looks_like_sip(buf: &[u8]) -> bool {
    if buf.len() <= MIN_MESSAGE_LEN {
        return false;
    }
    let first_line = match buf.iter().position(|&b| b == b'\n') {
        Some(end) => &buf[..end],
        None => buf,
    };
    first_line
        .windows(PROTOCOL_TOKEN.len())
        .any(|w| w.eq_ignore_ascii_case(PROTOCOL_TOKEN))
}

/// A message is dispatchable when it carries the headers every transaction
/// and dialog key is derived from.
pub fn is_well_formed(msg: &SipMessage) -> bool {
    let (mut via, mut cseq, mut call_id, mut from, mut to) = (false, false, false, false, false);
    for header in headers(msg).iter() {
        match header {
            Header::Via(_) => via = true,
            Header::CSeq(_) => cseq = true,
            Header::CallId(_) => call_id = true,
            Header::From(_) => from = true,
            Header::To(_) => to = true,
            _ => {}
        }
    }
    via && cseq && call_id && from && to
}

pub fn headers(msg: &SipMessage) -> &rsip::Headers {
    match msg {
        SipMessage::Request(req) => &req.headers,
        SipMessage::Response(resp) => &resp.headers,
    }
}

pub fn headers_mut(msg: &mut SipMessage) -> &mut rsip::Headers {
    match msg {
        SipMessage::Request(req) => &mut req.headers,
        SipMessage::Response(resp) => &mut resp.headers,
    }
}

/// Parsed topmost Via entry, or `None` when the message has no Via.
pub fn top_via(msg: &SipMessage) -> Option<Result<ViaHeader>> {
    top_via_in(headers(msg))
}

pub fn top_via_in(headers: &rsip::Headers) -> Option<Result<ViaHeader>> {
    headers.iter().find_map(|header| match header {
        Header::Via(via) => Some(ViaHeader::try_from(via)),
        _ => None,
    })
}

/// Replaces the topmost Via entry in place. Further entries folded into the
/// same header line are kept behind it.
pub fn replace_top_via(msg: &mut SipMessage, via: ViaHeader) -> bool {
    let headers = headers_mut(msg);
    let mut list: Vec<Header> = std::mem::take(headers).into_iter().collect();
    let mut replaced = false;
    if let Some(slot) = list.iter_mut().find(|h| matches!(h, Header::Via(_))) {
        let mut value = vec![via.to_string()];
        if let Header::Via(old) = slot {
            value.extend(via::entries(old.value()).skip(1).map(str::to_string));
        }
        *slot = Header::Via(rsip::headers::Via::new(value.join(", ")));
        replaced = true;
    }
    *headers = list.into();
    replaced
}

/// Inserts a Via in front of every other header.
pub fn push_front_via(msg: &mut SipMessage, via: ViaHeader) {
    let headers = headers_mut(msg);
    let mut list: Vec<Header> = std::mem::take(headers).into_iter().collect();
    list.insert(0, via.into_header());
    *headers = list.into();
}

pub fn via_count(msg: &SipMessage) -> usize {
    headers(msg)
        .iter()
        .filter_map(|header| match header {
            Header::Via(via) => Some(via.value()),
            _ => None,
        })
        .map(|value| via::entries(value).count())
        .sum()
}

/// A message on its way out. `connection_id` pins the send to one pooled
/// connection; routing falls back to normal resolution if it is gone.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message: SipMessage,
    pub connection_id: Option<ConnectionId>,
}

impl OutgoingMessage {
    pub fn new(message: SipMessage) -> Self {
        Self {
            message,
            connection_id: None,
        }
    }

    pub fn pinned(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }
}

impl From<SipMessage> for OutgoingMessage {
    fn from(message: SipMessage) -> Self {
        OutgoingMessage::new(message)
    }
}

impl From<rsip::Request> for OutgoingMessage {
    fn from(req: rsip::Request) -> Self {
        OutgoingMessage::new(req.into())
    }
}

impl From<rsip::Response> for OutgoingMessage {
    fn from(resp: rsip::Response) -> Self {
        OutgoingMessage::new(resp.into())
    }
}

/// A message as received, with the metadata the transport observed.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub transport: rsip::Transport,
    /// The connection it arrived on; for UDP this names the sender.
    pub connection_id: ConnectionId,
    pub received_at: Instant,
}

impl IncomingMessage {
    pub fn new(message: SipMessage, connection_id: ConnectionId) -> Self {
        Self {
            message,
            source: connection_id.remote,
            transport: connection_id.transport.clone(),
            connection_id,
            received_at: Instant::now(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.message, SipMessage::Request(_))
    }
}
