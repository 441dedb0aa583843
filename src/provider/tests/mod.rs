use crate::{
    identifier::ConnectionId,
    message::IncomingMessage,
    provider::{ExceptionListener, SipListener},
    Error, Result,
};
use rsip::SipMessage;
use std::sync::{Arc, Mutex};


/// Shared log of which listener saw what, in order.
#[derive(Default, Clone)]
pub(super) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().expect("journal").push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal").clone()
    }
}

pub(super) enum Behavior {
    Accept,
    Fail,
    Panic,
}

pub(super) struct RecordingListener {
    pub name: &'static str,
    pub journal: Journal,
    pub behavior: Behavior,
}

impl RecordingListener {
    pub fn new(name: &'static str, journal: &Journal) -> Arc<Self> {
        Self::with_behavior(name, journal, Behavior::Accept)
    }

    pub fn with_behavior(name: &'static str, journal: &Journal, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name,
            journal: journal.clone(),
            behavior,
        })
    }
}

impl SipListener for RecordingListener {
    fn on_message(&self, _msg: &IncomingMessage) -> Result<()> {
        self.journal.push(self.name.to_string());
        match self.behavior {
            Behavior::Accept => Ok(()),
            Behavior::Fail => Err(Error::Error(format!("{} refused", self.name))),
            Behavior::Panic => panic!("{} exploded", self.name),
        }
    }

    fn on_connection_closed(&self, id: &ConnectionId, _error: Option<&str>) {
        self.journal.push(format!("{} closed {}", self.name, id));
    }
}

impl ExceptionListener for RecordingListener {
    fn on_exception(&self, error: &Error, msg: Option<&IncomingMessage>) {
        self.journal.push(format!(
            "{}: {} (message: {})",
            self.name,
            error,
            msg.is_some()
        ));
    }
}

pub(super) fn parse(raw: &str) -> SipMessage {
    SipMessage::try_from(raw).expect("test message")
}

pub(super) fn invite() -> SipMessage {
    parse(
        "INVITE sip:bob@192.0.2.20 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKinv1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=alice1\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: call-1@192.0.2.10\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
    )
}

pub(super) fn ringing() -> SipMessage {
    parse(
        "SIP/2.0 180 Ringing\r\n\
         Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKinv1\r\n\
         From: <sip:alice@example.com>;tag=alice1\r\n\
         To: <sip:bob@example.com>;tag=bob1\r\n\
         Call-ID: call-1@192.0.2.10\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
    )
}

pub(super) fn incoming(message: SipMessage) -> IncomingMessage {
    let source = "192.0.2.20:5060".parse().expect("source");
    IncomingMessage::new(message, ConnectionId::new(rsip::Transport::Udp, source))
}
