use crate::{
    transport::{TransportEvent, TransportReceiver},
    Error, Result,
};
use rsip::SipMessage;
use std::time::Duration;
use tokio::time::timeout;

mod test_udp;

pub(super) async fn wait_for_event(receiver: &mut TransportReceiver) -> Result<TransportEvent> {
    match timeout(Duration::from_secs(2), receiver.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(Error::Error("event channel closed".to_string())),
        Err(_) => Err(Error::Error("timed out waiting for event".to_string())),
    }
}

/// Skips connection lifecycle events.
pub(super) async fn wait_for_message(receiver: &mut TransportReceiver) -> Result<SipMessage> {
    loop {
        if let TransportEvent::Incoming(msg) = wait_for_event(receiver).await? {
            return Ok(msg.message);
        }
    }
}

pub(super) fn create_test_request(call_id: &str, via: &str) -> SipMessage {
    let raw = format!(
        "OPTIONS sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/{via};branch=z9hG4bK{call_id}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
    );
    SipMessage::try_from(raw.as_str()).expect("test request")
}
