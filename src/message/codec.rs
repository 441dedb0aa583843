use super::{looks_like_sip, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE, MAX_SIP_MESSAGE_SIZE};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use rsip::SipMessage;
use tokio_util::codec::Decoder;

/// Frames SIP messages on a byte stream using Content-Length.
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum SipCodecType {
    Message(SipMessage),
    KeepaliveRequest,
    KeepaliveResponse,
    /// A complete frame that is not a SIP message. Framing is intact, so the
    /// stream stays usable.
    Discarded(String),
}

impl std::fmt::Display for SipCodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipCodecType::Message(msg) => write!(f, "{}", msg),
            SipCodecType::KeepaliveRequest => write!(f, "Keepalive Request"),
            SipCodecType::KeepaliveResponse => write!(f, "Keepalive Response"),
            SipCodecType::Discarded(reason) => write!(f, "Discarded frame: {}", reason),
        }
    }
}

fn content_length(headers: &str) -> Result<usize> {
    for line in headers.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse::<usize>()
                .map_err(|e| Error::SipMessageError(format!("invalid Content-Length: {}", e)));
        }
    }
    Ok(0)
}

impl Decoder for SipCodec {
    type Item = SipCodecType;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Ok(Some(SipCodecType::KeepaliveRequest));
        }

        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Ok(Some(SipCodecType::KeepaliveResponse));
        }

        if let Some(headers_end) = src.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = std::str::from_utf8(&src[..headers_end + 4])
                .map_err(|e| Error::SipMessageError(format!("invalid UTF-8 in headers: {}", e)))?;
            let total_len = headers_end + 4 + content_length(headers)?;

            if total_len > MAX_SIP_MESSAGE_SIZE {
                return Err(Error::SipMessageError("SIP message too large".to_string()));
            }
            if src.len() >= total_len {
                let msg_data = src.split_to(total_len);
                if !looks_like_sip(&msg_data) {
                    return Ok(Some(SipCodecType::Discarded(
                        "not a SIP message".to_string(),
                    )));
                }
                return Ok(Some(match SipMessage::try_from(&msg_data[..]) {
                    Ok(msg) => SipCodecType::Message(msg),
                    Err(e) => SipCodecType::Discarded(e.to_string()),
                }));
            }
        }

        if src.len() > MAX_SIP_MESSAGE_SIZE {
            return Err(Error::SipMessageError("SIP message too large".to_string()));
        }
        Ok(None)
    }
}
