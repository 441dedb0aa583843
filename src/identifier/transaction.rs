use crate::{identifier::generator::BRANCH_MAGIC_COOKIE, message, Error, Result};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Method, SipMessage,
};
use std::hash::Hash;

/// Which side of the transaction this key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    /// Inbound requests, and the responses sent back for them.
    Server,
    /// Outbound requests, and the responses received for them.
    Client,
}

/// Matching key of RFC 3261 §17.1.3 / §17.2.3. Server keys carry the Via
/// sent-by because branches are only unique per sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKey {
    RFC3261 {
        branch: String,
        method: Method,
        sent_by: Option<String>,
    },
    /// Pre-3261 peers without a magic-cookie branch.
    RFC2543 {
        call_id: String,
        cseq: u32,
        from_tag: String,
        method: Method,
        sent_by: Option<String>,
    },
}

impl Hash for TransactionKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            TransactionKey::RFC3261 {
                branch,
                method,
                sent_by,
            } => {
                branch.hash(state);
                method.to_string().hash(state);
                sent_by.hash(state);
            }
            TransactionKey::RFC2543 {
                call_id,
                cseq,
                from_tag,
                method,
                sent_by,
            } => {
                call_id.hash(state);
                cseq.hash(state);
                from_tag.hash(state);
                method.to_string().hash(state);
                sent_by.hash(state);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId {
    pub role: TransactionRole,
    pub key: TransactionKey,
}

impl TransactionId {
    /// Server transaction id: of an inbound request, or of a response this
    /// side sends for one.
    pub fn server(msg: &SipMessage) -> Result<Self> {
        Self::build(TransactionRole::Server, msg)
    }

    /// Client transaction id: of an outbound request, or of a response this
    /// side receives for one. The sent-by is left out because the transport
    /// may rewrite it on the way out.
    pub fn client(msg: &SipMessage) -> Result<Self> {
        Self::build(TransactionRole::Client, msg)
    }

    /// The id a received message is dispatched under: server ids for
    /// requests, client ids for responses.
    pub fn incoming(msg: &SipMessage) -> Result<Self> {
        match msg {
            SipMessage::Request(_) => Self::server(msg),
            SipMessage::Response(_) => Self::client(msg),
        }
    }

    fn build(role: TransactionRole, msg: &SipMessage) -> Result<Self> {
        let via = message::top_via(msg)
            .ok_or_else(|| Error::SipMessageError("missing Via header".to_string()))??;
        let method = match msg {
            // ACK for a non-2xx final response belongs to the INVITE transaction
            SipMessage::Request(req) if req.method() == &Method::Ack => Method::Invite,
            SipMessage::Request(req) => req.method().clone(),
            SipMessage::Response(resp) => resp.cseq_header()?.method()?,
        };
        let sent_by = match role {
            TransactionRole::Server => Some(via.sent_by()),
            TransactionRole::Client => None,
        };

        let key = match via.branch() {
            Some(branch) if branch.starts_with(BRANCH_MAGIC_COOKIE) => TransactionKey::RFC3261 {
                branch: branch.to_string(),
                method,
                sent_by,
            },
            _ => rfc2543_key(msg, method, sent_by)?,
        };
        Ok(Self { role, key })
    }
}

fn rfc2543_key(
    msg: &SipMessage,
    method: Method,
    sent_by: Option<String>,
) -> Result<TransactionKey> {
    let (call_id, cseq, from_tag) = match msg {
        SipMessage::Request(req) => (
            req.call_id_header()?.value().to_string(),
            req.cseq_header()?.seq()?,
            req.from_header()?.tag()?,
        ),
        SipMessage::Response(resp) => (
            resp.call_id_header()?.value().to_string(),
            resp.cseq_header()?.seq()?,
            resp.from_header()?.tag()?,
        ),
    };
    let from_tag = from_tag
        .map(|tag| tag.value().to_string())
        .unwrap_or_default();
    Ok(TransactionKey::RFC2543 {
        call_id,
        cseq,
        from_tag,
        method,
        sent_by,
    })
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self.role {
            TransactionRole::Server => "server",
            TransactionRole::Client => "client",
        };
        match &self.key {
            TransactionKey::RFC3261 {
                branch,
                method,
                sent_by,
            } => write!(
                f,
                "{} {} {}[{}]",
                role,
                method,
                branch,
                sent_by.as_deref().unwrap_or("*")
            ),
            TransactionKey::RFC2543 {
                call_id,
                cseq,
                from_tag,
                method,
                sent_by,
            } => write!(
                f,
                "{} {} {}/{} {}[{}]",
                role,
                call_id,
                method,
                cseq,
                from_tag,
                sent_by.as_deref().unwrap_or("*")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn register_request(method: Method, cseq: &str) -> rsip::Request {
        request_with_via(
            method,
            cseq,
            "SIP/2.0/TLS client.biloxi.example.com:5061;branch=z9hG4bKnashd92",
        )
    }

    fn request_with_via(method: Method, cseq: &str, via: &str) -> rsip::Request {
        rsip::Request {
            method,
            uri: rsip::Uri {
                scheme: Some(rsip::Scheme::Sips),
                host_with_port: rsip::Domain::from("example.com").into(),
                ..Default::default()
            },
            headers: vec![
                Via::new(via).into(),
                CSeq::new(cseq).into(),
                From::new("Bob <sips:bob@biloxi.example.com>;tag=ja743ks76zlflH").into(),
                To::new("Bob <sips:bob@biloxi.example.com>").into(),
                CallId::new("1j9FpLxk3uxtm8tn@biloxi.example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        }
    }

    #[test]
    fn test_server_and_client_ids() -> Result<()> {
        let req: SipMessage = register_request(Method::Register, "2 REGISTER").into();
        let server = TransactionId::server(&req)?;
        assert_eq!(
            server.key,
            TransactionKey::RFC3261 {
                branch: "z9hG4bKnashd92".to_string(),
                method: Method::Register,
                sent_by: Some("client.biloxi.example.com:5061".to_string()),
            }
        );

        let resp: SipMessage = rsip::Response {
            status_code: rsip::StatusCode::OK,
            version: rsip::Version::V2,
            headers: register_request(Method::Register, "2 REGISTER").headers,
            body: Default::default(),
        }
        .into();
        // the client id of the outbound request matches its inbound response
        assert_eq!(TransactionId::client(&req)?, TransactionId::incoming(&resp)?);
        assert_eq!(TransactionId::server(&resp)?, server);
        assert_ne!(TransactionId::client(&req)?, server);
        Ok(())
    }

    #[test]
    fn test_ack_and_cancel() -> Result<()> {
        let invite: SipMessage = register_request(Method::Invite, "1 INVITE").into();
        let ack: SipMessage = register_request(Method::Ack, "1 ACK").into();
        let cancel: SipMessage = register_request(Method::Cancel, "1 CANCEL").into();

        let invite_id = TransactionId::server(&invite)?;
        assert_eq!(TransactionId::server(&ack)?, invite_id);
        assert_ne!(TransactionId::server(&cancel)?, invite_id);
        Ok(())
    }

    #[test]
    fn test_rfc2543_fallback() -> Result<()> {
        let req: SipMessage =
            request_with_via(Method::Options, "7 OPTIONS", "SIP/2.0/UDP 10.0.0.5:5060;branch=1234")
                .into();
        let id = TransactionId::server(&req)?;
        assert_eq!(
            id.key,
            TransactionKey::RFC2543 {
                call_id: "1j9FpLxk3uxtm8tn@biloxi.example.com".to_string(),
                cseq: 7,
                from_tag: "ja743ks76zlflH".to_string(),
                method: Method::Options,
                sent_by: Some("10.0.0.5:5060".to_string()),
            }
        );
        Ok(())
    }
}
