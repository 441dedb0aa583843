//! Branch, tag and Call-ID generation.
use crate::{message, Error, Result};
use md5::{Digest, Md5};
use rand::Rng;
use rsip::prelude::{HeadersExt, UntypedHeader};

/// RFC 3261 magic cookie every compliant branch starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

const BRANCH_LEN: usize = 16;
const TAG_LEN: usize = 10;
const CALL_ID_LEN: usize = 22;

pub fn random_text(count: usize) -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, random_text(BRANCH_LEN))
}

pub fn make_tag() -> String {
    random_text(TAG_LEN)
}

pub fn make_call_id(via_host: &str) -> String {
    format!("{}@{}", random_text(CALL_ID_LEN), via_host)
}

/// Branch derived from the request itself, so a stateless element produces
/// the same value when a request is retransmitted.
pub fn make_stateless_branch(req: &rsip::Request, local_via: &str) -> Result<String> {
    let via = message::top_via_in(&req.headers)
        .ok_or_else(|| Error::SipMessageError("missing Via header".to_string()))??;
    let via_part = match via.branch() {
        Some(branch) if branch.starts_with(BRANCH_MAGIC_COOKIE) => branch.to_string(),
        _ => via.sent_by(),
    };
    let from_tag = req
        .from_header()?
        .tag()?
        .map(|tag| tag.value().to_string())
        .unwrap_or_default();

    let mut hasher = Md5::new();
    hasher.update(req.uri.to_string());
    hasher.update(local_via);
    hasher.update(via_part);
    hasher.update(from_tag);
    hasher.update(req.call_id_header()?.value());
    hasher.update(req.cseq_header()?.seq()?.to_string());
    Ok(format!("{}{:x}", BRANCH_MAGIC_COOKIE, hasher.finalize()))
}

/// To-tag for a stateless response: the same request always yields the same
/// tag.
pub fn make_stateless_tag(req: &rsip::Request) -> Result<String> {
    let via = message::top_via_in(&req.headers)
        .ok_or_else(|| Error::SipMessageError("missing Via header".to_string()))??;
    let from_tag = req
        .from_header()?
        .tag()?
        .map(|tag| tag.value().to_string())
        .unwrap_or_default();

    let mut hasher = Md5::new();
    hasher.update(req.call_id_header()?.value());
    hasher.update(from_tag);
    hasher.update(req.cseq_header()?.value());
    hasher.update(via.branch().unwrap_or_default());
    hasher.update(via.sent_by());
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..16].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const OPTIONS: &str = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKopt1\r\n\
        From: <sip:alice@example.com>;tag=a1\r\n\
        To: <sip:bob@example.com>\r\n\
        Call-ID: opt-1@10.0.0.5\r\n\
        CSeq: 1 OPTIONS\r\n\
        Content-Length: 0\r\n\r\n";

    fn options() -> Result<rsip::Request> {
        match rsip::SipMessage::try_from(OPTIONS)? {
            rsip::SipMessage::Request(req) => Ok(req),
            _ => Err(Error::Error("expected request".to_string())),
        }
    }

    #[test]
    fn test_branch_uniqueness() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let branch = make_branch();
            assert!(branch.starts_with(BRANCH_MAGIC_COOKIE));
            assert!(seen.insert(branch));
        }
    }

    #[test]
    fn test_call_id_and_tag() {
        let call_id = make_call_id("10.0.0.5");
        assert!(call_id.ends_with("@10.0.0.5"));
        assert_ne!(make_tag(), make_tag());
    }

    #[test]
    fn test_stateless_identifiers_are_deterministic() -> Result<()> {
        let req = options()?;
        let branch = make_stateless_branch(&req, "10.0.0.1:5060")?;
        assert!(branch.starts_with(BRANCH_MAGIC_COOKIE));
        assert_eq!(branch, make_stateless_branch(&options()?, "10.0.0.1:5060")?);
        assert_ne!(branch, make_stateless_branch(&req, "10.0.0.2:5060")?);

        let tag = make_stateless_tag(&req)?;
        assert_eq!(tag, make_stateless_tag(&options()?)?);

        let other = rsip::SipMessage::try_from(OPTIONS.replace("1 OPTIONS", "2 OPTIONS").as_str())?;
        match other {
            rsip::SipMessage::Request(other) => assert_ne!(tag, make_stateless_tag(&other)?),
            _ => unreachable!(),
        }
        Ok(())
    }
}
