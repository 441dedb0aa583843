//! RFC 3581 `received`/`rport` stamping of inbound requests.
use crate::{
    message::{self, Rport, ViaHeader},
    transport::default_port,
    Result,
};
use rsip::SipMessage;
use std::net::SocketAddr;

/// Stamps the observed source onto a Via entry.
///
/// `received` is added when the sent-by host is not the source IP. `rport`
/// is filled in when the sender asked for it; otherwise, with `force_rport`,
/// when the declared port is not the source port. Applying it again to an
/// already stamped entry changes nothing.
pub fn stamp_via(via: &mut ViaHeader, source: SocketAddr, force_rport: bool) -> bool {
    let mut changed = false;
    let source_ip = source.ip();

    if via.host_ip() != Some(source_ip) {
        let stamped = via
            .received()
            .and_then(|received| received.parse().ok())
            .map(|received: std::net::IpAddr| received == source_ip)
            .unwrap_or(false);
        if !stamped {
            via.set_received(source_ip);
            changed = true;
        }
    }

    match via.rport() {
        Rport::Requested => {
            via.set_rport(source.port());
            changed = true;
        }
        Rport::Stamped(_) => {}
        Rport::Absent if force_rport => {
            let declared = via.port().unwrap_or_else(|| default_port(&via.transport()));
            if declared != source.port() {
                via.set_rport(source.port());
                changed = true;
            }
        }
        Rport::Absent => {}
    }
    changed
}

/// Stamps the top Via of a request, rewriting the header at most once.
/// Responses are never touched.
pub fn stamp(msg: &mut SipMessage, source: SocketAddr, force_rport: bool) -> Result<bool> {
    if !matches!(msg, SipMessage::Request(_)) {
        return Ok(false);
    }
    let mut via = match message::top_via(msg) {
        Some(via) => via?,
        None => return Ok(false),
    };
    if !stamp_via(&mut via, source, force_rport) {
        return Ok(false);
    }
    Ok(message::replace_top_via(msg, via))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_received_once() -> Result<()> {
        let mut via = ViaHeader::parse("SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1")?;
        let source: SocketAddr = "203.0.113.9:5061".parse()?;

        assert!(stamp_via(&mut via, source, false));
        assert!(!stamp_via(&mut via, source, false));
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1;received=203.0.113.9"
        );
        Ok(())
    }

    #[test]
    fn test_explicit_rport_wins_over_force() -> Result<()> {
        let source: SocketAddr = "203.0.113.9:40000".parse()?;

        let mut requested = ViaHeader::parse("SIP/2.0/UDP 10.0.0.5:5060;rport;branch=z9hG4bK1")?;
        assert!(stamp_via(&mut requested, source, false));
        assert_eq!(requested.rport(), Rport::Stamped(40000));
        assert_eq!(
            requested.to_string(),
            "SIP/2.0/UDP 10.0.0.5:5060;rport=40000;branch=z9hG4bK1;received=203.0.113.9"
        );

        let mut plain = ViaHeader::parse("SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1")?;
        stamp_via(&mut plain, source, false);
        assert_eq!(plain.rport(), Rport::Absent);

        let mut forced = ViaHeader::parse("SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1")?;
        stamp_via(&mut forced, source, true);
        assert_eq!(forced.rport(), Rport::Stamped(40000));
        Ok(())
    }

    #[test]
    fn test_no_stamp_when_source_matches() -> Result<()> {
        let mut via = ViaHeader::parse("SIP/2.0/UDP 203.0.113.9:5061;branch=z9hG4bK1")?;
        assert!(!stamp_via(&mut via, "203.0.113.9:5061".parse()?, true));
        Ok(())
    }

    #[test]
    fn test_stamp_message_idempotent() -> Result<()> {
        let mut msg = SipMessage::try_from(
            "OPTIONS sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1\r\n\
             From: <sip:alice@example.com>;tag=a1\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: nat-1\r\n\
             CSeq: 1 OPTIONS\r\n\
             Content-Length: 0\r\n\r\n",
        )?;
        let source: SocketAddr = "203.0.113.9:5061".parse()?;
        assert!(stamp(&mut msg, source, false)?);
        assert!(!stamp(&mut msg, source, false)?);
        assert_eq!(msg.to_string().matches("received=203.0.113.9").count(), 1);
        Ok(())
    }
}
