//! Typed view over the topmost Via header value.
//!
//! NAT handling needs precise control over `received`, `rport`, `maddr` and
//! `ttl`, including the difference between a bare `;rport` request and a
//! stamped `;rport=5061`. [`ViaHeader`] wraps [`rsip::typed::Via`], edits its
//! parameters in place and leaves unknown ones in their original order.
use crate::{Error, Result};
use rsip::{
    param::{Branch, Maddr, OtherParam, OtherParamValue, Received, Ttl},
    prelude::{ToTypedHeader, UntypedHeader},
    Host, HostWithPort, Param,
};
use std::{fmt, net::IpAddr};

const RPORT: &str = "rport";

/// State of the RFC 3581 `rport` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rport {
    Absent,
    /// `;rport` without a value: the sender asks the receiver to stamp it.
    Requested,
    Stamped(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    typed: rsip::typed::Via,
}

impl ViaHeader {
    pub fn new(transport: rsip::Transport, host: &str, port: Option<u16>) -> Self {
        Self {
            typed: rsip::typed::Via {
                version: rsip::Version::V2,
                transport,
                uri: rsip::Uri::from(sent_by(host, port)),
                params: Vec::new(),
            },
        }
    }

    /// Parses the first Via entry of a header value. A value carrying several
    /// comma separated entries only contributes its first one.
    pub fn parse(value: &str) -> Result<Self> {
        let first = entries(value).next().unwrap_or_default();
        let typed = rsip::headers::Via::new(first).typed()?;
        Ok(Self { typed })
    }

    pub fn with_param(mut self, param: Param) -> Self {
        self.typed.params.push(param);
        self
    }

    pub fn transport(&self) -> rsip::Transport {
        self.typed.transport
    }

    pub fn host(&self) -> &Host {
        &self.typed.uri.host_with_port.host
    }

    pub fn port(&self) -> Option<u16> {
        self.typed
            .uri
            .host_with_port
            .port
            .as_ref()
            .map(|port| *port.value())
    }

    /// Sent-by host as an IP address, if it is one.
    pub fn host_ip(&self) -> Option<IpAddr> {
        match self.host() {
            Host::IpAddr(ip) => Some(*ip),
            Host::Domain(_) => None,
        }
    }

    pub fn sent_by(&self) -> String {
        self.typed.uri.host_with_port.to_string()
    }

    /// Replaces sent-protocol and sent-by, keeping every parameter.
    pub fn set_sent_by(&mut self, transport: rsip::Transport, host: &str, port: Option<u16>) {
        self.typed.transport = transport;
        self.typed.uri = rsip::Uri::from(sent_by(host, port));
    }

    pub fn branch(&self) -> Option<&str> {
        self.typed.branch().map(Branch::value)
    }

    pub fn received(&self) -> Option<&str> {
        self.typed.params.iter().find_map(|param| match param {
            Param::Received(received) => Some(received.value()),
            _ => None,
        })
    }

    pub fn maddr(&self) -> Option<&str> {
        self.typed.params.iter().find_map(|param| match param {
            Param::Maddr(maddr) => Some(maddr.value()),
            _ => None,
        })
    }

    pub fn ttl(&self) -> Option<u8> {
        self.typed.params.iter().find_map(|param| match param {
            Param::Ttl(ttl) => ttl.value().parse().ok(),
            _ => None,
        })
    }

    pub fn rport(&self) -> Rport {
        self.typed
            .params
            .iter()
            .find_map(|param| match param {
                Param::Other(key, value) if key.value().eq_ignore_ascii_case(RPORT) => {
                    Some(match value.as_ref().map(|v| v.value().parse()) {
                        Some(Ok(port)) => Rport::Stamped(port),
                        _ => Rport::Requested,
                    })
                }
                _ => None,
            })
            .unwrap_or(Rport::Absent)
    }

    pub fn set_received(&mut self, ip: IpAddr) {
        self.set_param(
            |param| matches!(param, Param::Received(_)),
            Param::Received(Received::new(ip.to_string())),
        );
    }

    pub fn set_rport(&mut self, port: u16) {
        self.set_param(is_rport, stamped_rport(port));
    }

    /// Replaces the first matching parameter in place and drops any
    /// duplicates, so the header never carries the name twice.
    fn set_param(&mut self, matches: impl Fn(&Param) -> bool, param: Param) {
        let mut replaced = false;
        self.typed.params.retain_mut(|existing| {
            if !matches(existing) {
                return true;
            }
            if replaced {
                return false;
            }
            *existing = param.clone();
            replaced = true;
            true
        });
        if !replaced {
            self.typed.params.push(param);
        }
    }

    pub fn into_header(self) -> rsip::Header {
        self.typed.into()
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.typed)
    }
}

impl TryFrom<&rsip::headers::Via> for ViaHeader {
    type Error = Error;

    fn try_from(via: &rsip::headers::Via) -> Result<Self> {
        ViaHeader::parse(via.value())
    }
}

/// Via entries folded into one header value. Entry grammar has no commas,
/// so a plain split is exact.
pub(crate) fn entries(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}

pub fn branch_param(branch: impl Into<String>) -> Param {
    Param::Branch(Branch::new(branch.into()))
}

pub fn maddr_param(maddr: impl Into<String>) -> Param {
    Param::Maddr(Maddr::new(maddr.into()))
}

pub fn ttl_param(ttl: u8) -> Param {
    Param::Ttl(Ttl::new(ttl.to_string()))
}

/// Bare `;rport`, asking the next hop to stamp the source port.
pub fn rport_request() -> Param {
    Param::Other(OtherParam::new(RPORT), None)
}

fn stamped_rport(port: u16) -> Param {
    Param::Other(
        OtherParam::new(RPORT),
        Some(OtherParamValue::new(port.to_string())),
    )
}

fn is_rport(param: &Param) -> bool {
    matches!(param, Param::Other(key, _) if key.value().eq_ignore_ascii_case(RPORT))
}

fn sent_by(host: &str, port: Option<u16>) -> HostWithPort {
    HostWithPort {
        host: Host::from(host),
        port: port.map(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_via() -> Result<()> {
        let via = ViaHeader::parse("SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK776asdhds;rport")?;
        assert_eq!(via.transport(), rsip::Transport::Udp);
        assert_eq!(via.host_ip(), Some("10.0.0.5".parse()?));
        assert_eq!(via.port(), Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(via.rport(), Rport::Requested);
        assert_eq!(via.received(), None);
        Ok(())
    }

    #[test]
    fn test_parse_first_of_folded_entries() -> Result<()> {
        let via = ViaHeader::parse(
            "SIP/2.0/TCP client.example.com;branch=z9hG4bKabc;rport=5070, SIP/2.0/UDP 10.0.0.1",
        )?;
        assert_eq!(via.transport(), rsip::Transport::Tcp);
        assert_eq!(via.sent_by(), "client.example.com");
        assert_eq!(via.host_ip(), None);
        assert_eq!(via.port(), None);
        assert_eq!(via.rport(), Rport::Stamped(5070));
        Ok(())
    }

    #[test]
    fn test_maddr_and_ttl() -> Result<()> {
        let via = ViaHeader::parse("SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bK1;maddr=239.0.0.1;ttl=16")?;
        assert_eq!(via.maddr(), Some("239.0.0.1"));
        assert_eq!(via.ttl(), Some(16));
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bK1;maddr=239.0.0.1;ttl=16"
        );
        Ok(())
    }

    #[test]
    fn test_built_via() {
        let via = ViaHeader::new(rsip::Transport::Tls, "192.0.2.1", Some(5061))
            .with_param(branch_param("z9hG4bKbuilt"))
            .with_param(rport_request());
        assert_eq!(via.to_string(), "SIP/2.0/TLS 192.0.2.1:5061;branch=z9hG4bKbuilt;rport");
        assert_eq!(via.rport(), Rport::Requested);
    }

    #[test]
    fn test_set_param_never_duplicates() -> Result<()> {
        let mut via = ViaHeader::parse(
            "SIP/2.0/UDP 10.0.0.5:5060;received=1.1.1.1;branch=z9hG4bK1;received=2.2.2.2",
        )?;
        via.set_received("203.0.113.9".parse()?);
        via.set_received("203.0.113.9".parse()?);
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP 10.0.0.5:5060;received=203.0.113.9;branch=z9hG4bK1"
        );
        Ok(())
    }

    #[test]
    fn test_from_header() -> Result<()> {
        let header = rsip::headers::Via::new("SIP/2.0/UDP 10.0.0.5;branch=z9hG4bKa, SIP/2.0/TCP 10.0.0.6");
        let via = ViaHeader::try_from(&header)?;
        assert_eq!(via.branch(), Some("z9hG4bKa"));
        assert_eq!(via.transport(), rsip::Transport::Udp);
        assert!(matches!(via.into_header(), rsip::Header::Via(_)));
        Ok(())
    }

    #[test]
    fn test_invalid_via() {
        assert!(ViaHeader::parse("garbage").is_err());
        assert!(ViaHeader::parse("SIP/2.0/UDP").is_err());
        assert!(ViaHeader::parse("SIP/2.0/UDP host:notaport").is_err());
    }
}
