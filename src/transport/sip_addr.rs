use crate::{
    transport::{default_port, is_secure},
    Error, Result,
};
use rsip::{host_with_port, HostWithPort};
use std::{fmt, hash::Hash, net::SocketAddr};

/// A host/port pair with an optional transport, as named by a URI or Via.
///
/// Unlike a [`SocketAddr`] the host may still be a domain name; use
/// [`SipAddr::resolve`] to turn it into something a socket can send to.
#[derive(Debug, Eq, PartialEq, Clone, Default)]
pub struct SipAddr {
    pub r#type: Option<rsip::transport::Transport>,
    pub addr: HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.r#type {
            Some(r#type) => write!(f, "{} {}", r#type, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl Hash for SipAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.r#type.hash(state);
        match self.addr.host {
            host_with_port::Host::Domain(ref domain) => domain.to_string().hash(state),
            host_with_port::Host::IpAddr(ref ip_addr) => ip_addr.hash(state),
        }
        if let Some(port) = &self.addr.port {
            port.value().hash(state);
        }
    }
}

impl SipAddr {
    pub fn new(transport: rsip::transport::Transport, addr: HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn host(&self) -> String {
        match &self.addr.host {
            host_with_port::Host::Domain(domain) => domain.to_string(),
            host_with_port::Host::IpAddr(ip) => ip.to_string(),
        }
    }

    /// Explicit port, else the default for the transport.
    pub fn port(&self) -> u16 {
        match &self.addr.port {
            Some(port) => *port.value(),
            None => default_port(&self.r#type.clone().unwrap_or_default()),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.r#type.as_ref().map(is_secure).unwrap_or(false)
    }

    /// Socket address for an IP literal host; domains need [`SipAddr::resolve`].
    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        match &self.addr.host {
            host_with_port::Host::Domain(domain) => Err(Error::Error(format!(
                "Cannot convert domain {} to SocketAddr",
                domain
            ))),
            host_with_port::Host::IpAddr(ip_addr) => Ok(SocketAddr::new(*ip_addr, self.port())),
        }
    }

    /// Resolves the host, taking the first address the resolver returns.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.get_socketaddr() {
            return Ok(addr);
        }
        let host = self.host();
        let resolved = tokio::net::lookup_host((host.as_str(), self.port()))
            .await?
            .next();
        resolved
            .ok_or_else(|| Error::TransportLayerError("host not resolved".to_string(), self.clone()))
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr {
            r#type: None,
            addr: HostWithPort {
                host: addr.ip().into(),
                port: Some(addr.port().into()),
            },
        }
    }
}

impl From<HostWithPort> for SipAddr {
    fn from(host_with_port: HostWithPort) -> Self {
        SipAddr {
            r#type: None,
            addr: host_with_port,
        }
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = Error;

    /// Transport from the `transport=` parameter; a `sips` scheme forces TLS.
    fn try_from(uri: &rsip::Uri) -> Result<Self> {
        let r#type = match uri.scheme {
            Some(rsip::Scheme::Sips) => Some(rsip::Transport::Tls),
            _ => uri.transport().cloned(),
        };
        Ok(SipAddr {
            r#type,
            addr: uri.host_with_port.clone(),
        })
    }
}
