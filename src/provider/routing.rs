//! Next-hop resolution for requests, Via preparation and response targets.
use crate::{
    identifier::generator::make_branch,
    message::{
        self,
        via::{branch_param, maddr_param, rport_request, ttl_param},
        Rport, ViaHeader,
    },
    transport::{default_port, SipAddr, DEFAULT_SIPS_PORT, DEFAULT_SIP_PORT},
    Error, Result,
};
use rsip::{prelude::ToTypedHeader, Header, HostWithPort, Param, SipMessage};
use std::net::IpAddr;

/// Routing inputs taken from the provider configuration.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub outbound_proxy: Option<SipAddr>,
    pub tel_gateway: Option<SipAddr>,
    pub default_transport: rsip::Transport,
    pub secure_transports: Vec<rsip::Transport>,
}

impl RoutingConfig {
    fn is_secure(&self, transport: &rsip::Transport) -> bool {
        self.secure_transports.contains(transport)
    }
}

/// Where a request goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    /// Always carries a transport and a port.
    pub target: SipAddr,
    pub maddr: Option<String>,
    pub ttl: Option<u8>,
}

impl NextHop {
    pub fn transport(&self) -> rsip::Transport {
        self.target.r#type.clone().unwrap_or_default()
    }
}

fn is_tel(uri: &rsip::Uri) -> bool {
    matches!(&uri.scheme, Some(rsip::Scheme::Other(scheme)) if scheme.eq_ignore_ascii_case("tel"))
}

/// Topmost Route entry that asks for loose routing, if the first one does.
fn loose_route(req: &rsip::Request) -> Result<Option<rsip::Uri>> {
    let route = req.headers.iter().find_map(|header| match header {
        Header::Route(route) => Some(route),
        _ => None,
    });
    let Some(route) = route else {
        return Ok(None);
    };
    let typed = route.typed()?;
    Ok(typed.uris().first().and_then(|entry| {
        let lr = entry
            .uri
            .params
            .iter()
            .chain(entry.params.iter())
            .any(|param| matches!(param, Param::Lr));
        lr.then(|| entry.uri.clone())
    }))
}

/// Resolves the next hop of a request: outbound proxy, else a loose-routing
/// top Route, else the request-URI. `tel` targets go to the tel gateway.
pub fn next_hop(req: &rsip::Request, config: &RoutingConfig) -> Result<NextHop> {
    if let Some(proxy) = &config.outbound_proxy {
        return Ok(complete(proxy.clone(), None, None, config));
    }

    let uri = loose_route(req)?.unwrap_or_else(|| req.uri.clone());

    if is_tel(&uri) {
        return match &config.tel_gateway {
            Some(gateway) => Ok(complete(gateway.clone(), None, None, config)),
            None => Err(Error::RoutingError(format!(
                "no tel gateway configured for {}",
                uri
            ))),
        };
    }

    let mut target = SipAddr::try_from(&uri)?;
    let mut maddr = None;
    let mut ttl = None;
    for param in &uri.params {
        match param {
            Param::Maddr(value) => maddr = Some(value.value().to_string()),
            Param::Ttl(value) => ttl = value.value().parse::<u8>().ok(),
            _ => {}
        }
    }
    match &maddr {
        Some(maddr) => {
            // multicast target: the literal address replaces the host
            let host: IpAddr = maddr
                .parse()
                .map_err(|_| Error::RoutingError(format!("invalid maddr: {}", maddr)))?;
            target.addr.host = host.into();
        }
        // ttl only scopes multicast sends
        None => ttl = None,
    }
    Ok(complete(target, maddr, ttl, config))
}

fn complete(
    mut target: SipAddr,
    maddr: Option<String>,
    ttl: Option<u8>,
    config: &RoutingConfig,
) -> NextHop {
    let transport = target
        .r#type
        .clone()
        .unwrap_or_else(|| config.default_transport.clone());
    if target.addr.port.is_none() {
        let port = if config.is_secure(&transport) {
            DEFAULT_SIPS_PORT
        } else {
            DEFAULT_SIP_PORT
        };
        target.addr.port = Some(port.into());
    }
    target.r#type = Some(transport);
    NextHop { target, maddr, ttl }
}

/// The top Via this side will send with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaTemplate {
    pub transport: rsip::Transport,
    pub host: String,
    pub port: u16,
    pub maddr: Option<String>,
    pub ttl: Option<u8>,
    /// Ask the next hop for `rport` on a synthesized Via.
    pub rport: bool,
}

impl ViaTemplate {
    fn build(&self, branch: String, rport: bool) -> ViaHeader {
        let mut via = ViaHeader::new(self.transport, &self.host, Some(self.port))
            .with_param(branch_param(branch));
        if let Some(maddr) = &self.maddr {
            via = via.with_param(maddr_param(maddr.clone()));
        }
        if let Some(ttl) = self.ttl {
            via = via.with_param(ttl_param(ttl));
        }
        if rport {
            via = via.with_param(rport_request());
        }
        via
    }

    fn matches(&self, via: &ViaHeader) -> bool {
        via.transport() == self.transport
            && via.host().to_string().eq_ignore_ascii_case(&self.host)
            && via.port() == Some(self.port)
            && via.maddr() == self.maddr.as_deref()
            && via.ttl() == self.ttl
    }
}

/// Synthesizes a top Via when the request has none; otherwise replaces the
/// top Via in place if it disagrees with what will actually be used, keeping
/// its branch and its rport request.
pub fn prepare_via(msg: &mut SipMessage, template: &ViaTemplate) -> Result<()> {
    match message::top_via(msg) {
        None => {
            message::push_front_via(msg, template.build(make_branch(), template.rport));
            Ok(())
        }
        Some(via) => {
            let via = via?;
            if template.matches(&via) {
                return Ok(());
            }
            let branch = via.branch().map(str::to_string).unwrap_or_else(make_branch);
            let rport = via.rport() != Rport::Absent;
            message::replace_top_via(msg, template.build(branch, rport));
            Ok(())
        }
    }
}

/// Where a response goes: the top Via's `received` (else its host) and its
/// `rport` (else its port, else the transport default).
pub fn response_destination(msg: &SipMessage) -> Result<SipAddr> {
    let via = message::top_via(msg)
        .ok_or_else(|| Error::RoutingError("response has no Via".to_string()))??;
    let host = match via.received() {
        Some(received) => rsip::Host::from(received),
        None => via.host().clone(),
    };
    let port = match via.rport() {
        Rport::Stamped(port) => port,
        _ => via.port().unwrap_or_else(|| default_port(&via.transport())),
    };
    Ok(SipAddr::new(
        via.transport(),
        HostWithPort {
            host,
            port: Some(port.into()),
        },
    ))
}
