//! Protocol transports.
//!
//! UDP is connectionless: one bound socket, one receive loop. TCP and TLS are
//! connection-oriented: a [`StreamTransport`] owns a listening socket, dials
//! on demand and keeps its connections in a [`ConnectionPool`]. Both report
//! to the provider through a [`TransportSender`].
pub mod connection;
pub mod factory;
pub mod listener;
pub mod pool;
pub mod sip_addr;
pub mod stream;
pub mod stream_transport;
pub mod tcp;
#[cfg(feature = "rustls")]
pub mod tls;
pub mod udp;

pub use connection::{SipTransport, TransportEvent, TransportReceiver, TransportSender};
pub use factory::{TransportFactory, TransportOptions};
pub use pool::{ConnectionMode, ConnectionPool};
pub use sip_addr::SipAddr;
pub use stream::{StreamConnection, StreamConnectionRef};
pub use stream_transport::StreamTransport;
#[cfg(feature = "rustls")]
pub use tls::TlsConfig;
pub use udp::UdpTransport;

#[cfg(test)]
mod tests;

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_SIPS_PORT: u16 = 5061;

pub fn is_secure(transport: &rsip::Transport) -> bool {
    matches!(transport, rsip::Transport::Tls | rsip::Transport::Wss)
}

/// Port used when a target names no port: secure transports sit one above
/// the plain SIP port.
pub fn default_port(transport: &rsip::Transport) -> u16 {
    if is_secure(transport) {
        DEFAULT_SIPS_PORT
    } else {
        DEFAULT_SIP_PORT
    }
}
