// SIP transport and message dispatch layer

pub mod error;
pub mod identifier;
pub mod keepalive;
pub mod message;
pub mod provider;
pub mod transport;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use keepalive::{KeepAlive, KeepAliveHandle};
pub use provider::{
    ChannelListener, ExceptionListener, Provider, ProviderBuilder, ProviderConfig, SipListener,
};
