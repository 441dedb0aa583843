use crate::{
    transport::{
        pool::DEFAULT_MAX_CONNECTIONS, ConnectionMode, SipAddr, SipTransport, StreamTransport,
        TransportSender, UdpTransport,
    },
    Error, Result,
};
use std::{collections::HashMap, future::Future, net::SocketAddr, pin::Pin};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(feature = "rustls")]
use crate::transport::TlsConfig;

/// What a transport is created with.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub local_addr: SocketAddr,
    pub max_connections: usize,
    pub connection_mode: ConnectionMode,
    pub force_sent_by: bool,
    #[cfg(feature = "rustls")]
    pub tls: Option<TlsConfig>,
}

impl TransportOptions {
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_mode: ConnectionMode::default(),
            force_sent_by: false,
            #[cfg(feature = "rustls")]
            tls: None,
        }
    }
}

pub type TransportFuture = Pin<Box<dyn Future<Output = Result<SipTransport>> + Send>>;
pub type TransportConstructor =
    fn(TransportOptions, TransportSender, CancellationToken) -> TransportFuture;

/// Transports by protocol name. The compiled-in set is `udp` and `tcp`, plus
/// `tls` with the `rustls` feature; more can be registered.
#[derive(Clone)]
pub struct TransportFactory {
    constructors: HashMap<String, TransportConstructor>,
}

fn create_udp(
    options: TransportOptions,
    sender: TransportSender,
    cancel_token: CancellationToken,
) -> TransportFuture {
    Box::pin(async move {
        let udp = UdpTransport::bind(options.local_addr, cancel_token).await?;
        udp.start(sender);
        Ok(SipTransport::Udp(udp))
    })
}

fn create_tcp(
    options: TransportOptions,
    sender: TransportSender,
    cancel_token: CancellationToken,
) -> TransportFuture {
    Box::pin(async move {
        let tcp = StreamTransport::tcp(&options, sender, cancel_token).await?;
        Ok(SipTransport::Stream(tcp))
    })
}

#[cfg(feature = "rustls")]
fn create_tls(
    options: TransportOptions,
    sender: TransportSender,
    cancel_token: CancellationToken,
) -> TransportFuture {
    Box::pin(async move {
        let tls = StreamTransport::tls(&options, sender, cancel_token).await?;
        Ok(SipTransport::Stream(tls))
    })
}

impl Default for TransportFactory {
    fn default() -> Self {
        let mut factory = Self {
            constructors: HashMap::new(),
        };
        factory.register("udp", create_udp);
        factory.register("tcp", create_tcp);
        #[cfg(feature = "rustls")]
        factory.register("tls", create_tls);
        factory
    }
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, constructor: TransportConstructor) {
        self.constructors
            .insert(name.to_ascii_lowercase(), constructor);
    }

    pub fn supports(&self, name: &str) -> bool {
        self.constructors.contains_key(&name.to_ascii_lowercase())
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn create(
        &self,
        name: &str,
        options: TransportOptions,
        sender: TransportSender,
        cancel_token: CancellationToken,
    ) -> Result<SipTransport> {
        let constructor = self.constructors.get(&name.to_ascii_lowercase()).ok_or_else(|| {
            Error::TransportLayerError(
                format!("unsupported transport: {}", name),
                SipAddr::from(options.local_addr),
            )
        })?;
        let transport = constructor(options, sender, cancel_token).await?;
        info!("created transport {}", transport);
        Ok(transport)
    }
}
