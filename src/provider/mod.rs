//! The provider: owns the transports, routes outbound messages, stamps and
//! dispatches inbound ones.
use crate::{
    identifier::{
        generator::{make_branch, make_call_id, make_tag},
        ConnectionId, ListenerKey,
    },
    message::{self, Datagram, IncomingMessage, OutgoingMessage},
    transport::{
        pool::DEFAULT_MAX_CONNECTIONS, ConnectionMode, SipAddr, SipTransport, TransportEvent,
        TransportFactory, TransportOptions, TransportReceiver,
    },
    Error, Result,
};
use rsip::SipMessage;
use routing::{next_hop, prepare_via, response_destination, RoutingConfig, ViaTemplate};
use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "rustls")]
use crate::transport::TlsConfig;

pub mod nat;
pub mod registry;
pub mod routing;
#[cfg(test)]
mod tests;

pub use registry::{
    ChannelListener, ExceptionListener, ExceptionListenerRef, ListenerRegistry, SipListener,
    SipListenerRef,
};

/// Settings shared by routing, NAT handling and the stream pools.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Sent-by host of synthesized Vias; the transport's bound IP if unset.
    pub via_host: Option<String>,
    /// Sent-by port of synthesized Vias; the transport's bound port if unset.
    pub via_port: Option<u16>,
    pub default_transport: rsip::Transport,
    pub outbound_proxy: Option<SipAddr>,
    pub tel_gateway: Option<SipAddr>,
    /// Ask for `rport` on synthesized Vias.
    pub rport: bool,
    /// Stamp `rport` on inbound requests even when the sender did not ask.
    pub force_rport: bool,
    pub max_connections: usize,
    pub connection_mode: ConnectionMode,
    pub force_sent_by: bool,
    pub secure_transports: Vec<rsip::Transport>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            via_host: None,
            via_port: None,
            default_transport: rsip::Transport::Udp,
            outbound_proxy: None,
            tel_gateway: None,
            rport: false,
            force_rport: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_mode: ConnectionMode::Automatic,
            force_sent_by: false,
            secure_transports: vec![rsip::Transport::Tls, rsip::Transport::Wss],
        }
    }
}

impl ProviderConfig {
    fn routing(&self) -> RoutingConfig {
        RoutingConfig {
            outbound_proxy: self.outbound_proxy.clone(),
            tel_gateway: self.tel_gateway.clone(),
            default_transport: self.default_transport.clone(),
            secure_transports: self.secure_transports.clone(),
        }
    }
}

struct PendingTransport {
    name: String,
    addr: SocketAddr,
    #[cfg(feature = "rustls")]
    tls: Option<TlsConfig>,
}

pub struct ProviderBuilder {
    config: ProviderConfig,
    transports: Vec<PendingTransport>,
    factory: TransportFactory,
    cancel_token: Option<CancellationToken>,
}

impl Default for ProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderBuilder {
    pub fn new() -> Self {
        ProviderBuilder {
            config: ProviderConfig::default(),
            transports: Vec::new(),
            factory: TransportFactory::default(),
            cancel_token: None,
        }
    }

    pub fn with_config(&mut self, config: ProviderConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn with_via_addr(&mut self, host: &str, port: Option<u16>) -> &mut Self {
        self.config.via_host = Some(host.to_string());
        self.config.via_port = port;
        self
    }

    pub fn with_udp(&mut self, addr: SocketAddr) -> &mut Self {
        self.with_transport("udp", addr)
    }

    pub fn with_tcp(&mut self, addr: SocketAddr) -> &mut Self {
        self.with_transport("tcp", addr)
    }

    #[cfg(feature = "rustls")]
    pub fn with_tls(&mut self, addr: SocketAddr, tls: TlsConfig) -> &mut Self {
        self.transports.push(PendingTransport {
            name: "tls".to_string(),
            addr,
            tls: Some(tls),
        });
        self
    }

    /// Any protocol the factory knows by name.
    pub fn with_transport(&mut self, name: &str, addr: SocketAddr) -> &mut Self {
        self.transports.push(PendingTransport {
            name: name.to_string(),
            addr,
            #[cfg(feature = "rustls")]
            tls: None,
        });
        self
    }

    pub fn with_factory(&mut self, factory: TransportFactory) -> &mut Self {
        self.factory = factory;
        self
    }

    pub fn with_default_transport(&mut self, transport: rsip::Transport) -> &mut Self {
        self.config.default_transport = transport;
        self
    }

    pub fn with_outbound_proxy(&mut self, proxy: Option<SipAddr>) -> &mut Self {
        self.config.outbound_proxy = proxy;
        self
    }

    pub fn with_tel_gateway(&mut self, gateway: Option<SipAddr>) -> &mut Self {
        self.config.tel_gateway = gateway;
        self
    }

    pub fn with_rport(&mut self, rport: bool) -> &mut Self {
        self.config.rport = rport;
        self
    }

    pub fn with_force_rport(&mut self, force_rport: bool) -> &mut Self {
        self.config.force_rport = force_rport;
        self
    }

    pub fn with_max_connections(&mut self, max_connections: usize) -> &mut Self {
        self.config.max_connections = max_connections.max(1);
        self
    }

    pub fn with_connection_mode(&mut self, mode: ConnectionMode) -> &mut Self {
        self.config.connection_mode = mode;
        self
    }

    pub fn with_force_sent_by(&mut self, force_sent_by: bool) -> &mut Self {
        self.config.force_sent_by = force_sent_by;
        self
    }

    pub fn with_secure_transports(&mut self, transports: Vec<rsip::Transport>) -> &mut Self {
        self.config.secure_transports = transports;
        self
    }

    /// Halting the provider never cancels this token; cancelling it halts
    /// the provider.
    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    /// Binds every configured transport and starts the event loop.
    pub async fn build(&mut self) -> Result<Provider> {
        let cancel_token = self
            .cancel_token
            .as_ref()
            .map(|token| token.child_token())
            .unwrap_or_default();
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();

        let mut transports = Vec::with_capacity(self.transports.len());
        for pending in &self.transports {
            let mut options = TransportOptions::new(pending.addr);
            options.max_connections = self.config.max_connections;
            options.connection_mode = self.config.connection_mode;
            options.force_sent_by = self.config.force_sent_by;
            #[cfg(feature = "rustls")]
            {
                options.tls = pending.tls.clone();
            }
            let created = self
                .factory
                .create(&pending.name, options, sender.clone(), cancel_token.child_token())
                .await;
            match created {
                Ok(transport) => transports.push(transport),
                Err(e) => {
                    cancel_token.cancel();
                    transports.iter().for_each(SipTransport::halt);
                    return Err(e);
                }
            }
        }
        if transports.is_empty() {
            return Err(Error::Error("provider has no transports".to_string()));
        }

        let inner = Arc::new(ProviderInner {
            config: Mutex::new(self.config.clone()),
            transports,
            registry: ListenerRegistry::default(),
            cancel_token,
        });
        info!(
            "provider started on {}",
            inner
                .transports
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        tokio::spawn(serve_events(
            Arc::downgrade(&inner),
            receiver,
            inner.cancel_token.clone(),
        ));
        Ok(Provider { inner })
    }
}

struct ProviderInner {
    config: Mutex<ProviderConfig>,
    transports: Vec<SipTransport>,
    registry: ListenerRegistry,
    cancel_token: CancellationToken,
}

/// Handle to a running provider; clones share it.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

async fn serve_events(
    inner: Weak<ProviderInner>,
    mut receiver: TransportReceiver,
    cancel_token: CancellationToken,
) {
    loop {
        let event = select! {
            _ = cancel_token.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let provider = Provider { inner };
        match event {
            TransportEvent::Incoming(msg) => provider.receive(msg),
            TransportEvent::New(id) => debug!(%id, "connection established"),
            TransportEvent::Closed(id, reason) => {
                info!(%id, ?reason, "connection closed");
                provider.inner.registry.notify_closed(&id, reason.as_deref());
            }
        }
    }
    if cancel_token.is_cancelled() {
        // cancelled from outside: late registrations must not outlive it
        if let Some(inner) = inner.upgrade() {
            inner.registry.halt();
        }
    }
    debug!("provider event loop stopped");
}

impl Provider {
    fn config(&self) -> MutexGuard<'_, ProviderConfig> {
        self.inner
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_running(&self) -> Result<()> {
        if self.inner.cancel_token.is_cancelled() {
            return Err(Error::Halted("provider is halted".to_string()));
        }
        Ok(())
    }

    pub fn transports(&self) -> &[SipTransport] {
        &self.inner.transports
    }

    /// First transport speaking `protocol`.
    pub fn transport_for(&self, protocol: &rsip::Transport) -> Result<&SipTransport> {
        self.inner
            .transports
            .iter()
            .find(|t| &t.protocol() == protocol)
            .ok_or_else(|| Error::RoutingError(format!("no transport for {}", protocol)))
    }

    /// Bound listening address of the transport speaking `protocol`.
    pub fn local_addr(&self, protocol: &rsip::Transport) -> Option<SocketAddr> {
        self.transport_for(protocol).ok().map(|t| t.local_addr())
    }

    /// Live pooled connections across every stream transport.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner
            .transports
            .iter()
            .flat_map(|t| t.connections())
            .collect()
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.cancel_token.child_token()
    }

    fn via_template(
        &self,
        transport: &SipTransport,
        maddr: Option<String>,
        ttl: Option<u8>,
    ) -> ViaTemplate {
        let config = self.config();
        let local = transport.local_addr();
        ViaTemplate {
            transport: transport.protocol(),
            host: config
                .via_host
                .clone()
                .unwrap_or_else(|| local.ip().to_string()),
            port: config.via_port.unwrap_or(local.port()),
            maddr,
            ttl,
            rport: config.rport,
        }
    }

    /// Sends a message and returns the connection it left on, or `None` if
    /// it could not be sent; failures are logged. A request is updated in
    /// place with the top Via it went out with.
    pub async fn send(&self, msg: &mut OutgoingMessage) -> Option<ConnectionId> {
        match self.try_send(msg).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("send failed: {}", e);
                None
            }
        }
    }

    /// Like [`Provider::send`], with the reason on failure.
    pub async fn try_send(&self, msg: &mut OutgoingMessage) -> Result<ConnectionId> {
        self.check_running()?;

        if let Some(id) = msg.connection_id.clone() {
            match self.send_pinned(&id, &mut msg.message).await {
                Ok(id) => return Ok(id),
                Err(e) => debug!(%id, "pinned send failed, routing instead: {}", e),
            }
        }

        if matches!(msg.message, SipMessage::Request(_)) {
            self.send_request(&mut msg.message).await
        } else {
            self.send_response(&msg.message).await
        }
    }

    async fn send_pinned(&self, id: &ConnectionId, message: &mut SipMessage) -> Result<ConnectionId> {
        let transport = self.transport_for(&id.transport)?;
        if matches!(message, SipMessage::Request(_)) {
            prepare_via(message, &self.via_template(transport, None, None))?;
        }
        transport.send_pinned(id, message).await
    }

    async fn send_request(&self, message: &mut SipMessage) -> Result<ConnectionId> {
        let routing = self.config().routing();
        let hop = match message {
            SipMessage::Request(req) => next_hop(req, &routing)?,
            SipMessage::Response(_) => {
                return Err(Error::RoutingError("expected a request".to_string()))
            }
        };
        let transport = self.transport_for(&hop.transport())?;
        prepare_via(
            message,
            &self.via_template(transport, hop.maddr.clone(), hop.ttl),
        )?;
        let dest = hop.target.resolve().await?;
        debug!(%dest, "sending request over {}", transport);
        transport.send(message, dest, hop.ttl).await
    }

    async fn send_response(&self, message: &SipMessage) -> Result<ConnectionId> {
        let target = response_destination(message)?;
        let transport = self.transport_for(&target.r#type.clone().unwrap_or_default())?;
        let dest = target.resolve().await?;
        debug!(%dest, "sending response over {}", transport);
        transport.send(message, dest, None).await
    }

    /// Sends bytes as they are, with no Via handling.
    pub async fn send_raw(
        &self,
        protocol: &rsip::Transport,
        dest: SocketAddr,
        ttl: Option<u8>,
        data: &[u8],
    ) -> Option<ConnectionId> {
        match self.try_send_raw(protocol, dest, ttl, data).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(%dest, "raw send failed: {}", e);
                None
            }
        }
    }

    pub async fn try_send_raw(
        &self,
        protocol: &rsip::Transport,
        dest: SocketAddr,
        ttl: Option<u8>,
        data: &[u8],
    ) -> Result<ConnectionId> {
        self.check_running()?;
        self.transport_for(protocol)?
            .send_raw(data, dest, ttl)
            .await
    }

    /// Stamps an inbound request's top Via with what was observed, then
    /// dispatches the message.
    pub fn receive(&self, mut msg: IncomingMessage) {
        if self.inner.cancel_token.is_cancelled() {
            return;
        }
        let force_rport = self.config().force_rport;
        match nat::stamp(&mut msg.message, msg.source, force_rport) {
            Ok(true) => debug!(source = %msg.source, "stamped top Via"),
            Ok(false) => {}
            Err(e) => debug!(source = %msg.source, "cannot stamp top Via: {}", e),
        }
        self.inner.registry.dispatch(&msg);
    }

    /// Classifies bytes received outside a transport loop and dispatches
    /// them if they are a SIP message. Keep-alives and noise are dropped.
    pub fn receive_raw(&self, buf: &[u8], connection_id: ConnectionId) {
        match message::parse_datagram(buf) {
            Datagram::Message(msg) => self.receive(IncomingMessage::new(msg, connection_id)),
            Datagram::Ping | Datagram::Pong => {}
            Datagram::Noise => debug!(%connection_id, len = buf.len(), "dropping noise"),
        }
    }

    pub fn add_selective_listener(
        &self,
        key: impl Into<ListenerKey>,
        listener: SipListenerRef,
    ) -> Result<()> {
        self.check_running()?;
        self.inner.registry.add_selective(key.into(), listener)
    }

    pub fn remove_selective_listener(&self, key: impl Into<ListenerKey>) -> Option<SipListenerRef> {
        self.inner.registry.remove_selective(&key.into())
    }

    pub fn add_promiscuous_listener(&self, listener: SipListenerRef) -> Result<()> {
        self.check_running()?;
        self.inner.registry.add_promiscuous(listener)
    }

    pub fn remove_promiscuous_listener(&self, listener: &SipListenerRef) -> bool {
        self.inner.registry.remove_promiscuous(listener)
    }

    pub fn add_exception_listener(&self, listener: ExceptionListenerRef) -> Result<()> {
        self.check_running()?;
        self.inner.registry.add_exception(listener)
    }

    pub fn remove_exception_listener(&self, listener: &ExceptionListenerRef) -> bool {
        self.inner.registry.remove_exception(listener)
    }

    pub fn config_snapshot(&self) -> ProviderConfig {
        self.config().clone()
    }

    pub fn set_outbound_proxy(&self, proxy: Option<SipAddr>) {
        self.config().outbound_proxy = proxy;
    }

    pub fn set_tel_gateway(&self, gateway: Option<SipAddr>) {
        self.config().tel_gateway = gateway;
    }

    pub fn set_rport(&self, rport: bool) {
        self.config().rport = rport;
    }

    pub fn set_force_rport(&self, force_rport: bool) {
        self.config().force_rport = force_rport;
    }

    /// Applies to every stream pool at once; shrinking evicts immediately.
    pub fn set_max_connections(&self, max_connections: usize) {
        let max_connections = max_connections.max(1);
        self.config().max_connections = max_connections;
        for transport in &self.inner.transports {
            if let SipTransport::Stream(stream) = transport {
                stream.set_max_connections(max_connections);
            }
        }
    }

    pub fn set_connection_mode(&self, mode: ConnectionMode) {
        self.config().connection_mode = mode;
        for transport in &self.inner.transports {
            if let SipTransport::Stream(stream) = transport {
                stream.pool().set_mode(mode);
            }
        }
    }

    pub fn set_force_sent_by(&self, force_sent_by: bool) {
        self.config().force_sent_by = force_sent_by;
        for transport in &self.inner.transports {
            if let SipTransport::Stream(stream) = transport {
                stream.set_force_sent_by(force_sent_by);
            }
        }
    }

    pub fn new_branch(&self) -> String {
        make_branch()
    }

    pub fn new_tag(&self) -> String {
        make_tag()
    }

    /// Random Call-ID qualified with the local via address.
    pub fn new_call_id(&self) -> String {
        let host = self.config().via_host.clone();
        let host = host.unwrap_or_else(|| {
            self.inner
                .transports
                .first()
                .map(|t| t.local_addr().ip())
                .unwrap_or(IpAddr::from([127, 0, 0, 1]))
                .to_string()
        });
        make_call_id(&host)
    }

    /// Stops every transport and clears the listener tables. Registrations
    /// made afterwards fail with [`Error::Halted`].
    pub fn halt(&self) {
        if self.inner.cancel_token.is_cancelled() && self.inner.registry.is_halted() {
            return;
        }
        info!("halting provider");
        self.inner.cancel_token.cancel();
        for transport in &self.inner.transports {
            transport.halt();
        }
        self.inner.registry.halt();
    }

    pub fn is_halted(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("transports", &self.inner.transports)
            .finish()
    }
}
