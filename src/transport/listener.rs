use crate::transport::StreamTransport;
use std::fmt;
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept loop of a stream transport. Each accepted socket is wrapped (and
/// for TLS handshaken) on its own task so a slow peer never blocks accept.
pub struct StreamListener {
    listener: TcpListener,
    transport: StreamTransport,
}

impl StreamListener {
    pub fn new(listener: TcpListener, transport: StreamTransport) -> Self {
        Self {
            listener,
            transport,
        }
    }

    pub fn spawn(self, cancel_token: CancellationToken) {
        tokio::spawn(async move { self.serve_listener(cancel_token).await });
    }

    async fn serve_listener(self, cancel_token: CancellationToken) {
        info!("{} accepting", self);
        loop {
            let (stream, remote_addr) = select! {
                _ = cancel_token.cancelled() => break,
                r = self.listener.accept() => match r {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept connection: {:?}", e);
                        continue;
                    }
                },
            };
            debug!(%remote_addr, "accepted connection");
            let transport = self.transport.clone();
            tokio::spawn(async move {
                match transport.accept_stream(stream).await {
                    Ok(connection) => transport.register(connection),
                    Err(e) => warn!(%remote_addr, "dropping inbound connection: {}", e),
                }
            });
        }
        info!("{} stopped accepting", self);
    }
}

impl fmt::Display for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener {}", self.transport)
    }
}
