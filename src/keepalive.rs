//! Periodic keep-alive sender bound to one destination.
use crate::{message::KEEPALIVE_REQUEST, Provider};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    select,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Refreshes a NAT binding or keeps a stream connection open by sending a
/// filler payload through [`Provider::send_raw`] on every tick.
///
/// ```rust,no_run
/// # use rsipstack_transport::{KeepAlive, Provider};
/// # use std::time::Duration;
/// # async fn example(provider: Provider) {
/// let handle = KeepAlive::new(
///     provider,
///     rsip::Transport::Udp,
///     "198.51.100.7:5060".parse().unwrap(),
///     Duration::from_secs(25),
/// )
/// .start();
/// // ...
/// handle.halt();
/// # }
/// ```
pub struct KeepAlive {
    provider: Provider,
    transport: rsip::Transport,
    dest: SocketAddr,
    interval: Duration,
    ttl: Option<u8>,
    payload: Vec<u8>,
}

impl KeepAlive {
    pub fn new(
        provider: Provider,
        transport: rsip::Transport,
        dest: SocketAddr,
        interval: Duration,
    ) -> Self {
        KeepAlive {
            provider,
            transport,
            dest,
            interval,
            ttl: None,
            payload: KEEPALIVE_REQUEST.to_vec(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Starts ticking; the first send happens one interval from now. The
    /// task also stops when the provider halts.
    pub fn start(self) -> KeepAliveHandle {
        let cancel_token = self.provider.child_token();
        let handle = KeepAliveHandle {
            cancel_token: cancel_token.clone(),
        };
        info!(dest = %self.dest, interval = ?self.interval, "starting keep-alive");
        tokio::spawn(self.run(cancel_token));
        handle
    }

    async fn run(self, cancel_token: CancellationToken) {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if cancel_token.is_cancelled() {
                break;
            }
            self.provider
                .send_raw(&self.transport, self.dest, self.ttl, &self.payload)
                .await;
        }
        debug!(dest = %self.dest, "keep-alive stopped");
    }
}

/// Owner's handle to a running [`KeepAlive`]. Dropping it stops the task.
#[derive(Debug)]
pub struct KeepAliveHandle {
    cancel_token: CancellationToken,
}

impl KeepAliveHandle {
    pub fn halt(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_halted(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
