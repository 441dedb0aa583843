//! Listener registry and dispatch of inbound messages.
use crate::{
    identifier::{ConnectionId, DialogId, ListenerKey, MethodId, TransactionId},
    message::{self, IncomingMessage},
    Error, Result,
};
use std::{
    any::Any,
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

/// Receives inbound messages. Returning an error (or panicking) is reported
/// to the exception listeners and never stops delivery to other listeners.
pub trait SipListener: Send + Sync {
    fn on_message(&self, msg: &IncomingMessage) -> Result<()>;

    /// A pooled connection ended, with the error that ended it if any.
    fn on_connection_closed(&self, _id: &ConnectionId, _error: Option<&str>) {}
}

pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, error: &Error, msg: Option<&IncomingMessage>);
}

pub type SipListenerRef = Arc<dyn SipListener>;
pub type ExceptionListenerRef = Arc<dyn ExceptionListener>;

/// Forwards every message it is handed into an mpsc channel.
pub struct ChannelListener {
    sender: UnboundedSender<IncomingMessage>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<IncomingMessage>) {
        let (sender, receiver) = unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl SipListener for ChannelListener {
    fn on_message(&self, msg: &IncomingMessage) -> Result<()> {
        self.sender.send(msg.clone())?;
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    halted: bool,
    selective: HashMap<ListenerKey, SipListenerRef>,
    promiscuous: Vec<SipListenerRef>,
    exception: Vec<ExceptionListenerRef>,
}

/// All listener tables of one provider behind a single lock. Listeners are
/// always invoked outside it.
#[derive(Default)]
pub struct ListenerRegistry {
    state: Mutex<RegistryState>,
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(msg) => *msg,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(msg) => msg.to_string(),
            Err(_) => "listener panicked".to_string(),
        },
    }
}

impl ListenerRegistry {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<MutexGuard<'_, RegistryState>> {
        let state = self.state();
        if state.halted {
            return Err(Error::Halted("provider is halted".to_string()));
        }
        Ok(state)
    }

    /// Registers `listener` under `key`, replacing any previous one.
    pub fn add_selective(&self, key: ListenerKey, listener: SipListenerRef) -> Result<()> {
        let mut state = self.open()?;
        if state.selective.insert(key.clone(), listener).is_some() {
            warn!(%key, "replaced selective listener");
        }
        Ok(())
    }

    pub fn remove_selective(&self, key: &ListenerKey) -> Option<SipListenerRef> {
        self.state().selective.remove(key)
    }

    pub fn add_promiscuous(&self, listener: SipListenerRef) -> Result<()> {
        self.open()?.promiscuous.push(listener);
        Ok(())
    }

    pub fn remove_promiscuous(&self, listener: &SipListenerRef) -> bool {
        let mut state = self.state();
        let before = state.promiscuous.len();
        state.promiscuous.retain(|l| !same(l, listener));
        state.promiscuous.len() != before
    }

    pub fn add_exception(&self, listener: ExceptionListenerRef) -> Result<()> {
        self.open()?.exception.push(listener);
        Ok(())
    }

    pub fn remove_exception(&self, listener: &ExceptionListenerRef) -> bool {
        let mut state = self.state();
        let before = state.exception.len();
        state.exception.retain(|l| !same(l, listener));
        state.exception.len() != before
    }

    pub fn selective_len(&self) -> usize {
        self.state().selective.len()
    }

    /// Clears every table and refuses further registrations, under the same
    /// lock registrations take.
    pub fn halt(&self) {
        let mut state = self.state();
        state.halted = true;
        state.selective.clear();
        state.promiscuous.clear();
        state.exception.clear();
    }

    pub fn is_halted(&self) -> bool {
        self.state().halted
    }

    /// Promiscuous listeners first, in registration order; then, for a
    /// well-formed message, exactly one selective listener: transaction,
    /// dialog, method, any-method, first match wins.
    pub fn dispatch(&self, msg: &IncomingMessage) {
        let promiscuous = {
            let state = self.state();
            if state.halted {
                return;
            }
            state.promiscuous.clone()
        };
        for listener in &promiscuous {
            self.invoke(listener, msg);
        }

        if !message::is_well_formed(&msg.message) {
            debug!(source = %msg.source, "not dispatching malformed message");
            return;
        }

        let mut keys: Vec<ListenerKey> = Vec::with_capacity(4);
        if let Ok(id) = TransactionId::incoming(&msg.message) {
            keys.push(id.into());
        }
        if let Ok(id) = DialogId::incoming(&msg.message) {
            keys.push(id.into());
        }
        if let Ok(id) = MethodId::from_message(&msg.message) {
            keys.push(id.into());
        }
        keys.push(MethodId::Any.into());

        let selected = {
            let state = self.state();
            keys.iter()
                .find_map(|key| state.selective.get(key).map(|l| (key, l.clone())))
        };
        match selected {
            Some((key, listener)) => {
                debug!(%key, "dispatching");
                self.invoke(&listener, msg);
            }
            None => warn!(
                source = %msg.source,
                "no listener for message, dropping: {}",
                first_line(&msg.message)
            ),
        }
    }

    /// Tells every registered listener, once each, that a connection ended.
    pub fn notify_closed(&self, id: &ConnectionId, error: Option<&str>) {
        let listeners = {
            let state = self.state();
            let mut listeners: Vec<SipListenerRef> = state.promiscuous.clone();
            for listener in state.selective.values() {
                if !listeners.iter().any(|l| same(l, listener)) {
                    listeners.push(listener.clone());
                }
            }
            listeners
        };
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.on_connection_closed(id, error)
            }));
            if let Err(panic) = result {
                self.report(&Error::ListenerError(panic_message(panic)), None);
            }
        }
    }

    fn invoke(&self, listener: &SipListenerRef, msg: &IncomingMessage) {
        let error = match catch_unwind(AssertUnwindSafe(|| listener.on_message(msg))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(panic) => Error::ListenerError(panic_message(panic)),
        };
        warn!("listener failed: {}", error);
        self.report(&error, Some(msg));
    }

    /// Hands a listener failure to every exception listener.
    pub fn report(&self, error: &Error, msg: Option<&IncomingMessage>) {
        let listeners = self.state().exception.clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_exception(error, msg))).is_err() {
                error!("exception listener panicked while handling: {}", error);
            }
        }
    }
}

fn first_line(msg: &rsip::SipMessage) -> String {
    msg.to_string().lines().next().unwrap_or_default().to_string()
}
