//! Per-type message broker: object pool, subscribers, dispatch.
//!
//! Subscribers may add or remove subscribers of the same type while a
//! dispatch is running. Those changes are staged and applied as soon as
//! the running pass finishes, adds first, then removes, so the pass in
//! flight always sees the handler set it started with.

use std::any::type_name;
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use peerwire_protocol::{Envelope, Message, MessageId};
use peerwire_transport::ConnectionId;

use crate::BrokerError;

/// What a subscriber returns.
///
/// Implemented for `()` and for `Result<(), E>` with a displayable
/// error, so handlers can use `?` when they want to.
pub trait HandlerOutcome {
    /// Converts the handler's return value into an error message, if
    /// it failed.
    fn into_outcome(self) -> Result<(), String>;
}

impl HandlerOutcome for () {
    fn into_outcome(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> HandlerOutcome for Result<(), E> {
    fn into_outcome(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HandlerId(u64);

/// Receipt for one subscription; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    message_id: MessageId,
    handler: HandlerId,
}

impl Subscription {
    /// The message id the subscription listens to.
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

type GlobalFn<T> = Box<dyn FnMut(&T) -> Result<(), String>>;
type ScopedFn<T> = Box<dyn FnMut(ConnectionId, &T) -> Result<(), String>>;

enum Handler<T> {
    Global(GlobalFn<T>),
    Scoped(ScopedFn<T>),
}

/// Pool, subscribers and dispatch for one message type.
///
/// Every method takes `&self`; the broker lives behind an `Rc` so that
/// handlers can hold a [`Subscriptions`] handle to it and change the
/// subscriber set mid-dispatch.
pub struct MessageBroker<T> {
    id: MessageId,
    pool: RefCell<VecDeque<T>>,
    globals: RefCell<Vec<(HandlerId, GlobalFn<T>)>>,
    scoped: RefCell<Vec<(HandlerId, ScopedFn<T>)>>,
    // Ids in `globals` or `scoped`, readable while those are borrowed
    // by a running dispatch.
    live: RefCell<HashSet<HandlerId>>,
    pending_add: RefCell<Vec<(HandlerId, Handler<T>)>>,
    pending_remove: RefCell<Vec<HandlerId>>,
    busy: Cell<bool>,
    next_handler: Cell<u64>,
}

impl<T: Message> MessageBroker<T> {
    /// Creates a broker for messages travelling under `id`.
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            pool: RefCell::new(VecDeque::new()),
            globals: RefCell::new(Vec::new()),
            scoped: RefCell::new(Vec::new()),
            live: RefCell::new(HashSet::new()),
            pending_add: RefCell::new(Vec::new()),
            pending_remove: RefCell::new(Vec::new()),
            busy: Cell::new(false),
            next_handler: Cell::new(0),
        }
    }

    /// The wire id of `T`.
    pub fn id(&self) -> MessageId {
        self.id
    }

    // -- Pool -------------------------------------------------------------

    /// Takes a blank instance from the pool, or makes one.
    pub fn get(&self) -> T {
        self.pool.borrow_mut().pop_front().unwrap_or_default()
    }

    /// Clears `message` and returns it to the pool.
    pub fn release(&self, mut message: T) {
        message.clear();
        self.pool.borrow_mut().push_back(message);
    }

    /// Instances currently waiting in the pool.
    pub fn pooled(&self) -> usize {
        self.pool.borrow().len()
    }

    // -- Codec ------------------------------------------------------------

    /// Writes `message` into a fresh envelope under this broker's id.
    pub fn encode(&self, message: &T) -> Result<Envelope, BrokerError> {
        let mut envelope = Envelope::message(self.id);
        message
            .write(&mut envelope)
            .map_err(|source| BrokerError::Encode {
                type_name: type_name::<T>(),
                source,
            })?;
        Ok(envelope)
    }

    /// Reads a pooled instance out of `envelope`. On failure the
    /// instance goes back to the pool.
    pub fn decode(&self, envelope: &mut Envelope) -> Result<T, BrokerError> {
        let mut message = self.get();
        match message.read(envelope) {
            Ok(()) => Ok(message),
            Err(source) => {
                self.release(message);
                Err(BrokerError::Decode {
                    type_name: type_name::<T>(),
                    source,
                })
            }
        }
    }

    // -- Subscribers ------------------------------------------------------

    /// Adds a handler that runs for every `T`, whoever sent it.
    pub fn subscribe<R, F>(&self, mut handler: F) -> Subscription
    where
        R: HandlerOutcome,
        F: FnMut(&T) -> R + 'static,
    {
        self.add(Handler::Global(Box::new(move |m| handler(m).into_outcome())))
    }

    /// Adds a handler that also receives the sender's connection id.
    pub fn subscribe_from<R, F>(&self, mut handler: F) -> Subscription
    where
        R: HandlerOutcome,
        F: FnMut(ConnectionId, &T) -> R + 'static,
    {
        self.add(Handler::Scoped(Box::new(move |c, m| {
            handler(c, m).into_outcome()
        })))
    }

    /// Removes a handler. Returns `false` if the receipt belongs to
    /// another message type or the handler is already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        if subscription.message_id != self.id {
            tracing::warn!(
                expected = %self.id,
                got = %subscription.message_id,
                "subscription belongs to another message type"
            );
            return false;
        }
        let handler = subscription.handler;

        if self.busy.get() {
            let mut pending_add = self.pending_add.borrow_mut();
            if let Some(pos) = pending_add.iter().position(|(h, _)| *h == handler) {
                pending_add.remove(pos);
                return true;
            }
            drop(pending_add);

            if !self.is_live(handler) {
                return false;
            }
            let mut pending_remove = self.pending_remove.borrow_mut();
            if !pending_remove.contains(&handler) {
                pending_remove.push(handler);
            }
            return true;
        }

        self.remove_live(handler)
    }

    /// Live subscribers, not counting staged changes.
    pub fn handler_count(&self) -> usize {
        self.live.borrow().len()
    }

    fn add(&self, handler: Handler<T>) -> Subscription {
        let id = HandlerId(self.next_handler.get());
        self.next_handler.set(id.0 + 1);

        // Receipts are never reused, so a fresh id cannot be staged for
        // removal. Only an unsubscribe can cancel a staged change.
        if self.busy.get() {
            self.pending_add.borrow_mut().push((id, handler));
        } else {
            self.install(id, handler);
        }

        Subscription {
            message_id: self.id,
            handler: id,
        }
    }

    fn install(&self, id: HandlerId, handler: Handler<T>) {
        self.live.borrow_mut().insert(id);
        match handler {
            Handler::Global(f) => self.globals.borrow_mut().push((id, f)),
            Handler::Scoped(f) => self.scoped.borrow_mut().push((id, f)),
        }
    }

    fn is_live(&self, id: HandlerId) -> bool {
        self.live.borrow().contains(&id)
    }

    fn remove_live(&self, id: HandlerId) -> bool {
        if !self.live.borrow_mut().remove(&id) {
            return false;
        }
        let mut globals = self.globals.borrow_mut();
        if let Some(pos) = globals.iter().position(|(h, _)| *h == id) {
            globals.remove(pos);
            return true;
        }
        let mut scoped = self.scoped.borrow_mut();
        if let Some(pos) = scoped.iter().position(|(h, _)| *h == id) {
            scoped.remove(pos);
        }
        true
    }

    // -- Dispatch ---------------------------------------------------------

    /// Runs every global handler, then every connection-scoped handler,
    /// in subscription order.
    ///
    /// Failing or panicking handlers are logged and skipped. Returns the
    /// number of handlers that failed.
    pub fn dispatch(&self, from: ConnectionId, message: &T) -> Result<usize, BrokerError> {
        if self.busy.replace(true) {
            return Err(BrokerError::DispatchInProgress {
                type_name: type_name::<T>(),
            });
        }

        let mut failures = 0;
        {
            let mut globals = self.globals.borrow_mut();
            for (_, handler) in globals.iter_mut() {
                let outcome = run_isolated(|| handler(message));
                failures += self.report(from, outcome);
            }
        }
        {
            let mut scoped = self.scoped.borrow_mut();
            for (_, handler) in scoped.iter_mut() {
                let outcome = run_isolated(|| handler(from, message));
                failures += self.report(from, outcome);
            }
        }

        self.busy.set(false);
        self.drain_staged();
        Ok(failures)
    }

    /// Decodes `envelope`, dispatches it, and returns the message to
    /// the pool.
    pub fn dispatch_envelope(
        &self,
        from: ConnectionId,
        envelope: &mut Envelope,
    ) -> Result<usize, BrokerError> {
        let message = self.decode(envelope)?;
        let result = self.dispatch(from, &message);
        self.release(message);
        result
    }

    fn report(&self, from: ConnectionId, outcome: Result<(), String>) -> usize {
        match outcome {
            Ok(()) => 0,
            Err(reason) => {
                let err = BrokerError::Handler {
                    type_name: type_name::<T>(),
                    reason,
                };
                tracing::warn!(connection_id = %from, message_id = %self.id, error = %err, "handler failed");
                1
            }
        }
    }

    fn drain_staged(&self) {
        let added: Vec<_> = self.pending_add.borrow_mut().drain(..).collect();
        for (id, handler) in added {
            self.install(id, handler);
        }
        let removed: Vec<_> = self.pending_remove.borrow_mut().drain(..).collect();
        for id in removed {
            self.remove_live(id);
        }
    }
}

fn run_isolated(f: impl FnOnce() -> Result<(), String>) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

impl<T> fmt::Debug for MessageBroker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBroker")
            .field("type", &type_name::<T>())
            .field("id", &self.id)
            .field("busy", &self.busy.get())
            .finish_non_exhaustive()
    }
}

/// A cloneable handle for managing the subscribers of one type.
///
/// Handlers can capture one to subscribe or unsubscribe while they run.
pub struct Subscriptions<T> {
    broker: Rc<MessageBroker<T>>,
}

impl<T: Message> Subscriptions<T> {
    pub(crate) fn new(broker: Rc<MessageBroker<T>>) -> Self {
        Self { broker }
    }

    /// See [`MessageBroker::subscribe`].
    pub fn subscribe<R, F>(&self, handler: F) -> Subscription
    where
        R: HandlerOutcome,
        F: FnMut(&T) -> R + 'static,
    {
        self.broker.subscribe(handler)
    }

    /// See [`MessageBroker::subscribe_from`].
    pub fn subscribe_from<R, F>(&self, handler: F) -> Subscription
    where
        R: HandlerOutcome,
        F: FnMut(ConnectionId, &T) -> R + 'static,
    {
        self.broker.subscribe_from(handler)
    }

    /// See [`MessageBroker::unsubscribe`].
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.broker.unsubscribe(subscription)
    }
}

impl<T> Clone for Subscriptions<T> {
    fn clone(&self) -> Self {
        Self {
            broker: Rc::clone(&self.broker),
        }
    }
}
