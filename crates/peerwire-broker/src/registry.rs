//! The per-peer registry of message brokers.
//!
//! Every peer owns one registry. It is responsible for:
//! - Turning a message type into its registered wire id
//! - Creating the broker for a type the first time that type is used
//! - Routing an inbound envelope to the broker for its id
//!
//! # Concurrency note
//!
//! Brokers are shared through `Rc` and keep their state in `RefCell`s,
//! so a registry and everything it hands out is `!Send`. All of it lives
//! on the thread that calls `tick`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

use peerwire_protocol::{Envelope, Message, MessageId};
use peerwire_transport::ConnectionId;

use crate::{BrokerError, MessageBroker, RegistrationTable, Subscriptions};

/// Type-erased view of a [`MessageBroker`], used to route inbound
/// envelopes by id.
trait ErasedBroker {
    fn dispatch_envelope(
        &self,
        from: ConnectionId,
        envelope: &mut Envelope,
    ) -> Result<usize, BrokerError>;
}

impl<T: Message> ErasedBroker for MessageBroker<T> {
    fn dispatch_envelope(
        &self,
        from: ConnectionId,
        envelope: &mut Envelope,
    ) -> Result<usize, BrokerError> {
        MessageBroker::dispatch_envelope(self, from, envelope)
    }
}

struct Entry {
    typed: Rc<dyn Any>,
    erased: Rc<dyn ErasedBroker>,
}

/// Resolves message types to ids and owns one broker per type.
///
/// Brokers are created the first time a type is used on this peer, by
/// getting, sending or subscribing to it. Inbound envelopes for an id
/// whose broker does not exist yet have nobody to deliver to and are
/// dropped.
///
/// ## Broker lifecycle
///
/// ```text
///                 broker::<T>() / get / subscribe
/// [no broker] ──────────────────────────────────→ [broker for T]
///      │                                                │
///      ▼ dispatch(envelope with T's id)                 ▼ dispatch(envelope with T's id)
///  Delivery::Unrouted                        Delivery::Dispatched { failures }
/// ```
///
/// A broker, once created, lives as long as the registry.
pub struct MessageRegistry {
    /// The static type-to-id bindings, fixed at construction.
    table: RegistrationTable,

    /// Ids already resolved, so repeat lookups skip the table.
    by_type: HashMap<TypeId, MessageId>,

    /// One entry per created broker, keyed by wire id. Each entry holds
    /// the same broker twice: typed for `broker::<T>()`, erased for
    /// routing envelopes whose type is only known by id.
    by_id: HashMap<MessageId, Entry>,
}

/// Result of routing one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The envelope reached the broker; `failures` handlers failed.
    Dispatched {
        /// Handlers that returned an error or panicked.
        failures: usize,
    },
    /// No broker exists for the envelope's id.
    Unrouted,
}

impl MessageRegistry {
    /// Creates a registry over a registration table.
    pub fn new(table: RegistrationTable) -> Self {
        Self {
            table,
            by_type: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// The table this registry resolves against.
    pub fn table(&self) -> &RegistrationTable {
        &self.table
    }

    /// The wire id of `T`.
    ///
    /// # Errors
    /// Returns [`BrokerError::Unregistered`] if `T` is not registered.
    pub fn resolve_id<T: Message>(&self) -> Result<MessageId, BrokerError> {
        self.table.resolve::<T>()
    }

    /// The broker for `T`, created on first use.
    ///
    /// # Errors
    /// Returns [`BrokerError::Unregistered`] if `T` is not registered.
    pub fn broker<T: Message>(&mut self) -> Result<Rc<MessageBroker<T>>, BrokerError> {
        if let Some(id) = self.by_type.get(&TypeId::of::<T>()) {
            if let Some(broker) = self
                .by_id
                .get(id)
                .and_then(|entry| Rc::clone(&entry.typed).downcast::<MessageBroker<T>>().ok())
            {
                return Ok(broker);
            }
        }

        let id = self.table.resolve::<T>()?;
        let broker = Rc::new(MessageBroker::<T>::new(id));
        self.by_type.insert(TypeId::of::<T>(), id);
        self.by_id.insert(
            id,
            Entry {
                typed: Rc::clone(&broker) as Rc<dyn Any>,
                erased: Rc::clone(&broker) as Rc<dyn ErasedBroker>,
            },
        );
        tracing::trace!(message_id = %id, type_name = std::any::type_name::<T>(), "broker created");
        Ok(broker)
    }

    /// A handle for managing `T`'s subscribers.
    pub fn subscriptions<T: Message>(&mut self) -> Result<Subscriptions<T>, BrokerError> {
        self.broker::<T>().map(Subscriptions::new)
    }

    /// A blank `T` from its pool.
    pub fn get<T: Message>(&mut self) -> Result<T, BrokerError> {
        Ok(self.broker::<T>()?.get())
    }

    /// Returns `message` to its pool.
    pub fn release<T: Message>(&mut self, message: T) -> Result<(), BrokerError> {
        self.broker::<T>()?.release(message);
        Ok(())
    }

    /// Routes an inbound envelope to the broker for its id.
    ///
    /// # Errors
    /// Returns [`BrokerError::Decode`] if the body does not parse as the
    /// registered type.
    pub fn dispatch(
        &self,
        from: ConnectionId,
        envelope: &mut Envelope,
    ) -> Result<Delivery, BrokerError> {
        let Some(id) = envelope.message_id() else {
            return Ok(Delivery::Unrouted);
        };
        let Some(entry) = self.by_id.get(&id) else {
            tracing::debug!(
                connection_id = %from,
                message_id = %id,
                known = self.table.type_name_of(id).is_some(),
                "no broker for message id, dropping"
            );
            return Ok(Delivery::Unrouted);
        };

        // Clone out so handlers never run with the registry borrowed.
        let broker = Rc::clone(&entry.erased);
        let failures = broker.dispatch_envelope(from, envelope)?;
        Ok(Delivery::Dispatched { failures })
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("registered", &self.table.len())
            .field("brokers", &self.by_id.len())
            .finish()
    }
}
