//! Message registration and dispatch for peerwire.
//!
//! - **Registration** ([`RegistrationTable`]): the startup table that
//!   binds each message type to its wire id.
//! - **Broker** ([`MessageBroker`]): one per message type: an object
//!   pool, the subscriber lists, and dispatch that tolerates subscribers
//!   changing the lists while it runs.
//! - **Registry** ([`MessageRegistry`]): owns a peer's brokers and
//!   routes inbound envelopes to them by id.
//!
//! Everything here is single-threaded (`Rc`, `RefCell`), matching the
//! poll-driven peers that own it.

mod broker;
mod error;
mod registration;
mod registry;

pub use broker::{HandlerOutcome, MessageBroker, Subscription, Subscriptions};
pub use error::BrokerError;
pub use registration::RegistrationTable;
pub use registry::{Delivery, MessageRegistry};
