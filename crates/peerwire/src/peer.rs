//! Behaviour shared by both peer roles.

use bytes::Bytes;
use peerwire_broker::{
    BrokerError, Delivery, HandlerOutcome, MessageRegistry, Subscription, Subscriptions,
};
use peerwire_protocol::Message;
use peerwire_session::Connection;
use peerwire_transport::{ConnectionId, StreamSocket};

use crate::PeerError;

/// The operations a [`Client`](crate::Client) and a
/// [`Server`](crate::Server) have in common.
///
/// Implementors supply [`tick`](Self::tick),
/// [`send_message`](Self::send_message) and access to their registry;
/// the pooling and subscription methods come for free.
pub trait Peer {
    /// Accepts, flushes, receives and dispatches whatever is ready.
    /// Never blocks.
    fn tick(&mut self);

    /// Sends `message` to the remote side (a server broadcasts) and
    /// returns it to its pool.
    ///
    /// Sending with nobody connected, or to a connection that fails
    /// mid-send, drops the message with a log line and still returns
    /// `Ok`.
    ///
    /// # Errors
    /// Returns [`PeerError::Broker`] if `T` is not registered or cannot
    /// be encoded.
    fn send_message<T: Message>(&mut self, message: T) -> Result<(), PeerError>;

    /// The registry holding this peer's brokers.
    fn registry_mut(&mut self) -> &mut MessageRegistry;

    /// Sends a blank `T`.
    fn send_default<T: Message>(&mut self) -> Result<(), PeerError> {
        let message = self.get_message::<T>()?;
        self.send_message(message)
    }

    /// A blank `T` from its pool, ready to fill in and send.
    fn get_message<T: Message>(&mut self) -> Result<T, PeerError> {
        Ok(self.registry_mut().get::<T>()?)
    }

    /// Calls `handler` for every `T` received.
    fn subscribe<T, R, F>(&mut self, handler: F) -> Result<Subscription, PeerError>
    where
        T: Message,
        R: HandlerOutcome,
        F: FnMut(&T) -> R + 'static,
    {
        Ok(self.registry_mut().broker::<T>()?.subscribe(handler))
    }

    /// Calls `handler` with the sender's id for every `T` received.
    fn subscribe_from<T, R, F>(&mut self, handler: F) -> Result<Subscription, PeerError>
    where
        T: Message,
        R: HandlerOutcome,
        F: FnMut(ConnectionId, &T) -> R + 'static,
    {
        Ok(self.registry_mut().broker::<T>()?.subscribe_from(handler))
    }

    /// Removes a subscription. `Ok(false)` if it was already gone.
    fn unsubscribe<T: Message>(&mut self, subscription: Subscription) -> Result<bool, PeerError> {
        Ok(self.registry_mut().broker::<T>()?.unsubscribe(subscription))
    }

    /// A handle that handlers can capture to change `T`'s subscribers
    /// while dispatch is running.
    fn subscriptions<T: Message>(&mut self) -> Result<Subscriptions<T>, PeerError> {
        Ok(self.registry_mut().subscriptions::<T>()?)
    }
}

/// Encodes and frames `message` once, hands the wire bytes to `send`,
/// then returns the message to its pool. The message goes back to the
/// pool even when encoding fails, in which case `send` is not called.
pub(crate) fn send_pooled<T: Message>(
    registry: &mut MessageRegistry,
    message: T,
    send: impl FnOnce(&Bytes),
) -> Result<(), PeerError> {
    let broker = registry.broker::<T>()?;
    let framed = broker
        .encode(&message)
        .map_err(PeerError::from)
        .and_then(|envelope| envelope.frame().map_err(PeerError::from));
    if let Ok(wire) = &framed {
        send(wire);
    }
    broker.release(message);
    framed.map(|_| ())
}

/// Flushes `connection`, then reads and dispatches up to `max_frames`
/// envelopes from it. Any failure leaves the connection closed.
pub(crate) fn pump<S: StreamSocket>(
    connection: &mut Connection<S>,
    registry: &MessageRegistry,
    max_frames: usize,
) {
    if !connection.is_open() || connection.flush().is_err() {
        return;
    }

    let from = connection.id();
    for _ in 0..max_frames {
        let mut envelope = match connection.receive() {
            Ok(Some(envelope)) => envelope,
            // Either nothing is ready or the connection just closed;
            // `receive` logged the reason.
            Ok(None) | Err(_) => return,
        };

        match registry.dispatch(from, &mut envelope) {
            Ok(Delivery::Dispatched { failures: 0 } | Delivery::Unrouted) => {}
            Ok(Delivery::Dispatched { failures }) => {
                tracing::debug!(connection_id = %from, failures, "dispatch finished with failed handlers");
            }
            Err(e @ BrokerError::Decode { .. }) => {
                tracing::error!(connection_id = %from, error = %e, "undecodable message, closing");
                connection.close();
                return;
            }
            Err(e) => {
                tracing::warn!(connection_id = %from, error = %e, "dispatch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerwire_broker::RegistrationTable;
    use peerwire_protocol::{Envelope, ProtocolError};

    #[derive(Debug, Default)]
    struct Counter {
        value: i32,
    }

    impl Message for Counter {
        fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
            envelope.write_int(self.value);
            Ok(())
        }

        fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
            self.value = envelope.read_int()?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Unwritable;

    impl Message for Unwritable {
        fn write(&self, _: &mut Envelope) -> Result<(), ProtocolError> {
            Err(ProtocolError::Framing("cannot encode".to_string()))
        }

        fn read(&mut self, _: &mut Envelope) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    fn registry() -> MessageRegistry {
        let table = RegistrationTable::new()
            .register::<Counter>(1)
            .unwrap()
            .register::<Unwritable>(2)
            .unwrap();
        MessageRegistry::new(table)
    }

    #[test]
    fn test_send_pooled_releases_after_send_attempt() {
        let mut registry = registry();
        let broker = registry.broker::<Counter>().unwrap();
        let mut seen = None;

        send_pooled(&mut registry, Counter { value: 7 }, |wire| {
            seen = Some((wire.len(), broker.pooled()));
        })
        .unwrap();

        // prefix + kind + id + one int
        assert_eq!(seen, Some((16, 0)), "still checked out while sending");
        assert_eq!(broker.pooled(), 1);
        assert_eq!(registry.get::<Counter>().unwrap().value, 0);
    }

    #[test]
    fn test_send_pooled_encode_failure_skips_send_and_still_releases() {
        let mut registry = registry();
        let broker = registry.broker::<Unwritable>().unwrap();
        let mut called = false;

        let result = send_pooled(&mut registry, Unwritable, |_| called = true);

        assert!(matches!(result, Err(PeerError::Broker(_))));
        assert!(!called);
        assert_eq!(broker.pooled(), 1);
    }
}
