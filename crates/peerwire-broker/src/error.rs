//! Error types for the broker layer.

use peerwire_protocol::{MessageId, ProtocolError};

/// Errors that can occur while registering, encoding, decoding or
/// dispatching messages.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The type was never added to the registration table.
    #[error("message type {type_name} is not registered")]
    Unregistered {
        /// Rust name of the type.
        type_name: &'static str,
    },

    /// Another type already owns this id.
    #[error("message id {id} is already bound to {existing}, cannot bind {rejected}")]
    DuplicateId {
        /// The contested id.
        id: MessageId,
        /// Type that holds the id.
        existing: &'static str,
        /// Type that asked for it.
        rejected: &'static str,
    },

    /// The type is already registered.
    #[error("message type {type_name} is already registered as {id}")]
    DuplicateType {
        /// Rust name of the type.
        type_name: &'static str,
        /// Id it was registered under.
        id: MessageId,
    },

    /// The message could not be written into an envelope.
    #[error("failed to encode {type_name}: {source}")]
    Encode {
        /// Rust name of the type.
        type_name: &'static str,
        /// Underlying codec error.
        #[source]
        source: ProtocolError,
    },

    /// The envelope body could not be read back as the type its id
    /// names.
    #[error("failed to decode {type_name}: {source}")]
    Decode {
        /// Rust name of the type.
        type_name: &'static str,
        /// Underlying codec error.
        #[source]
        source: ProtocolError,
    },

    /// A subscriber returned an error or panicked. Dispatch carries on
    /// with the remaining subscribers.
    #[error("handler for {type_name} failed: {reason}")]
    Handler {
        /// Rust name of the type.
        type_name: &'static str,
        /// The handler's error, or the panic message.
        reason: String,
    },

    /// A handler tried to dispatch into the broker that is running it.
    #[error("dispatch for {type_name} is already in progress")]
    DispatchInProgress {
        /// Rust name of the type.
        type_name: &'static str,
    },
}

impl BrokerError {
    /// `true` for the errors that mean the peer sent a bad body, which
    /// is grounds for closing its connection.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_display_names_both_types() {
        let err = BrokerError::DuplicateId {
            id: MessageId(4),
            existing: "Ping",
            rejected: "Pong",
        };
        assert_eq!(
            err.to_string(),
            "message id M-4 is already bound to Ping, cannot bind Pong"
        );
    }

    #[test]
    fn test_is_decode_only_for_decode_errors() {
        let decode = BrokerError::Decode {
            type_name: "Ping",
            source: ProtocolError::Framing("x".into()),
        };
        assert!(decode.is_decode());
        assert!(!BrokerError::Unregistered { type_name: "Ping" }.is_decode());
    }
}
