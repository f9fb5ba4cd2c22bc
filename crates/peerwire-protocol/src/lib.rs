//! Wire protocol for peerwire.
//!
//! - **Envelope** ([`Envelope`], [`Kind`], [`MessageId`]): the framed
//!   unit on the wire and the field codec for its body.
//! - **Message** ([`Message`]): the trait application message types
//!   implement to write themselves into, and read themselves out of, an
//!   envelope.
//! - **Errors** ([`ProtocolError`]): everything that makes a frame
//!   undecodable.
//!
//! The protocol layer knows nothing about sockets. The session layer
//! feeds it complete frames and the broker layer maps message ids to
//! types.
//!
//! ```text
//! Transport (bytes) → Session (frames) → Protocol (Envelope) → Broker (T)
//! ```

mod envelope;
mod error;
mod message;

pub use envelope::{Envelope, Kind, LENGTH_PREFIX_LEN, MessageId};
pub use error::ProtocolError;
pub use message::Message;
