//! The contract every application message type implements.

use crate::{Envelope, ProtocolError};

/// An application message that can be written into and read out of an
/// [`Envelope`] body.
///
/// `Default` produces the blank instance that message pools hand out
/// and refill. `read` must consume fields in the order `write` produced
/// them.
///
/// ```
/// use peerwire_protocol::{Envelope, Message, MessageId, ProtocolError};
///
/// #[derive(Debug, Default, PartialEq)]
/// struct Chat {
///     text: String,
/// }
///
/// impl Message for Chat {
///     fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
///         envelope.write_string(&self.text)
///     }
///
///     fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
///         self.text = envelope.read_string()?;
///         Ok(())
///     }
/// }
///
/// let mut envelope = Envelope::message(MessageId(1));
/// Chat { text: "hi".into() }.write(&mut envelope).unwrap();
/// let wire = envelope.frame().unwrap();
///
/// let mut received = Envelope::from_wire(&wire).unwrap();
/// let mut chat = Chat::default();
/// chat.read(&mut received).unwrap();
/// assert_eq!(chat.text, "hi");
/// ```
pub trait Message: Default + 'static {
    /// Serializes `self` into the envelope body.
    fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError>;

    /// Overwrites `self` with fields read from the envelope body.
    fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError>;

    /// Returns `self` to its blank state before it goes back to a pool.
    fn clear(&mut self) {
        *self = Self::default();
    }
}
