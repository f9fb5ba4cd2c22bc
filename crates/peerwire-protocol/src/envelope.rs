//! The envelope: one framed unit of wire data.
//!
//! ```text
//! [u32 total_len][i32 kind][i32 message_id, Message kind only][body ...]
//! ```
//!
//! All integers are little-endian. `total_len` counts every byte after
//! itself. The body is a flat sequence of fields written through the
//! `write_*` methods and read back, in the same order, through the
//! `read_*` / `peek_*` methods.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// Width of the `total_len` prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Width of the `kind` and `message_id` header fields.
const HEADER_FIELD_LEN: usize = 4;

/// Width of a bool field.
const BOOL_LEN: usize = 1;

/// Width of float and int fields, and of a string's length prefix.
const WORD_LEN: usize = 4;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// An application message; the header carries its id.
    Message,
    /// The sender is closing the connection. No id, empty body.
    Disconnect,
}

impl Kind {
    /// The discriminant written on the wire.
    pub fn to_wire(self) -> i32 {
        match self {
            Self::Message => 0,
            Self::Disconnect => 1,
        }
    }

    /// Parses a wire discriminant.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Framing`] for unknown discriminants.
    pub fn from_wire(value: i32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Message),
            1 => Ok(Self::Disconnect),
            other => Err(ProtocolError::Framing(format!(
                "unknown envelope kind {other}"
            ))),
        }
    }
}

/// The numeric id a message type is registered under.
///
/// Ids are 16-bit on the API side and travel as an `i32` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u16);

impl MessageId {
    /// Parses a wire message id.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Framing`] if `value` does not fit a `u16`.
    pub fn from_wire(value: i32) -> Result<Self, ProtocolError> {
        u16::try_from(value).map(Self).map_err(|_| {
            ProtocolError::Framing(format!("message id {value} out of range"))
        })
    }

    /// The value written on the wire.
    pub fn to_wire(self) -> i32 {
        i32::from(self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M-{}", self.0)
    }
}

/// A framed message: header fields plus a body with a read cursor.
///
/// Envelopes built with [`Envelope::message`] are written append-only;
/// envelopes produced by [`Envelope::decode`] start with the cursor at
/// the first body byte.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: Kind,
    message_id: Option<MessageId>,
    body: BytesMut,
    cursor: usize,
}

impl Envelope {
    /// Creates an empty `Message` envelope for `id`.
    pub fn message(id: MessageId) -> Self {
        Self {
            kind: Kind::Message,
            message_id: Some(id),
            body: BytesMut::new(),
            cursor: 0,
        }
    }

    /// Creates the body-less `Disconnect` envelope.
    pub fn disconnect() -> Self {
        Self {
            kind: Kind::Disconnect,
            message_id: None,
            body: BytesMut::new(),
            cursor: 0,
        }
    }

    /// The envelope kind.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The message id; `None` for `Disconnect` envelopes.
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    /// The serialized body fields.
    pub fn to_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Bytes left between the cursor and the end of the body.
    pub fn remaining(&self) -> usize {
        self.body.len() - self.cursor
    }

    /// Clears the body and rewinds the cursor, keeping kind and id.
    pub fn reset(&mut self) {
        self.body.clear();
        self.cursor = 0;
    }

    // -- Writing ----------------------------------------------------------

    /// Appends a bool as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.body.put_u8(u8::from(value));
    }

    /// Appends an IEEE-754 single.
    pub fn write_float(&mut self, value: f32) {
        self.body.put_f32_le(value);
    }

    /// Appends a signed 32-bit integer.
    pub fn write_int(&mut self, value: i32) {
        self.body.put_i32_le(value);
    }

    /// Appends a string as `[i32 byte_len][utf-8 bytes]`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FrameTooLarge`] if the string is longer
    /// than an `i32` length prefix can express.
    pub fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        let len = i32::try_from(value.len()).map_err(|_| {
            ProtocolError::FrameTooLarge {
                len: value.len(),
                max: i32::MAX as usize,
            }
        })?;
        self.body.put_i32_le(len);
        self.body.put_slice(value.as_bytes());
        Ok(())
    }

    // -- Reading ----------------------------------------------------------

    /// Reads a bool and advances the cursor. Any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        let value = self.peek_bool()?;
        self.cursor += BOOL_LEN;
        Ok(value)
    }

    /// Reads a bool without moving the cursor.
    pub fn peek_bool(&self) -> Result<bool, ProtocolError> {
        Ok(self.field(BOOL_LEN)?.get_u8() != 0)
    }

    /// Reads a float and advances the cursor.
    pub fn read_float(&mut self) -> Result<f32, ProtocolError> {
        let value = self.peek_float()?;
        self.cursor += WORD_LEN;
        Ok(value)
    }

    /// Reads a float without moving the cursor.
    pub fn peek_float(&self) -> Result<f32, ProtocolError> {
        Ok(self.field(WORD_LEN)?.get_f32_le())
    }

    /// Reads an int and advances the cursor.
    pub fn read_int(&mut self) -> Result<i32, ProtocolError> {
        let value = self.peek_int()?;
        self.cursor += WORD_LEN;
        Ok(value)
    }

    /// Reads an int without moving the cursor.
    pub fn peek_int(&self) -> Result<i32, ProtocolError> {
        Ok(self.field(WORD_LEN)?.get_i32_le())
    }

    /// Reads a string and advances the cursor past its length prefix
    /// and all of its bytes, including when the string is empty.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let (value, consumed) = self.string_at_cursor()?;
        self.cursor += consumed;
        Ok(value)
    }

    /// Reads a string without moving the cursor.
    pub fn peek_string(&self) -> Result<String, ProtocolError> {
        self.string_at_cursor().map(|(value, _)| value)
    }

    /// Decodes the string at the cursor, returning it together with the
    /// number of body bytes it occupies.
    fn string_at_cursor(&self) -> Result<(String, usize), ProtocolError> {
        let len = self.peek_int()?;
        let len = usize::try_from(len).map_err(|_| {
            ProtocolError::Framing(format!("negative string length {len}"))
        })?;
        let field = self.field(WORD_LEN + len)?;
        let text = std::str::from_utf8(&field[WORD_LEN..])?;
        Ok((text.to_owned(), WORD_LEN + len))
    }

    /// Returns the next `width` body bytes, or a cursor overrun.
    fn field(&self, width: usize) -> Result<&[u8], ProtocolError> {
        let remaining = self.remaining();
        if width > remaining {
            return Err(ProtocolError::CursorOverrun {
                needed: width,
                remaining,
            });
        }
        Ok(&self.body[self.cursor..self.cursor + width])
    }

    // -- Framing ----------------------------------------------------------

    /// Bytes taken by `kind` and, for messages, the id.
    pub fn header_len(&self) -> usize {
        match self.kind {
            Kind::Message => 2 * HEADER_FIELD_LEN,
            Kind::Disconnect => HEADER_FIELD_LEN,
        }
    }

    /// The value of the `total_len` prefix for this envelope.
    pub fn frame_len(&self) -> usize {
        self.header_len() + self.body.len()
    }

    /// Appends the complete wire form to `dst`. Calling it twice
    /// appends two identical frames; the envelope itself is unchanged.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FrameTooLarge`] if the frame does not fit
    /// the 32-bit length prefix.
    pub fn frame_into(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.frame_len();
        let prefix = u32::try_from(len).map_err(|_| {
            ProtocolError::FrameTooLarge {
                len,
                max: u32::MAX as usize,
            }
        })?;

        dst.reserve(LENGTH_PREFIX_LEN + len);
        dst.put_u32_le(prefix);
        dst.put_i32_le(self.kind.to_wire());
        if let Some(id) = self.message_id {
            dst.put_i32_le(id.to_wire());
        }
        dst.put_slice(&self.body);
        Ok(())
    }

    /// Returns the complete wire form as a new buffer.
    pub fn frame(&self) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + self.frame_len());
        self.frame_into(&mut out)?;
        Ok(out.freeze())
    }

    /// Decodes a frame whose length prefix was already consumed:
    /// `payload` is exactly the `total_len` bytes that followed it.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Framing`] if the header is truncated or
    /// malformed, or if a `Disconnect` envelope carries a body.
    pub fn decode(mut payload: BytesMut) -> Result<Self, ProtocolError> {
        if payload.len() < HEADER_FIELD_LEN {
            return Err(ProtocolError::Framing(format!(
                "frame of {} bytes has no room for a kind",
                payload.len()
            )));
        }
        let kind = Kind::from_wire(payload.get_i32_le())?;

        let message_id = match kind {
            Kind::Message => {
                if payload.len() < HEADER_FIELD_LEN {
                    return Err(ProtocolError::Framing(
                        "message frame has no room for an id".into(),
                    ));
                }
                Some(MessageId::from_wire(payload.get_i32_le())?)
            }
            Kind::Disconnect => {
                if !payload.is_empty() {
                    return Err(ProtocolError::Framing(format!(
                        "disconnect frame carries {} body bytes",
                        payload.len()
                    )));
                }
                None
            }
        };

        Ok(Self {
            kind,
            message_id,
            body: payload,
            cursor: 0,
        })
    }

    /// Decodes one complete frame, length prefix included.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Framing`] if `wire` is not exactly one
    /// frame, plus anything [`decode`](Self::decode) rejects.
    pub fn from_wire(wire: &[u8]) -> Result<Self, ProtocolError> {
        if wire.len() < LENGTH_PREFIX_LEN {
            return Err(ProtocolError::Framing(
                "missing length prefix".into(),
            ));
        }
        let mut prefix = &wire[..LENGTH_PREFIX_LEN];
        let declared = prefix.get_u32_le() as usize;
        let payload = &wire[LENGTH_PREFIX_LEN..];
        if declared != payload.len() {
            return Err(ProtocolError::Framing(format!(
                "length prefix says {declared} bytes, frame has {}",
                payload.len()
            )));
        }
        Self::decode(BytesMut::from(payload))
    }
}
