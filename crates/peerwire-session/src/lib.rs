//! Connection layer for peerwire.
//!
//! Turns a non-blocking byte stream into a sequence of [`Envelope`]s and
//! back:
//!
//! - **Connection** ([`Connection`]): frame reassembly, buffered
//!   sending, and the one-shot closed notification.
//! - **Table** ([`ConnectionTable`], [`IdPool`]): the server's map of
//!   live connections and its id allocator.
//! - **Errors** ([`SessionError`]): transport and protocol failures,
//!   both fatal to the connection that hit them.
//!
//! [`Envelope`]: peerwire_protocol::Envelope

mod connection;
mod error;
mod table;

pub use connection::{
    ClosedCallback, Connection, ConnectionLimits, DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_SEND_BUFFER,
};
pub use error::SessionError;
pub use table::{ConnectionTable, IdPool};
