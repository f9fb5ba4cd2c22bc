//! # peerwire
//!
//! Poll-driven client/server messaging over a length-prefixed binary
//! protocol.
//!
//! Application messages implement [`Message`], get a numeric id in a
//! [`RegistrationTable`], and are exchanged by a [`Client`] and a
//! [`Server`]. Both peers are single-threaded: nothing happens until the
//! host calls [`Peer::tick`], and every handler runs inside that call.
//!
//! ```text
//! Peer (client/server)  →  Broker (registry, pools, handlers)
//!         ↓                         ↓
//! Session (connections, ids) →  Protocol (envelope codec, Message trait)
//!         ↓
//! Transport (stream sockets)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerwire::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Ping {
//!     value: i32,
//! }
//!
//! impl Message for Ping {
//!     fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
//!         envelope.write_int(self.value);
//!         Ok(())
//!     }
//!
//!     fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
//!         self.value = envelope.read_int()?;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), PeerError> {
//! let table = RegistrationTable::new().register::<Ping>(1)?;
//!
//! let mut server = Server::new(table.clone(), PeerConfig::default());
//! server.start()?;
//! server.subscribe_from(|from: ConnectionId, ping: &Ping| {
//!     println!("{from} sent {}", ping.value);
//! })?;
//!
//! let mut client = Client::new(table, PeerConfig::default());
//! client.connect()?;
//! client.send_message(Ping { value: 7 })?;
//!
//! loop {
//!     client.tick();
//!     server.tick();
//! }
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `memory`: re-exports the in-process transport from
//!   `peerwire-transport`, for simulations and tests.

mod client;
mod config;
mod error;
mod peer;
mod server;

pub use client::Client;
pub use config::PeerConfig;
pub use error::PeerError;
pub use peer::Peer;
pub use server::Server;

pub use peerwire_broker::{
    BrokerError, HandlerOutcome, MessageRegistry, RegistrationTable, Subscription, Subscriptions,
};
pub use peerwire_protocol::{Envelope, Kind, Message, MessageId, ProtocolError};
pub use peerwire_session::SessionError;
#[cfg(feature = "memory")]
pub use peerwire_transport::{MemoryListener, MemorySocket, MemoryTransport};
pub use peerwire_transport::{ConnectionId, TcpTransport, Transport, TransportError};

/// Installs a `tracing` subscriber that prints to stderr, filtered by
/// `RUST_LOG` and defaulting to `info`.
///
/// The library itself never installs a subscriber. Calling this more
/// than once, or after another subscriber was installed, does nothing.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Everything an application needs in one import.
///
/// ```rust
/// use peerwire::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Client, ConnectionId, Envelope, Message, Peer, PeerConfig, PeerError, ProtocolError,
        RegistrationTable, Server, Subscription,
    };
}
