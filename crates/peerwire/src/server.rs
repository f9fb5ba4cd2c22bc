//! The server role: a listener and a table of client connections.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use peerwire_broker::{MessageRegistry, RegistrationTable};
use peerwire_protocol::Message;
use peerwire_session::ConnectionTable;
use peerwire_transport::{ConnectionId, Listener, StreamSocket, TcpTransport, Transport};
use tracing::{debug, error, info, warn};

use crate::peer::{pump, send_pooled};
use crate::{Peer, PeerConfig, PeerError};

type Notify = Box<dyn FnMut(ConnectionId)>;

/// A poll-driven server.
///
/// Each accepted client gets a small integer id. Ids of closed
/// connections are reused, lowest first, so a handler that keys state
/// by id must drop that state on [`on_client_disconnected`].
///
/// [`on_client_disconnected`]: Self::on_client_disconnected
pub struct Server<T: Transport = TcpTransport> {
    transport: T,
    config: PeerConfig,
    registry: MessageRegistry,
    listener: Option<T::Listener>,
    connections: ConnectionTable<T::Socket>,
    /// Filled by each connection's closed callback, emptied by `reap`.
    closed: Rc<RefCell<Vec<ConnectionId>>>,
    on_client_connected: Vec<Notify>,
    on_client_disconnected: Vec<Notify>,
}

impl Server<TcpTransport> {
    /// Creates a TCP server. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(table: RegistrationTable, config: PeerConfig) -> Self {
        let config = config.validated();
        let transport = config.tcp_transport();
        Self::with_transport(table, config, transport)
    }
}

impl<T: Transport> Server<T> {
    /// Creates a server over any transport.
    pub fn with_transport(table: RegistrationTable, config: PeerConfig, transport: T) -> Self {
        Self {
            transport,
            config: config.validated(),
            registry: MessageRegistry::new(table),
            listener: None,
            connections: ConnectionTable::new(),
            closed: Rc::new(RefCell::new(Vec::new())),
            on_client_connected: Vec::new(),
            on_client_disconnected: Vec::new(),
        }
    }

    /// The configuration in use, after validation.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    // -- Lifecycle --------------------------------------------------------

    /// Binds the configured endpoint. A running server is stopped
    /// first.
    ///
    /// # Errors
    /// Returns [`PeerError::Transport`] if binding fails.
    pub fn start(&mut self) -> Result<(), PeerError> {
        if self.is_running() {
            self.stop();
        }

        let endpoint = self.config.endpoint();
        let listener = self.transport.bind(&endpoint)?;
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "server started"),
            Err(_) => info!(%endpoint, "server started"),
        }
        self.listener = Some(listener);
        Ok(())
    }

    /// Closes every connection with a `Disconnect` notice, firing the
    /// disconnect callbacks for each, and unbinds. Id allocation starts
    /// over at `1`.
    pub fn stop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        let mut ids = Vec::new();
        for mut connection in self.connections.drain() {
            ids.push(connection.id());
            connection.close();
        }
        // The closed callbacks queued these; they are handled here.
        self.closed.borrow_mut().clear();
        for id in ids {
            self.notify_disconnected(id);
        }

        drop(listener);
        info!("server stopped");
    }

    /// `true` between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    // -- Connections ------------------------------------------------------

    /// Ids of every live connection, ascending.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.ids()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The remote address of a connection.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(id).and_then(|c| c.peer_addr())
    }

    /// Closes one connection with a `Disconnect` notice. Returns `false`
    /// if no such connection exists.
    pub fn close_connection(&mut self, id: ConnectionId) -> bool {
        let Some(connection) = self.connections.get_mut(id) else {
            return false;
        };
        connection.close();
        self.reap();
        true
    }

    /// Runs `callback` with the id of each newly accepted client.
    pub fn on_client_connected(&mut self, callback: impl FnMut(ConnectionId) + 'static) {
        self.on_client_connected.push(Box::new(callback));
    }

    /// Runs `callback` once with the id of each client that goes away,
    /// whichever side ended the connection.
    pub fn on_client_disconnected(&mut self, callback: impl FnMut(ConnectionId) + 'static) {
        self.on_client_disconnected.push(Box::new(callback));
    }

    // -- Sending ----------------------------------------------------------

    /// Sends `message` to one client and returns it to its pool.
    ///
    /// An unknown id drops the message with a log line.
    ///
    /// # Errors
    /// Returns [`PeerError::Broker`] if `M` is not registered or cannot
    /// be encoded.
    pub fn send_message_to<M: Message>(
        &mut self,
        message: M,
        id: ConnectionId,
    ) -> Result<(), PeerError> {
        let connections = &mut self.connections;
        let sent = send_pooled(&mut self.registry, message, |wire| {
            match connections.get_mut(id) {
                Some(connection) if connection.is_open() => {
                    if let Err(e) = connection.send_framed(wire) {
                        warn!(connection_id = %id, error = %e, "send failed, message dropped");
                    }
                }
                _ => debug!(connection_id = %id, "no such connection, message dropped"),
            }
        });

        self.reap();
        sent
    }

    /// Sends a blank `M` to one client.
    pub fn send_default_to<M: Message>(&mut self, id: ConnectionId) -> Result<(), PeerError> {
        let message = self.get_message::<M>()?;
        self.send_message_to(message, id)
    }

    // -- Internals --------------------------------------------------------

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };

        let mut accepted = Vec::new();
        loop {
            let (mut socket, addr) = match listener.accept() {
                Ok(Some(pending)) => pending,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            };

            if self.connections.len() >= self.config.max_connections {
                warn!(%addr, limit = self.config.max_connections, "connection limit reached, refusing");
                if let Err(e) = socket.shutdown() {
                    debug!(%addr, error = %e, "shutdown of refused socket failed");
                }
                continue;
            }

            let connection = self.connections.open(socket, self.config.limits());
            let queue = Rc::clone(&self.closed);
            connection.set_on_closed(move |id| queue.borrow_mut().push(id));
            info!(connection_id = %connection.id(), %addr, "client connected");
            accepted.push(connection.id());
        }

        for id in accepted {
            for callback in &mut self.on_client_connected {
                callback(id);
            }
        }
    }

    /// Removes closed connections, frees their ids and reports them.
    fn reap(&mut self) {
        let closed: Vec<ConnectionId> = self.closed.borrow_mut().drain(..).collect();
        for id in closed {
            if self.connections.remove(id).is_some() {
                info!(connection_id = %id, "client disconnected");
                self.notify_disconnected(id);
            }
        }
    }

    fn notify_disconnected(&mut self, id: ConnectionId) {
        for callback in &mut self.on_client_disconnected {
            callback(id);
        }
    }
}

impl<T: Transport> Peer for Server<T> {
    fn tick(&mut self) {
        if !self.is_running() {
            return;
        }

        self.accept_pending();
        for connection in self.connections.iter_mut() {
            pump(connection, &self.registry, self.config.max_frames_per_tick);
        }
        self.reap();
    }

    /// Broadcasts `message` to every connected client. The message is
    /// encoded once whatever the number of clients.
    fn send_message<M: Message>(&mut self, message: M) -> Result<(), PeerError> {
        let connections = &mut self.connections;
        let sent = send_pooled(&mut self.registry, message, |wire| {
            if connections.is_empty() {
                debug!(
                    message = std::any::type_name::<M>(),
                    "no clients connected, message dropped"
                );
            }
            for connection in connections.iter_mut() {
                if !connection.is_open() {
                    continue;
                }
                if let Err(e) = connection.send_framed(wire) {
                    warn!(connection_id = %connection.id(), error = %e, "send failed, message dropped");
                }
            }
        });

        self.reap();
        sent
    }

    fn registry_mut(&mut self) -> &mut MessageRegistry {
        &mut self.registry
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        for connection in self.connections.iter_mut() {
            connection.close();
        }
    }
}

impl<T: Transport> std::fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.config.endpoint())
            .field("running", &self.is_running())
            .field("connections", &self.connections.len())
            .field("registry", &self.registry)
            .finish()
    }
}
