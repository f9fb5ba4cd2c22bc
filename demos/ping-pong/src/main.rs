use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use peerwire::prelude::*;
use tracing::info;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Ping {
    value: i32,
}

impl Message for Ping {
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
struct Pong {
    value: i32,
    greeting: String,
}

impl Message for Pong {
    fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        envelope.write_int(self.value);
        envelope.write_string(&self.greeting)
    }

    fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        self.value = envelope.read_int()?;
        self.greeting = envelope.read_string()?;
        Ok(())
    }
}

fn registrations() -> Result<RegistrationTable, PeerError> {
    Ok(RegistrationTable::new()
        .register::<Ping>(1)?
        .register::<Pong>(2)?)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Reads a JSON `PeerConfig` from the file named by `PEERWIRE_CONFIG`,
/// or falls back to the defaults.
fn load_config() -> Result<PeerConfig, Box<dyn std::error::Error>> {
    match std::env::var("PEERWIRE_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)?;
            let config: PeerConfig = serde_json::from_str(&text)?;
            info!(%path, "loaded config");
            Ok(config)
        }
        Err(_) => Ok(PeerConfig::default()),
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// Runs a server and a client in one thread until the client has seen
/// `rounds` pongs. Returns the pong values in arrival order.
async fn exchange(config: PeerConfig, rounds: i32) -> Result<Vec<i32>, PeerError> {
    let table = registrations()?;

    let mut server = Server::new(table.clone(), config.clone());
    server.start()?;
    let port = server.local_addr().map_or(config.port, |addr| addr.port());

    // Handlers cannot reach the server, so replies are queued and sent
    // from the loop below.
    let replies: Rc<RefCell<Vec<(ConnectionId, i32)>>> = Rc::default();
    let queue = Rc::clone(&replies);
    server.subscribe_from(move |from: ConnectionId, ping: &Ping| {
        info!(%from, value = ping.value, "server got ping");
        queue.borrow_mut().push((from, ping.value));
    })?;
    server.on_client_connected(|id| info!(%id, "client joined"));
    server.on_client_disconnected(|id| info!(%id, "client left"));

    let mut client = Client::new(table, config.with_port(port));
    client.connect()?;

    let pongs: Rc<RefCell<Vec<i32>>> = Rc::default();
    let seen = Rc::clone(&pongs);
    client.subscribe(move |pong: &Pong| {
        info!(value = pong.value, greeting = %pong.greeting, "client got pong");
        seen.borrow_mut().push(pong.value);
    })?;

    let mut next = 1;
    let mut interval = tokio::time::interval(Duration::from_millis(5));
    while pongs.borrow().len() < rounds as usize {
        interval.tick().await;

        // One ping in flight at a time.
        if next <= rounds && pongs.borrow().len() == (next - 1) as usize {
            let mut ping = client.get_message::<Ping>()?;
            ping.value = next;
            client.send_message(ping)?;
            next += 1;
        }

        server.tick();
        let pending: Vec<_> = replies.borrow_mut().drain(..).collect();
        for (to, value) in pending {
            let mut pong = server.get_message::<Pong>()?;
            pong.value = value;
            pong.greeting = format!("pong #{value}");
            server.send_message_to(pong, to)?;
        }
        client.tick();
    }

    client.disconnect();
    server.tick();
    server.stop();

    let values = pongs.borrow().clone();
    Ok(values)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    peerwire::init_tracing();

    let config = load_config()?;
    info!(endpoint = %config.endpoint(), "starting ping-pong");

    let values = exchange(config, 5).await?;
    info!(?values, "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_completes_all_rounds_in_order() {
        let config = PeerConfig::default().with_port(0);
        let values = exchange(config, 3).await.unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_registrations_bind_distinct_ids() {
        let table = registrations().unwrap();
        assert_eq!(table.resolve::<Ping>().unwrap().0, 1);
        assert_eq!(table.resolve::<Pong>().unwrap().0, 2);
    }
}
