//! Client/server scenarios over real TCP loopback sockets.

mod common;

use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{Ping, Pong, recorder, table};
use peerwire::prelude::*;

/// Ticks both peers until `done` holds, failing after five seconds.
fn pump_until(server: &mut Server, clients: &mut [&mut Client], mut done: impl FnMut(&Server) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        server.tick();
        for client in clients.iter_mut() {
            client.tick();
        }
        if done(server) {
            return;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn start_server() -> Server {
    let mut server = Server::new(table(), PeerConfig::default().with_port(0));
    server.start().expect("start");
    server
}

fn connect_to(server: &Server) -> Client {
    let port = server.local_addr().expect("bound").port();
    let mut client = Client::new(table(), PeerConfig::default().with_port(port));
    client.connect().expect("connect");
    client
}

#[test]
fn test_tcp_ping_pong_end_to_end() {
    let mut server = start_server();
    let mut client = connect_to(&server);

    let pings = recorder();
    let p = Rc::clone(&pings);
    server
        .subscribe_from(move |from: ConnectionId, m: &Ping| p.borrow_mut().push((from, m.value)))
        .unwrap();
    let pongs = recorder();
    let p = Rc::clone(&pongs);
    client.subscribe(move |m: &Pong| p.borrow_mut().push(m.value)).unwrap();

    client.send_message(Ping { value: 7 }).unwrap();
    let seen = Rc::clone(&pings);
    pump_until(&mut server, &mut [&mut client], |_| !seen.borrow().is_empty());

    let (from, value) = pings.borrow()[0];
    assert_eq!(value, 7);
    assert_eq!(from, ConnectionId::new(1));

    server
        .send_message_to(
            Pong {
                value: 7,
                note: "back".into(),
            },
            from,
        )
        .unwrap();
    let seen = Rc::clone(&pongs);
    pump_until(&mut server, &mut [&mut client], |_| !seen.borrow().is_empty());
    assert_eq!(*pongs.borrow(), vec![7]);
}

#[test]
fn test_tcp_disconnect_notifies_once_and_frees_id() {
    let mut server = start_server();
    let down = recorder();
    let d = Rc::clone(&down);
    server.on_client_disconnected(move |id| d.borrow_mut().push(id));

    let mut a = connect_to(&server);
    pump_until(&mut server, &mut [&mut a], |s| s.connection_count() == 1);
    let mut b = connect_to(&server);
    pump_until(&mut server, &mut [&mut a, &mut b], |s| s.connection_count() == 2);

    a.disconnect();
    let seen = Rc::clone(&down);
    pump_until(&mut server, &mut [&mut b], |_| !seen.borrow().is_empty());
    // A few more ticks must not repeat the notification.
    for _ in 0..5 {
        server.tick();
    }
    assert_eq!(*down.borrow(), vec![ConnectionId::new(1)]);

    let mut c = connect_to(&server);
    pump_until(&mut server, &mut [&mut b, &mut c], |s| s.connection_count() == 2);
    assert_eq!(
        server.connection_ids(),
        vec![ConnectionId::new(1), ConnectionId::new(2)]
    );
}

#[test]
fn test_tcp_large_message_crosses_partial_reads() {
    let mut server = start_server();
    let mut client = connect_to(&server);

    let got = recorder();
    let g = Rc::clone(&got);
    client.subscribe(move |m: &Pong| g.borrow_mut().push(m.note.len())).unwrap();
    pump_until(&mut server, &mut [&mut client], |s| s.connection_count() == 1);

    // Larger than one socket read, smaller than the frame limit.
    let note = "x".repeat(200 * 1024);
    server
        .send_message(Pong {
            value: 1,
            note: note.clone(),
        })
        .unwrap();
    let seen = Rc::clone(&got);
    pump_until(&mut server, &mut [&mut client], |_| !seen.borrow().is_empty());
    assert_eq!(*got.borrow(), vec![note.len()]);
}

#[test]
fn test_tcp_stop_disconnects_clients() {
    let mut server = start_server();
    let mut client = connect_to(&server);
    pump_until(&mut server, &mut [&mut client], |s| s.connection_count() == 1);

    server.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.is_connected() {
        client.tick();
        assert!(Instant::now() < deadline, "client never saw the stop");
        std::thread::sleep(Duration::from_millis(1));
    }
}
