//! Registry-level dispatch behaviour through the public API.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use peerwire_broker::{BrokerError, Delivery, MessageRegistry, RegistrationTable, Subscription};
use peerwire_protocol::{Envelope, Message, ProtocolError};
use peerwire_transport::ConnectionId;

#[derive(Debug, Default, Clone, PartialEq)]
struct Chat {
    from: String,
    text: String,
    urgent: bool,
}

impl Message for Chat {
    fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        envelope.write_string(&self.from)?;
        envelope.write_string(&self.text)?;
        envelope.write_bool(self.urgent);
        Ok(())
    }

    fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        self.from = envelope.read_string()?;
        self.text = envelope.read_string()?;
        self.urgent = envelope.read_bool()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Position {
    x: f32,
    y: f32,
}

impl Message for Position {
    fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        envelope.write_float(self.x);
        envelope.write_float(self.y);
        Ok(())
    }

    fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        self.x = envelope.read_float()?;
        self.y = envelope.read_float()?;
        Ok(())
    }
}

fn registry() -> MessageRegistry {
    let table = RegistrationTable::new()
        .register::<Chat>(10)
        .unwrap()
        .register::<Position>(11)
        .unwrap();
    MessageRegistry::new(table)
}

/// Encodes through the broker and decodes as a receiver would.
fn over_the_wire(registry: &mut MessageRegistry, chat: &Chat) -> Envelope {
    let envelope = registry.broker::<Chat>().unwrap().encode(chat).unwrap();
    Envelope::from_wire(&envelope.frame().unwrap()).unwrap()
}

#[test]
fn test_resolve_id_is_stable_and_distinct() {
    let r = registry();
    let chat = r.resolve_id::<Chat>().unwrap();
    assert_eq!(chat, r.resolve_id::<Chat>().unwrap());
    assert_ne!(chat, r.resolve_id::<Position>().unwrap());
}

#[test]
fn test_dispatch_delivers_decoded_message_to_right_type_only() {
    let mut r = registry();
    let chats = Rc::new(RefCell::new(Vec::new()));
    let positions = Rc::new(Cell::new(0));

    let c = Rc::clone(&chats);
    let _ = r
        .subscriptions::<Chat>()
        .unwrap()
        .subscribe(move |m: &Chat| c.borrow_mut().push(m.clone()));
    let p = Rc::clone(&positions);
    let _ = r
        .subscriptions::<Position>()
        .unwrap()
        .subscribe(move |_: &Position| p.set(p.get() + 1));

    let sent = Chat {
        from: "ann".into(),
        text: "".into(),
        urgent: true,
    };
    let mut envelope = over_the_wire(&mut r, &sent);
    assert_eq!(
        r.dispatch(ConnectionId::new(4), &mut envelope).unwrap(),
        Delivery::Dispatched { failures: 0 }
    );

    assert_eq!(*chats.borrow(), vec![sent]);
    assert_eq!(positions.get(), 0);
}

#[test]
fn test_dispatch_counts_failed_handlers_and_keeps_going() {
    let mut r = registry();
    let reached = Rc::new(Cell::new(false));
    let subs = r.subscriptions::<Chat>().unwrap();

    let _ = subs.subscribe(|m: &Chat| {
        if m.urgent {
            Err(format!("cannot handle urgent message from {}", m.from))
        } else {
            Ok(())
        }
    });
    let seen = Rc::clone(&reached);
    let _ = subs.subscribe_from(move |_: ConnectionId, _: &Chat| seen.set(true));

    let mut envelope = over_the_wire(
        &mut r,
        &Chat {
            from: "bob".into(),
            text: "now".into(),
            urgent: true,
        },
    );
    assert_eq!(
        r.dispatch(ConnectionId::new(1), &mut envelope).unwrap(),
        Delivery::Dispatched { failures: 1 }
    );
    assert!(reached.get());
}

#[test]
fn test_reentrant_unsubscribe_through_registry_handle() {
    let mut r = registry();
    let subs = r.subscriptions::<Chat>().unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let victim: Rc<Cell<Option<Subscription>>> = Rc::new(Cell::new(None));

    let l = Rc::clone(&log);
    let v = Rc::clone(&victim);
    let remover = subs.clone();
    let _ = subs.subscribe(move |_: &Chat| {
        l.borrow_mut().push("remover");
        if let Some(sub) = v.take() {
            remover.unsubscribe(sub);
        }
    });
    let l = Rc::clone(&log);
    victim.set(Some(subs.subscribe(move |_: &Chat| l.borrow_mut().push("victim"))));

    let chat = Chat::default();
    let mut first = over_the_wire(&mut r, &chat);
    r.dispatch(ConnectionId::SERVER, &mut first).unwrap();
    let mut second = over_the_wire(&mut r, &chat);
    r.dispatch(ConnectionId::SERVER, &mut second).unwrap();

    assert_eq!(*log.borrow(), vec!["remover", "victim", "remover"]);
}

#[test]
fn test_dispatch_truncated_body_is_decode_error() {
    let mut r = registry();
    let _ = r.subscriptions::<Position>().unwrap();

    let mut short = Envelope::message(r.resolve_id::<Position>().unwrap());
    short.write_float(1.0);
    let mut envelope = Envelope::from_wire(&short.frame().unwrap()).unwrap();

    let err = r.dispatch(ConnectionId::new(1), &mut envelope).unwrap_err();
    assert!(matches!(err, BrokerError::Decode { .. }));
}
