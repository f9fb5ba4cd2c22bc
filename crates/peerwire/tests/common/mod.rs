//! Message types and helpers shared by the peer integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use peerwire::prelude::*;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Ping {
    pub value: i32,
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

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Pong {
    pub value: i32,
    pub note: String,
}

impl Message for Pong {
    fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        envelope.write_int(self.value);
        envelope.write_string(&self.note)
    }

    fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        self.value = envelope.read_int()?;
        self.note = envelope.read_string()?;
        Ok(())
    }
}

/// Shares Ping's id but writes a body Ping cannot parse.
#[derive(Debug, Default)]
pub struct MalformedPing;

impl Message for MalformedPing {
    fn write(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        envelope.write_bool(true);
        Ok(())
    }

    fn read(&mut self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        envelope.read_bool()?;
        Ok(())
    }
}

/// Registered on clients only; servers have no broker for it.
#[derive(Debug, Default)]
pub struct Stray;

impl Message for Stray {
    fn write(&self, _: &mut Envelope) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read(&mut self, _: &mut Envelope) -> Result<(), ProtocolError> {
        Ok(())
    }
}

pub const PING_ID: u16 = 1;
pub const PONG_ID: u16 = 2;
pub const STRAY_ID: u16 = 99;

pub fn table() -> RegistrationTable {
    RegistrationTable::new()
        .register::<Ping>(PING_ID)
        .unwrap()
        .register::<Pong>(PONG_ID)
        .unwrap()
        .register::<Stray>(STRAY_ID)
        .unwrap()
}

/// A shared log that handlers push into.
pub fn recorder<T>() -> Rc<RefCell<Vec<T>>> {
    Rc::new(RefCell::new(Vec::new()))
}
