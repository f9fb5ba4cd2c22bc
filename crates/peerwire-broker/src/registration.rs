//! The static table binding message types to wire ids.

use std::any::{TypeId, type_name};
use std::collections::HashMap;

use peerwire_protocol::{Message, MessageId};

use crate::BrokerError;

/// Maps each message type to the numeric id it travels under.
///
/// Built once at startup and handed to every peer. Both directions are
/// unique: an id names one type and a type holds one id.
///
/// ```
/// # use peerwire_broker::RegistrationTable;
/// # use peerwire_protocol::{Envelope, Message, MessageId, ProtocolError};
/// # #[derive(Default)] struct Ping;
/// # impl Message for Ping {
/// #     fn write(&self, _: &mut Envelope) -> Result<(), ProtocolError> { Ok(()) }
/// #     fn read(&mut self, _: &mut Envelope) -> Result<(), ProtocolError> { Ok(()) }
/// # }
/// let table = RegistrationTable::new().register::<Ping>(1)?;
/// assert_eq!(table.resolve::<Ping>()?, MessageId(1));
/// # Ok::<(), peerwire_broker::BrokerError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct RegistrationTable {
    by_type: HashMap<TypeId, (MessageId, &'static str)>,
    by_id: HashMap<MessageId, &'static str>,
}

impl RegistrationTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `T` to `id`.
    ///
    /// # Errors
    /// - [`BrokerError::DuplicateType`] if `T` is already registered.
    /// - [`BrokerError::DuplicateId`] if another type holds `id`.
    pub fn register<T: Message>(mut self, id: u16) -> Result<Self, BrokerError> {
        let id = MessageId(id);
        let name = type_name::<T>();

        if let Some(&(existing_id, _)) = self.by_type.get(&TypeId::of::<T>()) {
            return Err(BrokerError::DuplicateType {
                type_name: name,
                id: existing_id,
            });
        }
        if let Some(&existing) = self.by_id.get(&id) {
            return Err(BrokerError::DuplicateId {
                id,
                existing,
                rejected: name,
            });
        }

        self.by_type.insert(TypeId::of::<T>(), (id, name));
        self.by_id.insert(id, name);
        tracing::debug!(message_id = %id, type_name = name, "message type registered");
        Ok(self)
    }

    /// The id `T` was registered under.
    ///
    /// # Errors
    /// Returns [`BrokerError::Unregistered`] if `T` is not in the table.
    pub fn resolve<T: Message>(&self) -> Result<MessageId, BrokerError> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|&(id, _)| id)
            .ok_or(BrokerError::Unregistered {
                type_name: type_name::<T>(),
            })
    }

    /// The name of the type bound to `id`, if any.
    pub fn type_name_of(&self, id: MessageId) -> Option<&'static str> {
        self.by_id.get(&id).copied()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
