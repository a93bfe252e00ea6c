//! Protocol driver tables.
//!
//! A driver is a name plus a table of handlers sorted by operation type;
//! dispatch binary-searches it. Three handler shapes exist: a real
//! callback, an empty acknowledgement, and a known-but-unsupported slot
//! that answers PROTOCOL_BAD on the wire.

use std::sync::Arc;

use greybus::message::OP_RESPONSE;
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::engine::Operation;

/// Handler for one operation type.
pub type HandlerFn = fn(&Arc<Core>, &mut Operation) -> Result<()>;

pub enum Callback {
    /// Run this function.
    Handler(HandlerFn),
    /// Acknowledge with an empty success response.
    Empty,
    /// Recognized operation the bridge does not implement.
    Unsupported,
}

pub struct OperationHandler {
    pub id: u8,
    pub callback: Callback,
}

/// A protocol driver. `operations` must be strictly increasing by id;
/// [`Core::register_driver`](crate::bridge::Core::register_driver)
/// enforces this.
pub struct Driver {
    pub name: &'static str,
    pub operations: &'static [OperationHandler],
}

pub const fn request(id: u8, handler: HandlerFn) -> OperationHandler {
    OperationHandler {
        id,
        callback: Callback::Handler(handler),
    }
}

pub const fn request_empty(id: u8) -> OperationHandler {
    OperationHandler {
        id,
        callback: Callback::Empty,
    }
}

pub const fn request_unsupported(id: u8) -> OperationHandler {
    OperationHandler {
        id,
        callback: Callback::Unsupported,
    }
}

pub const fn response(id: u8, handler: HandlerFn) -> OperationHandler {
    OperationHandler {
        id: id | OP_RESPONSE,
        callback: Callback::Handler(handler),
    }
}

pub const fn response_empty(id: u8) -> OperationHandler {
    OperationHandler {
        id: id | OP_RESPONSE,
        callback: Callback::Empty,
    }
}

impl Driver {
    /// Look up the handler for operation type `id`.
    pub fn handler(&self, id: u8) -> Option<&OperationHandler> {
        self.operations
            .binary_search_by_key(&id, |op| op.id)
            .ok()
            .map(|idx| &self.operations[idx])
    }

    /// Check that the operation table is strictly increasing by id.
    pub fn validate(&self) -> Result<()> {
        for pair in self.operations.windows(2) {
            if pair[1].id <= pair[0].id {
                log::error!(
                    "{} driver: operations not sorted by id around {:#04x}",
                    self.name,
                    pair[1].id
                );
                return Err(Error::Invalid);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_core: &Arc<Core>, _op: &mut Operation) -> Result<()> {
        Ok(())
    }

    #[test]
    fn sorted_table_validates() {
        static DRIVER: Driver = Driver {
            name: "test",
            operations: &[request(0x01, nop), request_empty(0x02), response(0x01, nop)],
        };
        assert!(DRIVER.validate().is_ok());
        assert!(DRIVER.handler(0x02).is_some());
        assert!(DRIVER.handler(0x81).is_some());
        assert!(DRIVER.handler(0x03).is_none());
    }

    #[test]
    fn unsorted_and_duplicate_tables_fail() {
        static UNSORTED: Driver = Driver {
            name: "unsorted",
            operations: &[request(0x02, nop), request(0x01, nop)],
        };
        assert!(matches!(UNSORTED.validate(), Err(Error::Invalid)));

        static DUPLICATE: Driver = Driver {
            name: "duplicate",
            operations: &[request(0x01, nop), request_empty(0x01)],
        };
        assert!(matches!(DUPLICATE.validate(), Err(Error::Invalid)));
    }
}
