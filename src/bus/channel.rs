//! Runner-side handle on one remote test worker
//!
//! Calls are asynchronous: `call` queues the frame and returns its serial,
//! the reply comes back later as a bus event. Calls made while no worker
//! holds the name are dropped.

use std::collections::HashMap;
use uuid::Uuid;

use super::protocol::{Call, Envelope, Method};
use super::server::Connection;

#[derive(Debug)]
pub struct RemoteTestChannel {
    uuid: Uuid,
    connection: Option<Connection>,
    next_serial: u64,
    pending: HashMap<u64, Method>,
}

impl RemoteTestChannel {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            connection: None,
            next_serial: 1,
            pending: HashMap::new(),
        }
    }

    pub fn attach(&mut self, connection: Connection) {
        self.connection = Some(connection);
    }

    /// Forget the worker; pending calls will never be answered
    pub fn detach(&mut self) -> Vec<Method> {
        self.connection = None;
        self.pending.drain().map(|(_, method)| method).collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Send a method call, returning its serial
    ///
    /// None when there is no live worker to receive it.
    pub fn call(&mut self, call: Call) -> Option<u64> {
        let method = call.method();
        let Some(connection) = self.connection.as_ref().filter(|c| !c.is_closed()) else {
            tracing::debug!(uuid = %self.uuid, %method, "no worker on the bus, dropping call");
            return None;
        };

        let serial = self.next_serial;
        self.next_serial += 1;
        tracing::debug!(uuid = %self.uuid, %method, serial, "calling worker");
        if !connection.send(Envelope::Call { serial, call }) {
            return None;
        }
        self.pending.insert(serial, method);
        Some(serial)
    }

    /// Match a reply with the call it answers
    pub fn take_reply(&mut self, serial: u64) -> Option<Method> {
        self.pending.remove(&serial)
    }

    pub fn is_pending(&self, method: Method) -> bool {
        self.pending.values().any(|m| *m == method)
    }
}
