//! Runner side of the private bus
//!
//! The server owns the listener of one test run. Each accepted connection
//! gets a reader task forwarding frames into the run's event loop and a
//! writer task draining an outgoing queue. A connection becomes visible to
//! tests only once it claims a name in the test namespace; its end of
//! stream is reported as that name vanishing.

use std::collections::HashMap;
use std::io;

use interprocess::local_socket::traits::tokio::Listener as ListenerTrait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::protocol::{self, CallOutcome, Envelope, Signal};
use super::transport::{self, Listener, Stream};
use crate::common::{paths, Error, RemoteError, Result};
use crate::run::engine::{LoopEvent, LoopHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Sending side of one bus connection
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outgoing: mpsc::UnboundedSender<Envelope>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame; false once the connection is gone
    pub fn send(&self, envelope: Envelope) -> bool {
        self.outgoing.send(envelope).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn test_pair(id: u64) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId(id),
                outgoing,
            },
            rx,
        )
    }
}

/// Raw traffic forwarded from connection tasks into the event loop
#[derive(Debug)]
pub enum BusInput {
    Frame(ConnectionId, Envelope),
    Closed(ConnectionId),
}

/// Bus happenings routed to the test owning the connection
#[derive(Debug, Clone)]
pub enum BusEvent {
    NameAppeared(Connection),
    NameVanished,
    Reply { serial: u64, outcome: CallOutcome },
    Signal(Signal),
}

struct ConnectionState {
    connection: Connection,
    owner: Option<Uuid>,
    tasks: [AbortHandle; 2],
}

pub struct BusServer {
    address: String,
    listener: Listener,
    handle: LoopHandle,
    connections: HashMap<ConnectionId, ConnectionState>,
    next_id: u64,
}

impl BusServer {
    pub(crate) fn bind(handle: LoopHandle) -> Result<Self> {
        let address = paths::new_bus_address();
        let listener = transport::create_listener(&address).map_err(|source| Error::BusSetup {
            address: address.clone(),
            source,
        })?;
        tracing::debug!(address = %address, "private bus listening");

        Ok(Self {
            address,
            listener,
            handle,
            connections: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub async fn accept(&self) -> io::Result<Stream> {
        self.listener.accept().await
    }

    /// Start serving an accepted connection
    pub fn attach(&mut self, stream: Stream) {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Envelope>();

        let handle = self.handle.clone();
        let read_task = tokio::spawn(async move {
            loop {
                match transport::recv_envelope(&mut reader).await {
                    Ok(Some(envelope)) => {
                        if !handle.send(LoopEvent::Bus(BusInput::Frame(id, envelope))) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(connection = id.0, "bus read error: {}", e);
                        break;
                    }
                }
            }
            handle.send(LoopEvent::Bus(BusInput::Closed(id)));
        });

        let write_task = tokio::spawn(async move {
            while let Some(envelope) = queue.recv().await {
                if let Err(e) = transport::send_envelope(&mut writer, &envelope).await {
                    tracing::debug!(connection = id.0, "bus write error: {}", e);
                    break;
                }
            }
        });

        tracing::trace!(connection = id.0, "bus connection accepted");
        self.connections.insert(
            id,
            ConnectionState {
                connection: Connection { id, outgoing },
                owner: None,
                tasks: [read_task.abort_handle(), write_task.abort_handle()],
            },
        );
    }

    /// Translate raw traffic into an event for the owning test
    pub fn handle_input(&mut self, input: BusInput) -> Option<(Uuid, BusEvent)> {
        match input {
            BusInput::Closed(id) => {
                let state = self.connections.remove(&id)?;
                state.tasks[1].abort();
                state.owner.map(|uuid| (uuid, BusEvent::NameVanished))
            }
            BusInput::Frame(id, envelope) => {
                let state = self.connections.get_mut(&id)?;
                match envelope {
                    Envelope::Hello { name } => {
                        if let Some(owner) = state.owner {
                            tracing::warn!(%owner, name = %name, "connection tried to claim a second name");
                            return None;
                        }
                        let Some(uuid) = protocol::uuid_from_service_name(&name) else {
                            tracing::debug!(name = %name, "ignoring name outside the test namespace");
                            return None;
                        };
                        state.owner = Some(uuid);
                        Some((uuid, BusEvent::NameAppeared(state.connection.clone())))
                    }
                    Envelope::Reply {
                        serial,
                        success,
                        result,
                        error,
                    } => {
                        let owner = state.owner?;
                        let outcome = if success {
                            Ok(result.unwrap_or(serde_json::Value::Null))
                        } else {
                            Err(error.unwrap_or_else(|| {
                                RemoteError::new("CALL_FAILED", "call failed without an error")
                            }))
                        };
                        Some((owner, BusEvent::Reply { serial, outcome }))
                    }
                    Envelope::Signal { signal } => {
                        let owner = state.owner?;
                        Some((owner, BusEvent::Signal(signal)))
                    }
                    Envelope::Call { serial, call } => {
                        tracing::warn!(serial, method = %call.method(), "workers cannot call the runner");
                        state.connection.send(Envelope::reply_err(
                            serial,
                            RemoteError::new("PROTOCOL_ERROR", "the runner exposes no methods"),
                        ));
                        None
                    }
                }
            }
        }
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        for state in self.connections.values() {
            for task in &state.tasks {
                task.abort();
            }
        }
        if let Err(e) = paths::remove_bus_socket(&self.address) {
            tracing::debug!("could not remove bus socket {}: {}", self.address, e);
        }
    }
}
