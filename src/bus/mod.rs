//! Private message bus between the runner and its test workers
//!
//! Every test run owns one bus. Workers reach it through the address in
//! `INSANITY_BUS_ADDRESS`, claim `net.insanity.Test.Test<uuid>` and then
//! exchange method calls and signals with the proxy of their test.

pub mod agent;
pub mod channel;
pub mod protocol;
pub mod server;
pub mod transport;

pub use agent::{serve, Agent, WorkerTest};
pub use channel::RemoteTestChannel;
pub use protocol::{Call, Envelope, Method, Signal};
pub use server::{BusEvent, Connection};
