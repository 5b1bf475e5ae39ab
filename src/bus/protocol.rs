//! Private-bus message types
//!
//! Every frame on the bus is one length-prefixed JSON [`Envelope`]. A
//! worker announces itself with `Hello`, carrying its service name; after
//! that the runner sends method calls and the worker sends replies and
//! signals.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::common::RemoteError;
use crate::test::arguments::ArgumentSet;

/// Service names of test workers all start with this prefix
pub const SERVICE_PREFIX: &str = "net.insanity.Test.Test";

/// Environment variable holding the private bus address
pub const BUS_ADDRESS_ENV: &str = "INSANITY_BUS_ADDRESS";

/// Environment variable holding the uuid the worker must claim
pub const TEST_UUID_ENV: &str = "INSANITY_TEST_UUID";

/// Service name a worker for `uuid` claims on the bus
pub fn service_name(uuid: &Uuid) -> String {
    format!("{}{}", SERVICE_PREFIX, uuid.simple())
}

/// Extract the test uuid from a worker service name
///
/// Names outside the test namespace return None.
pub fn uuid_from_service_name(name: &str) -> Option<Uuid> {
    let suffix = name.strip_prefix(SERVICE_PREFIX)?;
    Uuid::try_parse(suffix).ok()
}

/// One frame on the private bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame of every connection: the service name being claimed
    Hello { name: String },

    /// Runner → worker method call
    Call { serial: u64, call: Call },

    /// Worker → runner answer to a method call
    Reply {
        serial: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },

    /// Worker → runner notification
    Signal { signal: Signal },
}

impl Envelope {
    /// Create a success reply
    pub fn reply_ok(serial: u64, result: Value) -> Self {
        Envelope::Reply {
            serial,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error reply
    pub fn reply_err(serial: u64, error: RemoteError) -> Self {
        Envelope::Reply {
            serial,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Method calls the runner makes on a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Call {
    RemoteSetUp {
        args: ArgumentSet,
        output_files: BTreeMap<String, String>,
    },
    RemoteStart {
        args: ArgumentSet,
        output_files: BTreeMap<String, String>,
    },
    RemoteStop,
    RemoteTearDown,
}

impl Call {
    pub fn method(&self) -> Method {
        match self {
            Call::RemoteSetUp { .. } => Method::SetUp,
            Call::RemoteStart { .. } => Method::Start,
            Call::RemoteStop => Method::Stop,
            Call::RemoteTearDown => Method::TearDown,
        }
    }
}

/// Method names, used to match replies with the call they answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    SetUp,
    Start,
    Stop,
    TearDown,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::SetUp => "remoteSetUp",
            Method::Start => "remoteStart",
            Method::Stop => "remoteStop",
            Method::TearDown => "remoteTearDown",
        };
        f.write_str(name)
    }
}

/// Signals a worker emits towards the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "camelCase")]
pub enum Signal {
    RemoteDoneSignal,
    RemoteValidateChecklistItemSignal {
        item: String,
        ok: bool,
        #[serde(default)]
        description: String,
    },
    RemoteExtraInfoSignal { key: String, value: Value },
    RemotePingSignal,
}

/// Outcome of a method call as seen by the caller
pub type CallOutcome = std::result::Result<Value, RemoteError>;
