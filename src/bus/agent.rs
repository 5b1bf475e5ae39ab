//! Worker side of the private bus
//!
//! A worker process connects to the address exported by the runner,
//! claims the service name of its uuid, then answers the runner's method
//! calls through a [`WorkerTest`] implementation.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{ReadHalf, WriteHalf};
use uuid::Uuid;

use super::protocol::{self, Call, Envelope, Signal, BUS_ADDRESS_ENV, TEST_UUID_ENV};
use super::transport::{self, Stream};
use crate::common::{Error, RemoteError, Result};
use crate::test::arguments::ArgumentSet;
use crate::test::schema::extra;

pub struct Agent {
    uuid: Uuid,
    reader: ReadHalf<Stream>,
    writer: WriteHalf<Stream>,
}

impl Agent {
    /// Connect using the address and uuid exported by the runner
    pub async fn connect_from_env() -> Result<Self> {
        let address =
            std::env::var(BUS_ADDRESS_ENV).map_err(|_| Error::MissingEnvironment(BUS_ADDRESS_ENV))?;
        let uuid = std::env::var(TEST_UUID_ENV).map_err(|_| Error::MissingEnvironment(TEST_UUID_ENV))?;
        let uuid = Uuid::try_parse(&uuid)
            .map_err(|e| Error::BusProtocol(format!("invalid {}: {}", TEST_UUID_ENV, e)))?;
        Self::connect(&address, uuid).await
    }

    pub async fn connect(address: &str, uuid: Uuid) -> Result<Self> {
        let stream = transport::connect(address)
            .await
            .map_err(|source| Error::BusConnect {
                address: address.to_string(),
                source,
            })?;
        let (reader, writer) = tokio::io::split(stream);
        let mut agent = Self {
            uuid,
            reader,
            writer,
        };
        agent
            .send(Envelope::Hello {
                name: protocol::service_name(&uuid),
            })
            .await?;
        tracing::debug!(%uuid, "connected to private bus");
        Ok(agent)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn send(&mut self, envelope: Envelope) -> Result<()> {
        transport::send_envelope(&mut self.writer, &envelope).await?;
        Ok(())
    }

    /// Wait for the next method call; None once the runner hung up
    pub async fn next_call(&mut self) -> Result<Option<(u64, Call)>> {
        loop {
            match transport::recv_envelope(&mut self.reader).await? {
                None => return Ok(None),
                Some(Envelope::Call { serial, call }) => return Ok(Some((serial, call))),
                Some(other) => {
                    tracing::debug!("ignoring unexpected frame from runner: {:?}", other);
                }
            }
        }
    }

    pub async fn reply(&mut self, serial: u64, outcome: std::result::Result<Value, RemoteError>) -> Result<()> {
        let envelope = match outcome {
            Ok(value) => Envelope::reply_ok(serial, value),
            Err(error) => Envelope::reply_err(serial, error),
        };
        self.send(envelope).await
    }

    async fn signal(&mut self, signal: Signal) -> Result<()> {
        self.send(Envelope::Signal { signal }).await
    }

    pub async fn validate_checklist_item(&mut self, item: &str, ok: bool, description: &str) -> Result<()> {
        self.signal(Signal::RemoteValidateChecklistItemSignal {
            item: item.to_string(),
            ok,
            description: description.to_string(),
        })
        .await
    }

    pub async fn extra_info(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.signal(Signal::RemoteExtraInfoSignal {
            key: key.to_string(),
            value: value.into(),
        })
        .await
    }

    /// Tell the runner the worker is still making progress
    pub async fn ping(&mut self) -> Result<()> {
        self.signal(Signal::RemotePingSignal).await
    }

    /// Tell the runner the current iteration is finished
    pub async fn done(&mut self) -> Result<()> {
        self.signal(Signal::RemoteDoneSignal).await
    }
}

/// Test logic hosted by a worker process
#[async_trait]
pub trait WorkerTest: Send {
    /// Prepare the test; returning false aborts it
    async fn set_up(
        &mut self,
        _agent: &mut Agent,
        _args: &ArgumentSet,
        _output_files: &BTreeMap<String, String>,
    ) -> bool {
        true
    }

    /// Run one iteration; call [`Agent::done`] once it is finished
    async fn start(
        &mut self,
        agent: &mut Agent,
        args: &ArgumentSet,
        output_files: &BTreeMap<String, String>,
    ) -> bool;

    async fn stop(&mut self, _agent: &mut Agent) {}

    async fn tear_down(&mut self, _agent: &mut Agent) {}
}

/// CPU time consumed by this process, user and system
#[cfg(unix)]
fn cpu_time() -> Option<Duration> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::uninit();
    // SAFETY: getrusage fills the struct when it returns 0
    let usage = unsafe {
        if libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) != 0 {
            return None;
        }
        usage.assume_init()
    };
    let timeval = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    Some(timeval(usage.ru_utime) + timeval(usage.ru_stime))
}

#[cfg(not(unix))]
fn cpu_time() -> Option<Duration> {
    None
}

/// Wall clock and CPU time at the start of a measurement
#[derive(Debug, Clone, Copy)]
struct Usage {
    wall: Instant,
    cpu: Duration,
}

impl Usage {
    fn sample() -> Option<Self> {
        Some(Self {
            wall: Instant::now(),
            cpu: cpu_time()?,
        })
    }

    /// Integer percentage of one core used since `self`
    fn load_since(&self, end: &Usage) -> Option<u64> {
        cpu_load(end.wall.duration_since(self.wall), end.cpu.saturating_sub(self.cpu))
    }
}

fn cpu_load(wall: Duration, cpu: Duration) -> Option<u64> {
    if wall.is_zero() {
        return None;
    }
    Some((cpu.as_secs_f64() / wall.as_secs_f64() * 100.0) as u64)
}

/// Answer method calls until teardown or until the runner hangs up
///
/// Teardown reports the `cpu-load` of the worker since setup.
pub async fn serve<W: WorkerTest>(mut agent: Agent, mut worker: W) -> Result<()> {
    let mut usage_start = None;
    while let Some((serial, call)) = agent.next_call().await? {
        tracing::debug!(serial, method = %call.method(), "call from runner");
        match call {
            Call::RemoteSetUp { args, output_files } => {
                usage_start = Usage::sample();
                let ok = worker.set_up(&mut agent, &args, &output_files).await;
                agent.reply(serial, Ok(Value::Bool(ok))).await?;
            }
            Call::RemoteStart { args, output_files } => {
                let ok = worker.start(&mut agent, &args, &output_files).await;
                agent.reply(serial, Ok(Value::Bool(ok))).await?;
            }
            Call::RemoteStop => {
                worker.stop(&mut agent).await;
                agent.reply(serial, Ok(Value::Null)).await?;
            }
            Call::RemoteTearDown => {
                let load = usage_start
                    .zip(Usage::sample())
                    .and_then(|(start, end)| start.load_since(&end));
                if let Some(load) = load {
                    agent.extra_info(extra::CPU_LOAD, load).await?;
                }
                worker.tear_down(&mut agent).await;
                agent.reply(serial, Ok(Value::Null)).await?;
                return Ok(());
            }
        }
    }
    Ok(())
}
