//! Scriptable worker binary for integration testing
//!
//! Connects to the runner's private bus like a real worker and behaves
//! according to the mode given as first argument:
//!
//! - `pass`: validates `work`, records an extra-info, signals done
//! - `fail-item`: validates `work` as failed, then exits with code 1
//! - `never-ack`: connects but never answers a call
//! - `hang`: starts but never signals done
//! - `crash`: exits with code 3 when asked to start
//! - `refuse`: answers setup with false

use std::collections::BTreeMap;

use async_trait::async_trait;
use insanity::bus::agent::{self, Agent, WorkerTest};
use insanity::common::logging;
use insanity::test::ArgumentSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Pass,
    FailItem,
    NeverAck,
    Hang,
    Crash,
    Refuse,
}

impl Mode {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pass" => Mode::Pass,
            "fail-item" => Mode::FailItem,
            "never-ack" => Mode::NeverAck,
            "hang" => Mode::Hang,
            "crash" => Mode::Crash,
            "refuse" => Mode::Refuse,
            _ => return None,
        })
    }
}

struct FakeWorker {
    mode: Mode,
}

#[async_trait]
impl WorkerTest for FakeWorker {
    async fn set_up(
        &mut self,
        _agent: &mut Agent,
        args: &ArgumentSet,
        _output_files: &BTreeMap<String, String>,
    ) -> bool {
        tracing::info!(mode = ?self.mode, ?args, "setting up");
        self.mode != Mode::Refuse
    }

    async fn start(
        &mut self,
        agent: &mut Agent,
        args: &ArgumentSet,
        output_files: &BTreeMap<String, String>,
    ) -> bool {
        match self.mode {
            Mode::Pass => {
                if let Some(path) = output_files.get("log") {
                    if let Err(e) = std::fs::write(path, format!("{:?}\n", args)) {
                        tracing::warn!("could not write output file: {}", e);
                    }
                }
                let sent = async {
                    agent.validate_checklist_item("work", true, "").await?;
                    agent.extra_info("answer", 42).await?;
                    agent.ping().await?;
                    agent.done().await
                };
                if let Err(e) = sent.await {
                    tracing::error!("signal failed: {}", e);
                    return false;
                }
                true
            }
            Mode::FailItem => {
                if let Err(e) = agent
                    .validate_checklist_item("work", false, "broken on purpose")
                    .await
                {
                    tracing::error!("signal failed: {}", e);
                }
                std::process::exit(1);
            }
            Mode::Crash => std::process::exit(3),
            Mode::Hang | Mode::NeverAck | Mode::Refuse => true,
        }
    }
}

/// Read calls without ever answering until the runner hangs up
async fn ignore_calls(mut agent: Agent) -> insanity::Result<()> {
    while let Some((serial, call)) = agent.next_call().await? {
        tracing::info!(serial, method = %call.method(), "ignoring call");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    logging::init_worker();

    let mode_arg = std::env::args().nth(1).unwrap_or_else(|| "pass".to_string());
    let Some(mode) = Mode::parse(&mode_arg) else {
        eprintln!("unknown mode '{}'", mode_arg);
        std::process::exit(64);
    };

    let agent = match Agent::connect_from_env().await {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("fake_worker: {}", e);
            std::process::exit(65);
        }
    };
    tracing::info!(uuid = %agent.uuid(), ?mode, "fake worker connected");

    let served = match mode {
        Mode::NeverAck => ignore_calls(agent).await,
        mode => agent::serve(agent, FakeWorker { mode }).await,
    };
    if let Err(e) = served {
        eprintln!("fake_worker: {}", e);
        std::process::exit(66);
    }
}
