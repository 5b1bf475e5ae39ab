//! Test runs
//!
//! A [`TestRun`] owns a queue of batches (a test type plus the argument
//! sets to run it with), the private bus its workers connect to and the
//! event loop everything executes on. It keeps at most `max_concurrent`
//! top-level tests running, forwards their lifecycle to storage and to
//! listeners, and finishes once every batch is exhausted.

pub mod engine;
pub mod environment;
pub mod ids;
pub mod storage;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::server::BusServer;
use crate::common::config::{Config, SupervisorConfig};
use crate::common::{Error, Result};
use crate::events::{EventBus, ListenerId};
use crate::monitor::MonitorFactory;
use crate::test::{
    ArgumentSet, ArgumentSource, IntoArgumentSource, Owner, StopReason, TestEvent, TestFactory,
    TestReport,
};
use engine::{Engine, LoopEvent, LoopHandle, RunContext};
pub use environment::Environment;
use storage::{NullStorage, RunInfo, Storage};

/// Settings of one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Working directory of the workers; output files go to `outputfiles/`
    pub working_dir: PathBuf,
    pub max_concurrent: usize,
    pub client_id: Option<String>,
    pub supervisor: SupervisorConfig,
    pub remote_stop_timeout: Duration,
    /// Extra environment of every worker
    pub env: BTreeMap<String, String>,
}

impl RunOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&Config::default(), working_dir)
    }

    pub fn from_config(config: &Config, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            max_concurrent: config.run.max_concurrent,
            client_id: config.run.client_id.clone(),
            supervisor: config.supervisor.clone(),
            remote_stop_timeout: config.timeouts.remote_stop(),
            env: BTreeMap::new(),
        }
    }
}

/// What listeners of a run are told
#[derive(Debug, Clone)]
pub enum RunEvent {
    Start { run: Uuid },
    SingleTestStart { test: Arc<TestReport>, iteration: u32 },
    SingleTestStop { test: Arc<TestReport>, iteration: u32 },
    SingleTestDone { test: Arc<TestReport> },
    /// Completion of the current batch, from 0 to 100
    Progress {
        position: usize,
        length: usize,
        percent: u32,
    },
    Aborted,
    Done,
}

/// Outcome of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub environment: Environment,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reports: Vec<TestReport>,
    pub aborted: bool,
}

impl RunSummary {
    /// Tests that scored below 100%
    pub fn failures(&self) -> impl Iterator<Item = &TestReport> {
        self.reports.iter().filter(|r| !r.is_perfect())
    }

    pub fn all_passed(&self) -> bool {
        !self.aborted && self.failures().next().is_none()
    }
}

/// Aborts a run from outside its loop
#[derive(Debug, Clone)]
pub struct RunController {
    handle: LoopHandle,
}

impl RunController {
    /// Stop every running test and start no new ones
    pub fn abort(&self) {
        tracing::info!("aborting test run");
        self.handle.send(LoopEvent::Abort);
    }
}

enum Arguments {
    /// One instance per argument set
    Each(Box<dyn ArgumentSource>),
    /// One instance iterating over every set
    Iterated(Option<Box<dyn ArgumentSource>>),
}

struct Batch {
    factory: Arc<dyn TestFactory>,
    arguments: Arguments,
    monitors: Vec<Arc<dyn MonitorFactory>>,
}

impl Batch {
    /// Arguments of the next instance, with its position in the batch
    fn next_instance(&mut self) -> Option<(ArgumentSet, Box<dyn ArgumentSource>, usize)> {
        match &mut self.arguments {
            Arguments::Each(source) => {
                let set = source.next_set()?;
                let position = source.position().saturating_sub(1);
                Some((set, ArgumentSet::new().into_source(), position))
            }
            Arguments::Iterated(source) => source
                .take()
                .filter(|s| !s.is_empty())
                .map(|s| (ArgumentSet::new(), s, 0)),
        }
    }

    fn position(&self) -> usize {
        match &self.arguments {
            Arguments::Each(source) => source.position(),
            Arguments::Iterated(source) => usize::from(source.is_none()),
        }
    }

    fn len(&self) -> usize {
        match &self.arguments {
            Arguments::Each(source) => source.len(),
            Arguments::Iterated(_) => 1,
        }
    }
}

pub struct TestRun {
    id: Uuid,
    options: RunOptions,
    output_dir: PathBuf,
    handle: LoopHandle,
    receiver: Option<mpsc::UnboundedReceiver<LoopEvent>>,
    batches: VecDeque<Batch>,
    current: Option<Batch>,
    /// Running top-level tests with their batch position and length
    running: HashMap<Uuid, (usize, usize)>,
    storage: Box<dyn Storage>,
    events: EventBus<RunEvent>,
    info: Option<RunInfo>,
    reports: Vec<TestReport>,
    aborted: bool,
    finished: bool,
}

impl TestRun {
    /// Prepare a run, creating its working directories
    pub fn new(options: RunOptions) -> Result<Self> {
        let output_dir = options.working_dir.join("outputfiles");
        std::fs::create_dir_all(&output_dir).map_err(|e| Error::FileWrite {
            path: output_dir.display().to_string(),
            error: e.to_string(),
        })?;
        let (handle, receiver) = LoopHandle::channel();

        Ok(Self {
            id: Uuid::new_v4(),
            options,
            output_dir,
            handle,
            receiver: Some(receiver),
            batches: VecDeque::new(),
            current: None,
            running: HashMap::new(),
            storage: Box::new(NullStorage),
            events: EventBus::new(),
            info: None,
            reports: Vec::new(),
            aborted: false,
            finished: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn working_directory(&self) -> &Path {
        &self.options.working_dir
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_dir
    }

    pub fn max_concurrent(&self) -> usize {
        self.options.max_concurrent.max(1)
    }

    pub fn set_storage(&mut self, storage: impl Storage + 'static) {
        self.storage = Box::new(storage);
    }

    pub fn connect(&mut self, listener: impl FnMut(&RunEvent) + 'static) -> ListenerId {
        self.events.connect(listener)
    }

    pub fn disconnect(&mut self, id: ListenerId) -> bool {
        self.events.disconnect(id)
    }

    pub fn controller(&self) -> RunController {
        RunController {
            handle: self.handle.clone(),
        }
    }

    /// Queue one instance of `factory` per argument set
    pub fn add_test(
        &mut self,
        factory: Arc<dyn TestFactory>,
        arguments: impl IntoArgumentSource,
        monitors: Vec<Arc<dyn MonitorFactory>>,
    ) {
        self.batches.push_back(Batch {
            factory,
            arguments: Arguments::Each(arguments.into_source()),
            monitors,
        });
    }

    /// Queue a single instance running one iteration per argument set
    pub fn add_iterated_test(
        &mut self,
        factory: Arc<dyn TestFactory>,
        arguments: impl IntoArgumentSource,
        monitors: Vec<Arc<dyn MonitorFactory>>,
    ) {
        self.batches.push_back(Batch {
            factory,
            arguments: Arguments::Iterated(Some(arguments.into_source())),
            monitors,
        });
    }

    /// Position of the last instance pulled from the current batch
    pub fn current_batch_position(&self) -> usize {
        self.current.as_ref().map_or(0, Batch::position)
    }

    pub fn current_batch_length(&self) -> usize {
        self.current.as_ref().map_or(0, Batch::len)
    }

    /// Execute every queued batch
    pub async fn run(&mut self) -> Result<RunSummary> {
        let mut receiver = self.receiver.take().ok_or(Error::RunAlreadyStarted)?;
        let bus = BusServer::bind(self.handle.clone())?;
        let context = RunContext {
            working_dir: self.options.working_dir.clone(),
            output_dir: self.output_dir.clone(),
            supervisor: self.options.supervisor.clone(),
            remote_stop_timeout: self.options.remote_stop_timeout,
            env: self.options.env.clone(),
        };
        let mut engine = Engine::new(self.handle.clone(), bus, context);
        tracing::info!(run = %self.id, bus = %engine.bus_address(), "test run starting");

        let variables = self.options.env.clone();
        self.handle.spawn(async move {
            let environment = tokio::task::spawn_blocking(move || Environment::collect(variables))
                .await
                .unwrap_or_default();
            LoopEvent::Environment(environment)
        });

        while !self.finished {
            tokio::select! {
                accepted = engine.bus.accept() => match accepted {
                    Ok(stream) => engine.bus.attach(stream),
                    Err(e) => tracing::warn!("bus accept failed: {}", e),
                },
                event = receiver.recv() => match event {
                    Some(LoopEvent::Environment(environment)) => self.on_environment(&mut engine, environment),
                    Some(LoopEvent::Abort) => self.abort_running(&mut engine),
                    Some(event) => engine.dispatch(event),
                    None => break,
                },
            }
            self.process_notices(&mut engine);
        }

        let info = self.info.take().ok_or_else(|| Error::Internal("run ended before it started".into()))?;
        Ok(RunSummary {
            id: self.id,
            environment: info.environment,
            started_at: info.started_at,
            ended_at: Utc::now(),
            reports: std::mem::take(&mut self.reports),
            aborted: self.aborted,
        })
    }

    fn on_environment(&mut self, engine: &mut Engine, environment: Environment) {
        tracing::debug!(os = %environment.os_type, version = %environment.os_version, "environment collected");
        self.info = Some(RunInfo {
            id: self.id,
            started_at: Utc::now(),
            environment,
        });
        let client_id = self.options.client_id.clone();
        self.store("startNewTestRun", |storage, run| {
            storage.start_new_test_run(run, client_id.as_deref())
        });
        self.events.emit(&RunEvent::Start { run: self.id });
        self.run_next(engine);
        self.maybe_finish();
    }

    /// Start instances until the concurrency limit or the queue runs out
    fn run_next(&mut self, engine: &mut Engine) {
        while !self.aborted && self.running.len() < self.max_concurrent() {
            if self.current.is_none() {
                self.current = self.batches.pop_front();
            }
            let Some(batch) = self.current.as_mut() else {
                return;
            };
            let Some((arguments, source, position)) = batch.next_instance() else {
                self.current = None;
                continue;
            };
            let length = batch.len();

            let created = engine.create_test(
                batch.factory.as_ref(),
                arguments,
                source,
                &batch.monitors,
                Owner::Run,
            );
            match created {
                Ok(id) => {
                    self.running.insert(id, (position, length));
                    engine.run_test(id);
                }
                Err(e) => {
                    tracing::error!(test = batch.factory.name(), "could not create test: {}", e);
                }
            }
        }
    }

    fn process_notices(&mut self, engine: &mut Engine) {
        while let Some(notice) = engine.next_notice() {
            let Some(&(position, length)) = self.running.get(&notice.test) else {
                continue;
            };
            let report = notice.report;
            match notice.event {
                TestEvent::Start { iteration } => {
                    self.store("newTestStarted", |storage, run| {
                        storage.new_test_started(run, &report, iteration)
                    });
                    self.events.emit(&RunEvent::SingleTestStart {
                        test: report,
                        iteration,
                    });
                }
                TestEvent::Stop { iteration } => {
                    self.store("newTestStopped", |storage, run| {
                        storage.new_test_stopped(run, &report, iteration)
                    });
                    self.events.emit(&RunEvent::SingleTestStop {
                        test: report,
                        iteration,
                    });
                }
                TestEvent::Check { .. } => {
                    let length = length.max(1);
                    let percent = (100.0 * position as f64 + report.success_percentage) / length as f64;
                    self.events.emit(&RunEvent::Progress {
                        position,
                        length,
                        percent: percent.floor().clamp(0.0, 100.0) as u32,
                    });
                }
                TestEvent::ExtraInfo { .. } => {}
                TestEvent::Done => {
                    self.running.remove(&notice.test);
                    self.store("newTestFinished", |storage, run| {
                        storage.new_test_finished(run, &report)
                    });
                    self.reports.push(report.as_ref().clone());
                    self.events.emit(&RunEvent::SingleTestDone { test: report });
                    self.run_next(engine);
                    self.maybe_finish();
                }
            }
        }
    }

    fn abort_running(&mut self, engine: &mut Engine) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        let running: Vec<Uuid> = self.running.keys().copied().collect();
        tracing::info!(run = %self.id, running = running.len(), "aborting");
        for id in running {
            engine.stop_test(id, StopReason::Aborted);
        }
        self.events.emit(&RunEvent::Aborted);
        self.maybe_finish();
    }

    fn maybe_finish(&mut self) {
        if self.finished || self.info.is_none() || !self.running.is_empty() {
            return;
        }
        if !self.aborted && (self.current.is_some() || !self.batches.is_empty()) {
            return;
        }
        self.store("endTestRun", |storage, run| storage.end_test_run(run));
        tracing::info!(run = %self.id, tests = self.reports.len(), aborted = self.aborted, "test run done");
        self.events.emit(&RunEvent::Done);
        self.finished = true;
    }

    fn store(&mut self, call: &str, f: impl FnOnce(&mut dyn Storage, &RunInfo) -> Result<()>) {
        let Some(info) = self.info.as_ref() else {
            return;
        };
        if let Err(e) = f(self.storage.as_mut(), info) {
            tracing::warn!(call, "storage failed: {}", e);
        }
    }
}
