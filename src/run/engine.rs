//! Event loop plumbing shared by every test of a run
//!
//! All test state lives on the run's loop. Timers, process polls, reaped
//! workers and bus traffic come back as [`LoopEvent`]s through a single
//! channel; the engine routes them to the owning test. While a test
//! handles an event it is taken out of the map, so handlers get the test
//! and the engine mutably at the same time. Events a test emits are
//! collected afterwards and delivered to its owner: the run for top-level
//! tests, the parent scenario for sub-tests. Deliveries to a parent are
//! deferred until no handler is active, so nothing ever re-enters a test
//! that is already handling an event.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::environment::Environment;
use super::ids::IdentifierAllocator;
use crate::bus::server::{BusInput, BusServer};
use crate::common::config::SupervisorConfig;
use crate::common::{Error, Result};
use crate::monitor::MonitorFactory;
use crate::test::lifecycle::Test;
use crate::test::timer::TimerKind;
use crate::test::{
    ArgumentSource, BodyInput, Owner, StopReason, TestCore, TestEvent, TestFactory, TestInit,
    TestReport, TestState,
};

/// Everything the run's loop reacts to besides new bus connections
#[derive(Debug)]
pub enum LoopEvent {
    Timer {
        test: Uuid,
        kind: TimerKind,
        generation: u64,
    },
    /// Time to check whether a test's worker exited
    Poll { test: Uuid },
    /// A worker was shut down; `None` when it could not be reaped
    Reaped { test: Uuid, returncode: Option<i32> },
    Bus(BusInput),
    /// Start the next pending sub-test of a scenario
    StartNextChild { scenario: Uuid },
    Environment(Environment),
    Abort,
}

/// Sending side of the loop's channel
#[derive(Debug, Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl LoopHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// False once the loop is gone
    pub fn send(&self, event: LoopEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Post `event` at `deadline`
    pub fn send_at(&self, deadline: Instant, event: LoopEvent) -> AbortHandle {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(event);
        })
        .abort_handle()
    }

    /// Post an event every `period`, starting one period from now
    pub fn send_every<F>(&self, period: Duration, make: F) -> AbortHandle
    where
        F: Fn() -> LoopEvent + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(make()).is_err() {
                    return;
                }
            }
        })
        .abort_handle()
    }

    /// Run `future` in the background and post its result
    pub fn spawn<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = LoopEvent> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = future.await;
            let _ = tx.send(event);
        })
        .abort_handle()
    }
}

/// Run-wide settings tests read while they run
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Working directory of spawned workers
    pub working_dir: PathBuf,
    /// Where tests create their output files
    pub output_dir: PathBuf,
    pub supervisor: SupervisorConfig,
    /// How long a worker gets to acknowledge `remoteStop`
    pub remote_stop_timeout: Duration,
    /// Extra environment of every worker
    pub env: BTreeMap<String, String>,
}

/// An event of a top-level test, with its report at that moment
#[derive(Debug, Clone)]
pub struct Notice {
    pub test: Uuid,
    pub event: TestEvent,
    pub report: Arc<TestReport>,
}

struct ChildDone {
    parent: Uuid,
    report: TestReport,
}

pub struct Engine {
    pub(crate) handle: LoopHandle,
    pub(crate) bus: BusServer,
    pub(crate) context: RunContext,
    tests: HashMap<Uuid, Test>,
    ids: IdentifierAllocator,
    notices: VecDeque<Notice>,
    deferred: VecDeque<ChildDone>,
    depth: usize,
}

impl Engine {
    pub(crate) fn new(handle: LoopHandle, bus: BusServer, context: RunContext) -> Self {
        Self {
            handle,
            bus,
            context,
            tests: HashMap::new(),
            ids: IdentifierAllocator::new(),
            notices: VecDeque::new(),
            deferred: VecDeque::new(),
            depth: 0,
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn bus_address(&self) -> &str {
        self.bus.address()
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Number of live test instances, sub-tests included
    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.tests.contains_key(&id)
    }

    pub fn state(&self, id: Uuid) -> Option<TestState> {
        self.tests.get(&id).map(|t| t.core.state())
    }

    pub fn report(&self, id: Uuid) -> Option<TestReport> {
        self.tests.get(&id).map(Test::report)
    }

    pub(crate) fn next_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }

    /// Create a test instance; it does nothing until it is run
    pub(crate) fn create_test(
        &mut self,
        factory: &dyn TestFactory,
        arguments: crate::test::ArgumentSet,
        mut source: Box<dyn ArgumentSource>,
        monitors: &[Arc<dyn MonitorFactory>],
        owner: Owner,
    ) -> Result<Uuid> {
        let Some(first) = source.next_set() else {
            return Err(Error::invalid_arguments(
                factory.schema().name(),
                "argument source produced no set",
            ));
        };
        let uuid = self.ids.acquire();
        let core = TestCore::new(
            uuid,
            factory.schema().clone(),
            arguments,
            first,
            source,
            owner,
            self.handle.clone(),
            self.context.output_dir.clone(),
        );
        let init = TestInit {
            uuid,
            arguments: core.arguments().clone(),
            monitors: monitors.to_vec(),
        };
        let body = match factory.create(&init) {
            Ok(body) => body,
            Err(e) => {
                self.ids.release(&uuid);
                return Err(e);
            }
        };

        let mut test = Test::new(core, body);
        let kind = factory.kind();
        for monitor in monitors {
            if !monitor.applies_on().accepts(kind) {
                let err = Error::MonitorNotApplicable {
                    monitor: monitor.name().to_string(),
                    test: factory.schema().name().to_string(),
                };
                tracing::warn!(uuid = %uuid, "{}", err);
                continue;
            }
            test.core.monitors.push(monitor.create());
        }

        tracing::debug!(uuid = %uuid, test = factory.schema().name(), ?owner, "created test");
        self.tests.insert(uuid, test);
        Ok(uuid)
    }

    /// Start a test created with [`Engine::create_test`]
    pub(crate) fn run_test(&mut self, id: Uuid) {
        self.launch(id);
        self.flush();
    }

    /// Stop a test; stopping twice is harmless
    pub(crate) fn stop_test(&mut self, id: Uuid, reason: StopReason) {
        self.halt(id, reason);
        self.flush();
    }

    /// Start a test from inside another test's handler
    pub(crate) fn launch(&mut self, id: Uuid) {
        self.with_test(id, |test, engine| test.run(engine));
    }

    /// Stop a test from inside another test's handler
    pub(crate) fn halt(&mut self, id: Uuid, reason: StopReason) {
        self.with_test(id, |test, engine| test.stop(engine, reason));
    }

    /// Route a loop event to the test it belongs to
    pub(crate) fn dispatch(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Timer {
                test,
                kind,
                generation,
            } => {
                self.with_test(test, |t, engine| t.on_timer(engine, kind, generation));
            }
            LoopEvent::Poll { test } => {
                self.with_test(test, |t, engine| t.handle(engine, BodyInput::Poll));
            }
            LoopEvent::Reaped { test, returncode } => {
                self.with_test(test, |t, engine| {
                    t.handle(engine, BodyInput::Reaped(returncode))
                });
            }
            LoopEvent::StartNextChild { scenario } => {
                self.with_test(scenario, |t, engine| {
                    t.handle(engine, BodyInput::StartNextChild)
                });
            }
            LoopEvent::Bus(input) => {
                if let Some((test, event)) = self.bus.handle_input(input) {
                    if !self.tests.contains_key(&test) {
                        tracing::debug!(uuid = %test, "bus traffic for an unknown test");
                        return;
                    }
                    self.with_test(test, |t, engine| t.handle(engine, BodyInput::Bus(event)));
                }
            }
            LoopEvent::Environment(_) | LoopEvent::Abort => {
                tracing::debug!("run-level event reached the engine");
            }
        }
        self.flush();
    }

    fn with_test<R>(&mut self, id: Uuid, f: impl FnOnce(&mut Test, &mut Engine) -> R) -> Option<R> {
        let Some(mut test) = self.tests.remove(&id) else {
            tracing::trace!(uuid = %id, "event for a test that is gone");
            return None;
        };
        self.depth += 1;
        let result = f(&mut test, self);
        self.depth -= 1;
        self.settle(test);
        Some(result)
    }

    /// Route what a test emitted and put it back unless it is finished
    fn settle(&mut self, mut test: Test) {
        let events = test.core.take_outbox();
        let finished = test.core.is_finished();
        let uuid = test.core.uuid();

        match test.core.owner() {
            Owner::Run if !events.is_empty() => {
                let report = Arc::new(test.report());
                self.notices.extend(events.into_iter().map(|event| Notice {
                    test: uuid,
                    event,
                    report: report.clone(),
                }));
            }
            Owner::Run => {}
            Owner::Scenario(parent) => {
                if finished {
                    self.deferred.push_back(ChildDone {
                        parent,
                        report: test.report(),
                    });
                }
            }
        }

        if finished {
            tracing::debug!(uuid = %uuid, "test finished");
            self.ids.release(&uuid);
        } else {
            self.tests.insert(uuid, test);
        }
    }

    /// Deliver finished sub-tests to their scenarios
    fn flush(&mut self) {
        if self.depth > 0 {
            return;
        }
        while let Some(ChildDone { parent, report }) = self.deferred.pop_front() {
            self.with_test(parent, |t, engine| t.handle(engine, BodyInput::ChildDone(report)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_send_at_fires_at_deadline() {
        let (handle, mut rx) = LoopHandle::channel();
        let start = Instant::now();
        handle.send_at(start + Duration::from_secs(3), LoopEvent::Abort);

        assert!(matches!(rx.recv().await, Some(LoopEvent::Abort)));
        assert_eq!(Instant::now() - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_every_skips_immediate_tick() {
        let (handle, mut rx) = LoopHandle::channel();
        let test = Uuid::new_v4();
        let start = Instant::now();
        let task = handle.send_every(Duration::from_millis(500), move || LoopEvent::Poll { test });

        for n in 1..=3u32 {
            assert!(matches!(rx.recv().await, Some(LoopEvent::Poll { .. })));
            assert_eq!(Instant::now() - start, Duration::from_millis(500) * n);
        }
        task.abort();
    }

    #[tokio::test]
    async fn test_spawn_posts_result() {
        let (handle, mut rx) = LoopHandle::channel();
        let test = Uuid::new_v4();
        handle.spawn(async move {
            LoopEvent::Reaped {
                test,
                returncode: Some(3),
            }
        });
        match rx.recv().await {
            Some(LoopEvent::Reaped { returncode, .. }) => assert_eq!(returncode, Some(3)),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
