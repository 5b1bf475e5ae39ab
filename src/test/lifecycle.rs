//! The test lifecycle
//!
//! `Created -> SettingUp -> (WaitingForSetup) -> Running -> Stopping ->
//! TearingDown -> Finished`, with `Stopping -> Running` when another
//! iteration follows. Bodies never change the state themselves: their
//! hooks return a [`Next`] that is applied here, which keeps every
//! transition checked in one place.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::core::{StopReason, TestCore, TestEvent, TestReport, TestState};
use super::schema::{items, TestSchema};
use super::timer::{Fire, TimerKind};
use super::{ArgumentSet, BodyInput, Next, TearDown, TestBody};
use crate::run::engine::{Engine, LoopHandle, RunContext};

/// A test instance: shared state plus the behaviour of its kind
pub struct Test {
    pub(crate) core: TestCore,
    body: Box<dyn TestBody>,
}

/// What a body can reach while handling a hook
pub struct Cx<'a> {
    core: &'a mut TestCore,
    engine: &'a mut Engine,
}

impl<'a> Cx<'a> {
    pub(crate) fn new(core: &'a mut TestCore, engine: &'a mut Engine) -> Self {
        Self { core, engine }
    }

    pub fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    pub fn schema(&self) -> &Arc<TestSchema> {
        self.core.schema()
    }

    pub fn arguments(&self) -> &ArgumentSet {
        self.core.arguments()
    }

    pub fn iteration(&self) -> u32 {
        self.core.iteration()
    }

    pub fn state(&self) -> TestState {
        self.core.state()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.core.stop_reason()
    }

    pub fn is_stopping(&self) -> bool {
        self.core.is_stopping()
    }

    pub fn has_more_iterations(&self) -> bool {
        self.core.has_more_iterations()
    }

    pub fn output_files(&self) -> BTreeMap<String, String> {
        self.core.output_files()
    }

    pub fn validate(&mut self, item: &str, ok: bool) {
        self.core.validate_checklist_item(item, ok, None);
    }

    pub fn validate_with(&mut self, item: &str, ok: bool, description: &str) {
        self.core.validate_checklist_item(item, ok, Some(description));
    }

    pub fn extra_info(&mut self, key: &str, value: impl Into<Value>) {
        self.core.extra_info(key, value);
    }

    pub fn ping(&mut self) {
        self.core.ping();
    }

    pub fn timeout(&self) -> Duration {
        self.core.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.core.set_timeout(timeout);
    }

    /// Rewrite the stored snapshot of the current iteration
    pub fn refresh_snapshot(&mut self) {
        self.core.snapshot_iteration();
    }

    pub fn handle(&self) -> &LoopHandle {
        self.core.handle()
    }

    pub fn context(&self) -> &RunContext {
        self.engine.context()
    }

    pub fn bus_address(&self) -> &str {
        self.engine.bus_address()
    }

    pub(crate) fn engine(&mut self) -> &mut Engine {
        &mut *self.engine
    }
}

impl Test {
    pub(crate) fn new(core: TestCore, body: Box<dyn TestBody>) -> Self {
        Self { core, body }
    }

    pub fn report(&self) -> TestReport {
        self.core.report(self.body.aggregate())
    }

    /// Set the test up, then start it unless the setup is asynchronous
    pub(crate) fn run(&mut self, engine: &mut Engine) -> bool {
        if self.core.state() != TestState::Created {
            tracing::warn!(uuid = %self.core.uuid(), state = ?self.core.state(), "test already ran");
            return false;
        }
        tracing::info!(uuid = %self.core.uuid(), test = self.core.schema().name(), "setting up");
        self.core.mark_setting_up();

        let mut ok = self.core.set_up_monitors(self.body.launch_config());
        if ok {
            ok = self.body.set_up(&mut Cx::new(&mut self.core, engine));
        }
        if !ok {
            tracing::error!(uuid = %self.core.uuid(), "setup failed");
            self.stop(engine, StopReason::SetupFailed);
            return false;
        }

        if self.core.schema().async_setup() {
            self.core.wait_for_setup();
        } else {
            self.start(engine);
        }
        true
    }

    fn start(&mut self, engine: &mut Engine) {
        match self.core.state() {
            TestState::SettingUp | TestState::WaitingForSetup | TestState::Stopping => {}
            state => {
                tracing::debug!(uuid = %self.core.uuid(), ?state, "ignoring start");
                return;
            }
        }

        self.core.begin_iteration();
        self.core.start_monitors();
        let iteration = self.core.iteration();
        tracing::info!(uuid = %self.core.uuid(), iteration, "starting");
        self.core.emit(TestEvent::Start { iteration });
        self.core
            .validate_checklist_item(items::TEST_STARTED, true, None);

        let next = self.body.test(&mut Cx::new(&mut self.core, engine));
        let next = if next == Next::Continue && !self.core.schema().async_test() {
            Next::Stop(StopReason::Completed)
        } else {
            next
        };
        self.apply(engine, next);
    }

    /// Stop the running iteration; later calls are ignored
    pub(crate) fn stop(&mut self, engine: &mut Engine, reason: StopReason) {
        if self.core.is_stopping() {
            tracing::warn!(uuid = %self.core.uuid(), ?reason, "test is already stopping");
            return;
        }

        let no_timeout = self.core.begin_stop(reason);
        let iteration = self.core.iteration();
        tracing::info!(uuid = %self.core.uuid(), iteration, ?reason, "stopping");
        self.core
            .validate_checklist_item(items::NO_TIMEOUT, no_timeout, None);
        self.core.stop_monitors();
        self.core.emit(TestEvent::Stop { iteration });
        self.core.snapshot_iteration();

        let next = self.body.on_stop(&mut Cx::new(&mut self.core, engine));
        self.apply(engine, next);
    }

    fn tear_down(&mut self, engine: &mut Engine) {
        tracing::debug!(uuid = %self.core.uuid(), "tearing down");
        self.core.begin_tear_down();
        self.core.prepare_monitors_tear_down();
        match self.body.tear_down(&mut Cx::new(&mut self.core, engine)) {
            TearDown::Done => self.finish_tear_down(),
            TearDown::Pending => {}
        }
    }

    fn finish_tear_down(&mut self) {
        self.core.tear_down_monitors();
        self.core.finish();
        self.core.snapshot_iteration();
        tracing::info!(
            uuid = %self.core.uuid(),
            success = self.report().success_percentage,
            "done"
        );
        self.core.emit(TestEvent::Done);
    }

    pub(crate) fn on_timer(&mut self, engine: &mut Engine, kind: TimerKind, generation: u64) {
        if kind == TimerKind::Guard {
            self.handle(engine, BodyInput::Guard { generation });
            return;
        }
        if self.core.fire_timer(kind, generation) != Fire::Expired {
            return;
        }
        match (kind, self.core.state()) {
            (TimerKind::Setup, TestState::WaitingForSetup) => {
                tracing::warn!(uuid = %self.core.uuid(), "setup timed out");
                self.stop(engine, StopReason::SetupTimeout);
            }
            (TimerKind::Test, TestState::Running) => {
                tracing::warn!(uuid = %self.core.uuid(), iteration = self.core.iteration(), "timed out");
                self.stop(engine, StopReason::Timeout);
            }
            (kind, state) => {
                tracing::debug!(uuid = %self.core.uuid(), ?kind, ?state, "timer expired in another state");
            }
        }
    }

    pub(crate) fn handle(&mut self, engine: &mut Engine, input: BodyInput) {
        if self.core.is_finished() {
            return;
        }
        let next = self.body.handle(&mut Cx::new(&mut self.core, engine), input);
        self.apply(engine, next);
    }

    fn apply(&mut self, engine: &mut Engine, next: Next) {
        let state = self.core.state();
        match next {
            Next::Continue => {}
            Next::Start if state == TestState::WaitingForSetup => self.start(engine),
            Next::Stop(reason) => self.stop(engine, reason),
            Next::Advance if state == TestState::Stopping => {
                let again = self.core.stop_reason() == Some(StopReason::Completed)
                    && self.core.iteration() > 0
                    && self.core.advance_arguments();
                if again {
                    self.start(engine);
                } else {
                    self.tear_down(engine);
                }
            }
            Next::TearDown if state == TestState::Stopping => self.tear_down(engine),
            Next::FinishTearDown if state == TestState::TearingDown => self.finish_tear_down(),
            next => {
                tracing::debug!(uuid = %self.core.uuid(), ?next, ?state, "ignoring transition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::server::BusServer;
    use crate::common::config::SupervisorConfig;
    use crate::run::engine::{LoopEvent, Notice};
    use crate::test::checklist::CheckResult;
    use crate::test::core::Owner;
    use crate::test::local::LocalTestType;
    use crate::test::IntoArgumentSource;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn engine(dir: &std::path::Path) -> (Engine, UnboundedReceiver<LoopEvent>) {
        let (handle, rx) = LoopHandle::channel();
        let bus = BusServer::bind(handle.clone()).unwrap();
        let context = RunContext {
            working_dir: dir.to_path_buf(),
            output_dir: dir.to_path_buf(),
            supervisor: SupervisorConfig::default(),
            remote_stop_timeout: Duration::from_secs(5),
            env: BTreeMap::new(),
        };
        (Engine::new(handle, bus, context), rx)
    }

    fn notices(engine: &mut Engine) -> Vec<Notice> {
        std::iter::from_fn(|| engine.next_notice()).collect()
    }

    fn done_report(notices: &[Notice]) -> Option<&TestReport> {
        notices
            .iter()
            .find(|n| n.event == TestEvent::Done)
            .map(|n| n.report.as_ref())
    }

    #[tokio::test]
    async fn test_empty_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _rx) = engine(dir.path());
        let schema = TestSchema::extending(TestSchema::base(), "empty").build();
        let factory = LocalTestType::new(schema, |_| Next::Continue);

        let created = engine.create_test(
            &factory,
            ArgumentSet::new(),
            Vec::<ArgumentSet>::new().into_source(),
            &[],
            Owner::Run,
        );
        assert!(matches!(created, Err(crate::common::Error::InvalidArguments { .. })));
        assert!(notices(&mut engine).is_empty());
    }

    #[tokio::test]
    async fn test_synchronous_test_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _rx) = engine(dir.path());
        let schema = TestSchema::extending(TestSchema::base(), "sync")
            .check_item("works", "It works")
            .async_test(false)
            .build();
        let factory = LocalTestType::new(schema, |cx| {
            cx.validate("works", true);
            Next::Continue
        });

        let id = engine
            .create_test(&factory, ArgumentSet::new(), ArgumentSet::new().into_source(), &[], Owner::Run)
            .unwrap();
        engine.run_test(id);

        let notices = notices(&mut engine);
        let kinds: Vec<_> = notices
            .iter()
            .filter(|n| matches!(n.event, TestEvent::Start { .. } | TestEvent::Stop { .. } | TestEvent::Done))
            .map(|n| n.event.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                TestEvent::Start { iteration: 1 },
                TestEvent::Stop { iteration: 1 },
                TestEvent::Done
            ]
        );
        let report = done_report(&notices).unwrap();
        assert_eq!(report.success_percentage, 100.0);
        assert_eq!(report.check(items::NO_TIMEOUT), Some(CheckResult::Success));
        assert!(!engine.contains(id));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _rx) = engine(dir.path());
        let schema = TestSchema::extending(TestSchema::base(), "waits").build();
        let factory = LocalTestType::new(schema, |_| Next::Continue);

        let id = engine
            .create_test(&factory, ArgumentSet::new(), ArgumentSet::new().into_source(), &[], Owner::Run)
            .unwrap();
        engine.run_test(id);
        assert_eq!(engine.state(id), Some(TestState::Running));

        engine.stop_test(id, StopReason::Completed);
        engine.stop_test(id, StopReason::Aborted);
        engine.stop_test(id, StopReason::Completed);

        let done = notices(&mut engine)
            .into_iter()
            .filter(|n| n.event == TestEvent::Done)
            .count();
        assert_eq!(done, 1);
    }

    #[tokio::test]
    async fn test_failed_setup_stops_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _rx) = engine(dir.path());
        let schema = TestSchema::extending(TestSchema::base(), "broken").build();
        let factory = LocalTestType::new(schema, |_| Next::Continue).with_set_up(|_| false);

        let id = engine
            .create_test(&factory, ArgumentSet::new(), ArgumentSet::new().into_source(), &[], Owner::Run)
            .unwrap();
        engine.run_test(id);

        let notices = notices(&mut engine);
        assert!(!notices.iter().any(|n| matches!(n.event, TestEvent::Start { .. })));
        let report = done_report(&notices).unwrap();
        assert_eq!(report.iterations[0].stop_reason, Some(StopReason::SetupFailed));
        assert_eq!(report.check(items::TEST_STARTED), Some(CheckResult::Skipped));
        assert!(report.success_percentage < 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_the_test() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, mut rx) = engine(dir.path());
        let schema = TestSchema::extending(TestSchema::base(), "slow")
            .timeout(Duration::from_secs(2))
            .build();
        let factory = LocalTestType::new(schema, |_| Next::Continue);

        let id = engine
            .create_test(&factory, ArgumentSet::new(), ArgumentSet::new().into_source(), &[], Owner::Run)
            .unwrap();
        engine.run_test(id);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, LoopEvent::Timer { kind: TimerKind::Test, .. }));
        engine.dispatch(event);

        let notices = notices(&mut engine);
        let report = done_report(&notices).unwrap();
        assert_eq!(report.check(items::NO_TIMEOUT), Some(CheckResult::Failure));
        assert_eq!(report.iterations[0].stop_reason, Some(StopReason::Timeout));
    }

    #[tokio::test]
    async fn test_iterations_follow_argument_source() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _rx) = engine(dir.path());
        let schema = TestSchema::extending(TestSchema::base(), "iterated")
            .argument("n", "Number")
            .check_item("even", "The number is even")
            .async_test(false)
            .build();
        let factory = LocalTestType::new(schema, |cx| {
            let n = cx.arguments().get("n").and_then(|v| v.as_i64()).unwrap_or(1);
            cx.validate("even", n % 2 == 0);
            Next::Continue
        });
        let sets: Vec<ArgumentSet> = (0..3).map(|n| ArgumentSet::new().with("n", n)).collect();

        let id = engine
            .create_test(&factory, ArgumentSet::new(), sets.into_source(), &[], Owner::Run)
            .unwrap();
        engine.run_test(id);

        let notices = notices(&mut engine);
        let report = done_report(&notices).unwrap();
        assert_eq!(report.iterations.len(), 3);
        let even: Vec<_> = report
            .iterations
            .iter()
            .map(|i| i.checklist["even"])
            .collect();
        assert_eq!(
            even,
            vec![CheckResult::Success, CheckResult::Failure, CheckResult::Success]
        );
        assert_eq!(report.iterations[1].arguments.get("n"), Some(&Value::from(1)));
        assert!(report.success_percentage < 100.0);
    }
}
