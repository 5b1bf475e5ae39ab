//! Tests made of other tests
//!
//! A scenario runs its sub-tests one at a time. What runs next is decided
//! by a [`ScenarioPolicy`]: it fills the pending queue at setup and is told
//! about every sub-test that finishes. The scenario stops once the policy
//! says so or nothing is pending, and scores the mean of its sub-tests.

use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use crate::common::Result;
use crate::monitor::MonitorFactory;
use crate::run::engine::LoopEvent;
use crate::test::schema::{args, extra, items};
use crate::test::{
    Aggregate, ArgumentSet, BodyInput, CheckResult, Cx, IntoArgumentSource, Next, Owner,
    StopReason, TearDown, TestBody, TestFactory, TestInit, TestKind, TestReport, TestSchema,
    TestState,
};

struct PendingSubTest {
    factory: Arc<dyn TestFactory>,
    arguments: ArgumentSet,
    monitors: Vec<Arc<dyn MonitorFactory>>,
    name: String,
}

/// Queue of sub-tests waiting to run
pub struct SubTests {
    pending: VecDeque<PendingSubTest>,
    arguments: ArgumentSet,
    monitors: Vec<Arc<dyn MonitorFactory>>,
    added: usize,
}

impl SubTests {
    fn new(arguments: ArgumentSet, monitors: Vec<Arc<dyn MonitorFactory>>) -> Self {
        Self {
            pending: VecDeque::new(),
            arguments,
            monitors,
            added: 0,
        }
    }

    /// Arguments of the scenario itself
    pub fn arguments(&self) -> &ArgumentSet {
        &self.arguments
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue a sub-test
    ///
    /// Arguments are narrowed to what the sub-test declares, except for
    /// scenarios which get everything. Without a `name` the sub-test is
    /// called `<n>.<test name>`. `position` defaults to the end of the
    /// queue. The scenario's monitors are attached to every sub-test.
    pub fn add_sub_test(
        &mut self,
        factory: Arc<dyn TestFactory>,
        arguments: &ArgumentSet,
        monitors: Vec<Arc<dyn MonitorFactory>>,
        position: Option<usize>,
        name: Option<String>,
    ) {
        self.added += 1;
        let name = name.unwrap_or_else(|| format!("{}.{}", self.added, factory.name()));
        let mut arguments = match factory.kind() {
            TestKind::Scenario => arguments.clone(),
            _ => arguments.filtered(|k| factory.schema().has_argument(k)),
        };
        arguments.insert(args::INSTANCE_NAME, name.clone());

        let mut all_monitors = self.monitors.clone();
        all_monitors.extend(monitors);

        let sub_test = PendingSubTest {
            factory,
            arguments,
            monitors: all_monitors,
            name,
        };
        match position {
            Some(index) if index < self.pending.len() => self.pending.insert(index, sub_test),
            _ => self.pending.push_back(sub_test),
        }
    }

    fn pop(&mut self) -> Option<PendingSubTest> {
        self.pending.pop_front()
    }
}

/// Decides which sub-tests a scenario runs
pub trait ScenarioPolicy {
    /// Queue the initial sub-tests; returning false fails the scenario
    fn set_up(&mut self, _sub_tests: &mut SubTests) -> bool {
        true
    }

    /// Returning false stops the scenario
    fn sub_test_done(&mut self, _sub_tests: &mut SubTests, _report: &TestReport) -> bool {
        true
    }
}

type PolicyFactory = Arc<dyn Fn() -> Box<dyn ScenarioPolicy>>;

/// A schedulable scenario
#[derive(Clone)]
pub struct ScenarioType {
    schema: Arc<TestSchema>,
    policy: PolicyFactory,
}

impl ScenarioType {
    /// `schema` should extend [`TestSchema::scenario`]
    pub fn new(
        schema: Arc<TestSchema>,
        policy: impl Fn() -> Box<dyn ScenarioPolicy> + 'static,
    ) -> Self {
        Self {
            schema,
            policy: Arc::new(policy),
        }
    }

    /// Run `tests` in order with the scenario's arguments
    pub fn list(name: &str, tests: Vec<Arc<dyn TestFactory>>) -> Self {
        let schema = TestSchema::extending(TestSchema::list_scenario(), name).build();
        Self::new(schema, move || {
            Box::new(ListScenario {
                tests: tests.clone(),
                fatal: true,
            })
        })
    }
}

impl std::fmt::Debug for ScenarioType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioType")
            .field("schema", &self.schema.name())
            .finish_non_exhaustive()
    }
}

impl TestFactory for ScenarioType {
    fn schema(&self) -> &Arc<TestSchema> {
        &self.schema
    }

    fn kind(&self) -> TestKind {
        TestKind::Scenario
    }

    fn create(&self, init: &TestInit) -> Result<Box<dyn TestBody>> {
        Ok(Box::new(Scenario {
            policy: (self.policy)(),
            sub_tests: SubTests::new(init.arguments.clone(), init.monitors.clone()),
            names: Vec::new(),
            executed: Vec::new(),
            current: None,
        }))
    }
}

/// Runs a fixed list of tests with identical arguments
pub struct ListScenario {
    tests: Vec<Arc<dyn TestFactory>>,
    fatal: bool,
}

impl ScenarioPolicy for ListScenario {
    fn set_up(&mut self, sub_tests: &mut SubTests) -> bool {
        self.fatal = sub_tests
            .arguments()
            .get_bool(args::FATAL_SUBTEST_FAILURE)
            .unwrap_or(true);
        let arguments = sub_tests.arguments().clone();
        for factory in &self.tests {
            sub_tests.add_sub_test(factory.clone(), &arguments, Vec::new(), None, None);
        }
        true
    }

    fn sub_test_done(&mut self, _sub_tests: &mut SubTests, report: &TestReport) -> bool {
        if self.fatal && !report.is_perfect() {
            tracing::info!(sub_test = report.name(), "sub-test failed, stopping the scenario");
            return false;
        }
        true
    }
}

struct Scenario {
    policy: Box<dyn ScenarioPolicy>,
    sub_tests: SubTests,
    names: Vec<String>,
    executed: Vec<TestReport>,
    current: Option<Uuid>,
}

impl Scenario {
    /// Start the next pending sub-test; false when none could be started
    fn start_next(&mut self, cx: &mut Cx<'_>) -> bool {
        let owner = Owner::Scenario(cx.uuid());
        while let Some(sub_test) = self.sub_tests.pop() {
            let created = cx.engine().create_test(
                sub_test.factory.as_ref(),
                sub_test.arguments,
                ArgumentSet::new().into_source(),
                &sub_test.monitors,
                owner,
            );
            match created {
                Ok(id) => {
                    tracing::info!(scenario = %cx.uuid(), sub_test = %sub_test.name, "starting sub-test");
                    self.names.push(sub_test.name);
                    self.current = Some(id);
                    cx.engine().launch(id);
                    return true;
                }
                Err(e) => {
                    tracing::error!(scenario = %cx.uuid(), sub_test = %sub_test.name, "could not create sub-test: {}", e);
                }
            }
        }
        false
    }

    fn child_done(&mut self, cx: &mut Cx<'_>, report: TestReport) -> Next {
        tracing::debug!(scenario = %cx.uuid(), sub_test = report.name(), success = report.success_percentage, "sub-test done");
        self.current = None;
        let proceed = self.policy.sub_test_done(&mut self.sub_tests, &report);
        self.executed.push(report);

        match cx.state() {
            TestState::TearingDown => Next::FinishTearDown,
            TestState::Running if proceed && self.sub_tests.pending() > 0 => {
                cx.handle().send(LoopEvent::StartNextChild {
                    scenario: cx.uuid(),
                });
                Next::Continue
            }
            TestState::Running => Next::Stop(StopReason::Completed),
            _ => Next::Continue,
        }
    }
}

impl TestBody for Scenario {
    fn set_up(&mut self, _cx: &mut Cx<'_>) -> bool {
        self.policy.set_up(&mut self.sub_tests)
    }

    fn test(&mut self, cx: &mut Cx<'_>) -> Next {
        if self.start_next(cx) {
            Next::Continue
        } else {
            Next::Stop(StopReason::Completed)
        }
    }

    fn tear_down(&mut self, cx: &mut Cx<'_>) -> TearDown {
        cx.extra_info(extra::SUBTEST_NAMES, self.names.clone());
        match self.current {
            Some(child) => {
                cx.engine().halt(child, StopReason::Aborted);
                TearDown::Pending
            }
            None => TearDown::Done,
        }
    }

    fn handle(&mut self, cx: &mut Cx<'_>, input: BodyInput) -> Next {
        match input {
            BodyInput::ChildDone(report) => self.child_done(cx, report),
            BodyInput::StartNextChild if cx.state() == TestState::Running => {
                if self.start_next(cx) {
                    Next::Continue
                } else {
                    Next::Stop(StopReason::Completed)
                }
            }
            other => {
                tracing::trace!(scenario = %cx.uuid(), ?other, "ignored input");
                Next::Continue
            }
        }
    }

    fn aggregate(&self) -> Option<Aggregate> {
        let success_percentage = if self.executed.is_empty() {
            0.0
        } else {
            self.executed
                .iter()
                .map(|r| r.success_percentage)
                .sum::<f64>()
                / self.executed.len() as f64
        };
        let unexpected_failures = self
            .executed
            .iter()
            .any(|r| r.check(items::NO_UNEXPECTED_FAILURES) == Some(CheckResult::Failure));
        Some(Aggregate {
            success_percentage,
            unexpected_failures,
            sub_tests: self.executed.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::server::BusServer;
    use crate::common::config::SupervisorConfig;
    use crate::run::engine::{Engine, LoopHandle, RunContext};
    use crate::test::{LocalTestType, TestEvent};
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::time::Duration;
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

    /// A synchronous test scoring `passed` out of `items`
    fn scoring(name: &str, items: usize, passed: usize) -> Arc<dyn TestFactory> {
        let mut builder = TestSchema::builder(name)
            .argument(args::INSTANCE_NAME, "Name")
            .async_test(false);
        for i in 0..items {
            builder = builder.check_item(&format!("item-{}", i), "An item");
        }
        Arc::new(LocalTestType::new(builder.build(), move |cx| {
            for i in 0..items {
                cx.validate(&format!("item-{}", i), i < passed);
            }
            Next::Continue
        }))
    }

    /// Run a scenario until the loop has nothing left to do
    async fn run_scenario(
        scenario: &ScenarioType,
        arguments: ArgumentSet,
    ) -> TestReport {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, mut rx) = engine(dir.path());
        let id = engine
            .create_test(scenario, arguments, ArgumentSet::new().into_source(), &[], Owner::Run)
            .unwrap();
        engine.run_test(id);

        loop {
            while let Some(notice) = engine.next_notice() {
                if notice.test == id && notice.event == TestEvent::Done {
                    return notice.report.as_ref().clone();
                }
            }
            let event = rx.recv().await.unwrap();
            engine.dispatch(event);
        }
    }

    #[tokio::test]
    async fn test_success_is_mean_of_sub_tests() {
        let scenario = ScenarioType::list(
            "mean",
            vec![scoring("full", 2, 2), scoring("half", 2, 1), scoring("none", 1, 0)],
        );
        let args = ArgumentSet::new().with(args::FATAL_SUBTEST_FAILURE, false);
        let report = run_scenario(&scenario, args).await;

        assert_eq!(report.sub_tests.len(), 3);
        let scores: Vec<f64> = report.sub_tests.iter().map(|r| r.success_percentage).collect();
        assert_eq!(scores, vec![100.0, 50.0, 0.0]);
        assert_eq!(report.success_percentage, 50.0);
        assert_eq!(
            report.extra_info(extra::SUBTEST_NAMES),
            Some(&Value::from(vec!["1.full", "2.half", "3.none"]))
        );
        assert_eq!(report.sub_tests[1].instance_name.as_deref(), Some("2.half"));
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_the_list() {
        let scenario = ScenarioType::list(
            "fatal",
            vec![scoring("full", 1, 1), scoring("broken", 2, 0), scoring("never", 1, 1)],
        );
        let report = run_scenario(&scenario, ArgumentSet::new()).await;

        assert_eq!(report.sub_tests.len(), 2);
        assert_eq!(report.success_percentage, 50.0);
    }

    #[tokio::test]
    async fn test_empty_scenario_scores_zero() {
        let scenario = ScenarioType::list("empty", Vec::new());
        let report = run_scenario(&scenario, ArgumentSet::new()).await;
        assert!(report.sub_tests.is_empty());
        assert_eq!(report.success_percentage, 0.0);
    }

    #[tokio::test]
    async fn test_unexpected_child_failure_is_surfaced() {
        let failing: Arc<dyn TestFactory> = Arc::new(LocalTestType::new(
            TestSchema::extending(TestSchema::base(), "failing")
                .check_item("works", "It works")
                .async_test(false)
                .build(),
            |cx| {
                cx.validate("works", false);
                Next::Continue
            },
        ));
        let scenario = ScenarioType::list("surfacing", vec![failing]);
        let report = run_scenario(&scenario, ArgumentSet::new()).await;

        assert_eq!(
            report.sub_tests[0].check(items::NO_UNEXPECTED_FAILURES),
            Some(CheckResult::Failure)
        );
        assert_eq!(
            report.check(items::NO_UNEXPECTED_FAILURES),
            Some(CheckResult::Failure)
        );
    }

    #[test]
    fn test_sub_test_arguments_are_filtered() {
        let mut sub_tests = SubTests::new(ArgumentSet::new(), Vec::new());
        let args = ArgumentSet::new().with("uri", "a.ogg").with("unknown", 1);
        let narrow = TestSchema::extending(TestSchema::base(), "narrow")
            .argument("uri", "Media")
            .build();
        let narrow: Arc<dyn TestFactory> = Arc::new(LocalTestType::new(narrow, |_| Next::Continue));
        let nested: Arc<dyn TestFactory> = Arc::new(ScenarioType::list("nested", Vec::new()));

        sub_tests.add_sub_test(narrow.clone(), &args, Vec::new(), None, None);
        sub_tests.add_sub_test(nested, &args, Vec::new(), None, None);
        sub_tests.add_sub_test(narrow, &args, Vec::new(), Some(0), Some("first".into()));

        let queued: Vec<_> = sub_tests.pending.iter().map(|p| p.name.clone()).collect();
        assert_eq!(queued, vec!["first", "1.narrow", "2.nested"]);

        let narrowed = &sub_tests.pending[1].arguments;
        assert_eq!(narrowed.get_str("uri"), Some("a.ogg"));
        assert!(!narrowed.contains_key("unknown"));
        assert_eq!(narrowed.get_str(args::INSTANCE_NAME), Some("1.narrow"));

        let full = &sub_tests.pending[2].arguments;
        assert!(full.contains_key("unknown"));
    }
}
