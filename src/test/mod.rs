//! Test instances and their lifecycle
//!
//! A test instance is a [`TestCore`] (state, checklist, timers, monitors)
//! driven by the lifecycle in [`lifecycle`] and a [`TestBody`] supplying
//! the behaviour of its kind: in-process ([`local`]), in a worker process
//! ([`remote`]) or made of other tests ([`crate::scenario`]).

pub mod lifecycle;
pub mod timer;

use std::sync::Arc;
use uuid::Uuid;

pub use self::core::{
    Aggregate, IterationReport, Owner, StopReason, TestCore, TestEvent, TestReport, TestState,
};
pub use arguments::{ArgumentList, ArgumentSet, ArgumentSource, IntoArgumentSource};
pub use checklist::CheckResult;
pub use lifecycle::Cx;
pub use local::LocalTestType;
pub use remote::{CommandTemplate, RemoteTestType};
pub use schema::TestSchema;

use crate::bus::BusEvent;
use crate::common::Result;
use crate::monitor::MonitorFactory;
use crate::supervisor::LaunchConfig;

/// Where a test's body runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Local,
    Remote,
    Scenario,
}

/// What a test body asks the lifecycle to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Nothing; wait for more events
    Continue,
    /// The asynchronous setup completed: start the first iteration
    Start,
    Stop(StopReason),
    /// Run the next iteration if one is due, otherwise tear down
    Advance,
    TearDown,
    /// The asynchronous teardown completed
    FinishTearDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TearDown {
    Done,
    /// The body reports [`Next::FinishTearDown`] later
    Pending,
}

/// Events delivered to a test body
#[derive(Debug)]
pub enum BodyInput {
    Poll,
    Reaped(Option<i32>),
    Bus(BusEvent),
    ChildDone(TestReport),
    StartNextChild,
    /// The body's own guard timer fired
    Guard { generation: u64 },
}

/// Behaviour of one kind of test
///
/// Every hook has a default, so a body only implements what it needs.
pub trait TestBody {
    fn launch_config(&mut self) -> Option<&mut LaunchConfig> {
        None
    }

    /// Returning false fails the test before it starts
    fn set_up(&mut self, _cx: &mut Cx<'_>) -> bool {
        true
    }

    /// Body of one iteration
    ///
    /// Tests whose schema is not asynchronous are stopped as completed
    /// when this returns [`Next::Continue`].
    fn test(&mut self, _cx: &mut Cx<'_>) -> Next {
        Next::Continue
    }

    fn on_stop(&mut self, _cx: &mut Cx<'_>) -> Next {
        Next::Advance
    }

    fn tear_down(&mut self, _cx: &mut Cx<'_>) -> TearDown {
        TearDown::Done
    }

    fn handle(&mut self, _cx: &mut Cx<'_>, input: BodyInput) -> Next {
        tracing::trace!(?input, "ignored body input");
        Next::Continue
    }

    /// Results of sub-tests, for bodies made of other tests
    fn aggregate(&self) -> Option<Aggregate> {
        None
    }
}

/// What a factory gets to build one instance
pub struct TestInit {
    pub uuid: Uuid,
    /// Arguments of the first iteration
    pub arguments: ArgumentSet,
    /// Monitors attached to the instance, forwarded to sub-tests
    pub monitors: Vec<Arc<dyn MonitorFactory>>,
}

/// A kind of test that can be scheduled
pub trait TestFactory {
    fn schema(&self) -> &Arc<TestSchema>;

    fn kind(&self) -> TestKind;

    fn create(&self, init: &TestInit) -> Result<Box<dyn TestBody>>;

    fn name(&self) -> &str {
        self.schema().name()
    }
}
