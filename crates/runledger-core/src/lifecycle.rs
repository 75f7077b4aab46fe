//! Run → suite → testcase state machine.
//!
//! The consumer owns a [`ProcessorState`] and is the only writer. Producers
//! read a lock-free copy through [`ObservedState`], which the consumer
//! republishes after every event.
//!
//! # States
//!
//! | State | Entered by | Left by |
//! |-------|-----------|---------|
//! | `initialized` | start, `end_run`, `leave_test_case` | `start_run`, `join_test_case` |
//! | `run_started` | `start_run`, `end_suite` | `start_suite`, `end_run` |
//! | `suite_started` | `start_suite`, `end_test_case` | `start_test_case`, `end_suite` |
//! | `test_case_started` | `start_test_case`, `join_test_case` | `end_test_case`, `leave_test_case` |

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::event::{EntityId, EventKind, JoinedTestcase};

// =============================================================================
// Lifecycle State
// =============================================================================

/// Position of the consumer in the run → suite → testcase hierarchy.
///
/// Ordered by depth so [`RequiredState::AtLeast`] can compare states.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    #[default]
    Initialized = 0,
    RunStarted = 1,
    SuiteStarted = 2,
    TestCaseStarted = 3,
}

impl LifecycleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::RunStarted => "run_started",
            Self::SuiteStarted => "suite_started",
            Self::TestCaseStarted => "test_case_started",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::RunStarted,
            2 => Self::SuiteStarted,
            3 => Self::TestCaseStarted,
            _ => Self::Initialized,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State constraint attached to each event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "state", rename_all = "snake_case")]
pub enum RequiredState {
    Any,
    Exactly(LifecycleState),
    AtLeast(LifecycleState),
}

impl RequiredState {
    #[must_use]
    pub fn admits(self, state: LifecycleState) -> bool {
        match self {
            Self::Any => true,
            Self::Exactly(required) => state == required,
            Self::AtLeast(required) => state >= required,
        }
    }
}

impl fmt::Display for RequiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any state"),
            Self::Exactly(state) => write!(f, "{state}"),
            Self::AtLeast(state) => write!(f, "{state} or deeper"),
        }
    }
}

/// Decision taken for an event before it touches the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Hold the event until its target exists.
    Defer,
    Reject,
}

/// Validate `kind` against `state`.
#[must_use]
pub fn admit(kind: EventKind, state: LifecycleState) -> Admission {
    if kind.required_state().admits(state) {
        Admission::Accept
    } else if kind.is_deferrable() && state < LifecycleState::SuiteStarted {
        Admission::Defer
    } else {
        Admission::Reject
    }
}

// =============================================================================
// Hook modes
// =============================================================================

/// Whether the run is inside an after-suite, after-class or after-method hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookModes {
    pub after_suite: bool,
    pub after_class: bool,
    pub after_method: bool,
}

impl HookModes {
    /// Apply a hook toggle event. Returns false for every other kind.
    pub fn apply(&mut self, kind: EventKind) -> bool {
        let (flag, value) = match kind {
            EventKind::StartAfterSuite => (&mut self.after_suite, true),
            EventKind::EndAfterSuite => (&mut self.after_suite, false),
            EventKind::StartAfterClass => (&mut self.after_class, true),
            EventKind::EndAfterClass => (&mut self.after_class, false),
            EventKind::StartAfterMethod => (&mut self.after_method, true),
            EventKind::EndAfterMethod => (&mut self.after_method, false),
            _ => return false,
        };
        *flag = value;
        true
    }
}

// =============================================================================
// Processor state
// =============================================================================

/// Testcase bookkeeping, including testcases joined from another process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseState {
    pub testcase_id: Option<EntityId>,
    pub last_executed_testcase_id: Option<EntityId>,
    /// Run of a joined testcase.
    pub run_id: Option<EntityId>,
}

impl TestcaseState {
    #[must_use]
    pub const fn is_joined(&self) -> bool {
        self.run_id.is_some()
    }
}

/// Everything the consumer knows about the run being recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorState {
    lifecycle: LifecycleState,
    run_id: Option<EntityId>,
    previous_run_id: Option<EntityId>,
    run_name: Option<String>,
    run_user_note: Option<String>,
    suite_id: Option<EntityId>,
    last_ended_suite_id: Option<EntityId>,
    testcase: TestcaseState,
    hooks: HookModes,
}

impl ProcessorState {
    #[must_use]
    pub const fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    #[must_use]
    pub const fn run_id(&self) -> Option<EntityId> {
        self.run_id
    }

    /// Run that ended last; a new `start_run` continues it.
    #[must_use]
    pub const fn previous_run_id(&self) -> Option<EntityId> {
        self.previous_run_id
    }

    #[must_use]
    pub fn run_name(&self) -> Option<&str> {
        self.run_name.as_deref()
    }

    #[must_use]
    pub fn run_user_note(&self) -> Option<&str> {
        self.run_user_note.as_deref()
    }

    #[must_use]
    pub const fn suite_id(&self) -> Option<EntityId> {
        self.suite_id
    }

    #[must_use]
    pub const fn last_ended_suite_id(&self) -> Option<EntityId> {
        self.last_ended_suite_id
    }

    #[must_use]
    pub const fn testcase(&self) -> &TestcaseState {
        &self.testcase
    }

    #[must_use]
    pub const fn testcase_id(&self) -> Option<EntityId> {
        self.testcase.testcase_id
    }

    #[must_use]
    pub const fn last_executed_testcase_id(&self) -> Option<EntityId> {
        self.testcase.last_executed_testcase_id
    }

    #[must_use]
    pub const fn hooks(&self) -> HookModes {
        self.hooks
    }

    pub(crate) fn hooks_mut(&mut self) -> &mut HookModes {
        &mut self.hooks
    }

    pub(crate) fn begin_run(&mut self, run_id: EntityId, run_name: &str) {
        self.run_id = Some(run_id);
        self.run_name = Some(run_name.to_string());
        self.run_user_note = None;
        self.suite_id = None;
        self.lifecycle = LifecycleState::RunStarted;
    }

    pub(crate) fn note_run_update(&mut self, run_name: Option<&str>, user_note: Option<&str>) {
        if let Some(name) = run_name {
            self.run_name = Some(name.to_string());
        }
        if let Some(note) = user_note {
            self.run_user_note = Some(note.to_string());
        }
    }

    pub(crate) fn end_run(&mut self) {
        self.previous_run_id = self.run_id.take().or(self.previous_run_id);
        self.suite_id = None;
        self.testcase.testcase_id = None;
        self.testcase.run_id = None;
        self.lifecycle = LifecycleState::Initialized;
    }

    pub(crate) fn begin_suite(&mut self, suite_id: EntityId) {
        self.suite_id = Some(suite_id);
        self.lifecycle = LifecycleState::SuiteStarted;
    }

    pub(crate) fn end_suite(&mut self, persisted: bool) {
        let suite_id = self.suite_id.take();
        if persisted {
            self.last_ended_suite_id = suite_id;
        }
        self.lifecycle = LifecycleState::RunStarted;
    }

    pub(crate) fn begin_testcase(&mut self, testcase_id: EntityId) {
        self.testcase.testcase_id = Some(testcase_id);
        self.lifecycle = LifecycleState::TestCaseStarted;
    }

    pub(crate) fn end_testcase(&mut self) {
        self.testcase.last_executed_testcase_id = self.testcase.testcase_id.take();
        self.lifecycle = LifecycleState::SuiteStarted;
    }

    pub(crate) fn join_testcase(&mut self, joined: JoinedTestcase) {
        self.run_id = Some(joined.run_id);
        self.testcase.run_id = Some(joined.run_id);
        self.testcase.testcase_id = Some(joined.testcase_id);
        self.lifecycle = LifecycleState::TestCaseStarted;
    }

    pub(crate) fn leave_testcase(&mut self) {
        self.testcase.testcase_id = None;
        self.testcase.run_id = None;
        self.run_id = None;
        self.suite_id = None;
        self.lifecycle = LifecycleState::Initialized;
    }
}

// =============================================================================
// Observed state
// =============================================================================

/// Lock-free snapshot of [`ProcessorState`] readable from any thread.
///
/// Ids are stored as `0` when absent; the sink never assigns `0`.
#[derive(Debug, Default)]
pub struct ObservedState {
    lifecycle: AtomicU8,
    run_id: AtomicI64,
    suite_id: AtomicI64,
    testcase_id: AtomicI64,
    last_executed_testcase_id: AtomicI64,
}

fn load_id(slot: &AtomicI64) -> Option<EntityId> {
    match slot.load(Ordering::Acquire) {
        0 => None,
        id => Some(id),
    }
}

impl ObservedState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the consumer's state. Called only by the consumer thread.
    pub fn publish(&self, state: &ProcessorState) {
        self.run_id.store(state.run_id.unwrap_or(0), Ordering::Release);
        self.suite_id
            .store(state.suite_id.unwrap_or(0), Ordering::Release);
        self.testcase_id
            .store(state.testcase_id().unwrap_or(0), Ordering::Release);
        self.last_executed_testcase_id.store(
            state.last_executed_testcase_id().unwrap_or(0),
            Ordering::Release,
        );
        self.lifecycle
            .store(state.lifecycle as u8, Ordering::Release);
    }

    #[must_use]
    pub fn lifecycle(&self) -> LifecycleState {
        LifecycleState::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn run_id(&self) -> Option<EntityId> {
        load_id(&self.run_id)
    }

    #[must_use]
    pub fn suite_id(&self) -> Option<EntityId> {
        load_id(&self.suite_id)
    }

    #[must_use]
    pub fn testcase_id(&self) -> Option<EntityId> {
        load_id(&self.testcase_id)
    }

    #[must_use]
    pub fn last_executed_testcase_id(&self) -> Option<EntityId> {
        load_id(&self.last_executed_testcase_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_state_admission() {
        let exactly = RequiredState::Exactly(LifecycleState::RunStarted);
        assert!(exactly.admits(LifecycleState::RunStarted));
        assert!(!exactly.admits(LifecycleState::SuiteStarted));

        let at_least = RequiredState::AtLeast(LifecycleState::SuiteStarted);
        assert!(!at_least.admits(LifecycleState::RunStarted));
        assert!(at_least.admits(LifecycleState::SuiteStarted));
        assert!(at_least.admits(LifecycleState::TestCaseStarted));

        assert!(RequiredState::Any.admits(LifecycleState::Initialized));
    }

    #[test]
    fn updates_before_their_target_are_deferred() {
        assert_eq!(
            admit(EventKind::UpdateSuite, LifecycleState::RunStarted),
            Admission::Defer
        );
        assert_eq!(
            admit(EventKind::UpdateRun, LifecycleState::Initialized),
            Admission::Defer
        );
        assert_eq!(
            admit(EventKind::UpdateSuite, LifecycleState::TestCaseStarted),
            Admission::Accept
        );
        assert_eq!(
            admit(EventKind::EndSuite, LifecycleState::RunStarted),
            Admission::Reject
        );
    }

    #[test]
    fn every_state_admits_some_event() {
        for state in [
            LifecycleState::Initialized,
            LifecycleState::RunStarted,
            LifecycleState::SuiteStarted,
            LifecycleState::TestCaseStarted,
        ] {
            let admitted = EventKind::ALL
                .into_iter()
                .filter(|k| admit(*k, state) == Admission::Accept)
                .count();
            assert!(admitted > 1, "{state} admits only {admitted} kinds");
        }
    }

    #[test]
    fn hook_toggles() {
        let mut hooks = HookModes::default();
        assert!(hooks.apply(EventKind::StartAfterMethod));
        assert!(hooks.after_method);
        assert!(hooks.apply(EventKind::EndAfterMethod));
        assert!(!hooks.after_method);
        assert!(hooks.apply(EventKind::StartAfterClass));
        assert!(hooks.after_class);
        assert!(!hooks.apply(EventKind::EndRun));
    }

    #[test]
    fn full_lifecycle_transitions() {
        let mut state = ProcessorState::default();
        state.begin_run(10, "nightly");
        assert_eq!(state.lifecycle(), LifecycleState::RunStarted);
        state.begin_suite(20);
        state.begin_testcase(30);
        assert_eq!(state.lifecycle(), LifecycleState::TestCaseStarted);

        state.end_testcase();
        assert_eq!(state.testcase_id(), None);
        assert_eq!(state.last_executed_testcase_id(), Some(30));
        assert_eq!(state.lifecycle(), LifecycleState::SuiteStarted);

        state.end_suite(true);
        assert_eq!(state.suite_id(), None);
        assert_eq!(state.last_ended_suite_id(), Some(20));

        state.end_run();
        assert_eq!(state.run_id(), None);
        assert_eq!(state.previous_run_id(), Some(10));
        assert_eq!(state.lifecycle(), LifecycleState::Initialized);
    }

    #[test]
    fn failed_end_suite_keeps_previous_last_ended() {
        let mut state = ProcessorState::default();
        state.begin_run(1, "r");
        state.begin_suite(2);
        state.end_suite(true);
        state.begin_suite(3);
        state.end_suite(false);
        assert_eq!(state.last_ended_suite_id(), Some(2));
        assert_eq!(state.lifecycle(), LifecycleState::RunStarted);
    }

    #[test]
    fn join_and_leave() {
        let mut state = ProcessorState::default();
        state.join_testcase(JoinedTestcase {
            run_id: 5,
            testcase_id: 6,
        });
        assert!(state.testcase().is_joined());
        assert_eq!(state.run_id(), Some(5));
        assert_eq!(state.lifecycle(), LifecycleState::TestCaseStarted);

        state.leave_testcase();
        assert!(!state.testcase().is_joined());
        assert_eq!(state.testcase_id(), None);
        assert_eq!(state.lifecycle(), LifecycleState::Initialized);
    }

    #[test]
    fn observed_state_mirrors_processor_state() {
        let observed = ObservedState::new();
        assert_eq!(observed.lifecycle(), LifecycleState::Initialized);
        assert_eq!(observed.run_id(), None);

        let mut state = ProcessorState::default();
        state.begin_run(7, "r");
        state.begin_suite(8);
        state.begin_testcase(9);
        observed.publish(&state);
        assert_eq!(observed.lifecycle(), LifecycleState::TestCaseStarted);
        assert_eq!(observed.run_id(), Some(7));
        assert_eq!(observed.suite_id(), Some(8));
        assert_eq!(observed.testcase_id(), Some(9));

        state.end_testcase();
        observed.publish(&state);
        assert_eq!(observed.testcase_id(), None);
        assert_eq!(observed.last_executed_testcase_id(), Some(9));
    }
}
