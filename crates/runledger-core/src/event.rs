//! Lifecycle events and the envelope that carries them through the queue.
//!
//! Every event is wrapped in an [`Envelope`] at submission time so the
//! consumer sees the producing thread and the producer-side timestamp, not
//! the time it happened to dequeue the event.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::bridge::WaitClass;
use crate::lifecycle::{LifecycleState, RequiredState};

/// Identifier assigned by the write sink to a run, suite, testcase,
/// load queue or checkpoint.
pub type EntityId = i64;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Outcome of a testcase or load queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Failed,
    Passed,
    Skipped,
    Running,
}

impl TestResult {
    /// Stored column value.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Failed => 0,
            Self::Passed => 1,
            Self::Skipped => 2,
            Self::Running => 4,
        }
    }

    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Failed),
            1 => Some(Self::Passed),
            2 => Some(Self::Skipped),
            4 => Some(Self::Running),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointResult {
    Failed,
    Passed,
}

impl CheckpointResult {
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Failed => 0,
            Self::Passed => 1,
        }
    }
}

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
    System,
}

impl MessageLevel {
    /// Stored column value.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Fatal => 1,
            Self::Error => 2,
            Self::Warn => 3,
            Self::Info => 4,
            Self::Debug => 5,
            Self::Trace => 6,
            Self::System => 7,
        }
    }

    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Fatal),
            2 => Some(Self::Error),
            3 => Some(Self::Warn),
            4 => Some(Self::Info),
            5 => Some(Self::Debug),
            6 => Some(Self::Trace),
            7 => Some(Self::System),
            _ => None,
        }
    }
}

/// Descriptive fields of a new run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunInfo {
    pub run_name: String,
    pub os_name: String,
    pub product_name: String,
    pub version_name: String,
    pub build_name: String,
    pub host_name: String,
}

/// Partial update of a run. `None` leaves the stored value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunUpdate {
    pub run_name: Option<String>,
    pub os_name: Option<String>,
    pub product_name: Option<String>,
    pub version_name: Option<String>,
    pub build_name: Option<String>,
    pub user_note: Option<String>,
    pub host_name: Option<String>,
}

impl RunUpdate {
    /// Update that only renames the run.
    #[must_use]
    pub fn rename(run_name: impl Into<String>) -> Self {
        Self {
            run_name: Some(run_name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Partial update of the current suite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteUpdate {
    pub suite_name: Option<String>,
    pub user_note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestcaseStart {
    pub suite_full_name: String,
    /// Simple name of the suite the testcase belongs to; when it resolves
    /// through the suite cache it overrides the current suite.
    pub suite_simple_name: Option<String>,
    pub scenario_name: String,
    pub scenario_description: String,
    pub testcase_name: String,
}

/// Partial update of a testcase. `None` leaves the stored value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestcaseUpdate {
    pub suite_full_name: Option<String>,
    pub scenario_name: Option<String>,
    pub scenario_description: Option<String>,
    pub testcase_name: Option<String>,
    pub user_note: Option<String>,
    pub result: Option<TestResult>,
}

/// Identifiers of a testcase owned by another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedTestcase {
    pub run_id: EntityId,
    pub testcase_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStart {
    pub name: String,
    pub thread: String,
    pub start_timestamp: i64,
    #[serde(default)]
    pub transfer_unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEnd {
    pub name: String,
    pub thread: String,
    pub end_timestamp: i64,
    #[serde(default)]
    pub transfer_size: i64,
    pub result: CheckpointResult,
}

/// A checkpoint recorded in one step, already measured by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSample {
    pub name: String,
    pub thread: String,
    pub start_timestamp: i64,
    pub response_time: i64,
    #[serde(default)]
    pub transfer_size: i64,
    #[serde(default)]
    pub transfer_unit: String,
    pub result: CheckpointResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatSample {
    pub statistic_id: i64,
    pub value: f64,
}

/// Statistics measured on one machine at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsBatch {
    pub monitored_machine: String,
    pub samples: Vec<StatSample>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub message: String,
    #[serde(default)]
    pub level: MessageLevel,
    #[serde(default)]
    pub escape_html: bool,
    /// Attach to the run regardless of the current lifecycle state.
    #[serde(default)]
    pub run_message: bool,
}

/// Every kind of event a producer may submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StartRun(RunInfo),
    EndRun,
    UpdateRun(RunUpdate),
    AddRunMetainfo { key: String, value: String },
    StartSuite { name: String, package: String },
    EndSuite,
    UpdateSuite(SuiteUpdate),
    ClearScenarioMetainfo,
    AddScenarioMetainfo { key: String, value: String },
    StartTestCase(TestcaseStart),
    EndTestCase { result: TestResult },
    UpdateTestCase(TestcaseUpdate),
    JoinTestCase(JoinedTestcase),
    LeaveTestCase,
    DeleteTestCase { testcase_id: EntityId },
    RememberLoadQueue { name: String, load_queue_id: EntityId },
    CleanupLoadQueue { name: String },
    EndLoadQueue { name: String, result: TestResult },
    RegisterThreadWithLoadQueue { thread: String, load_queue: String },
    StartCheckpoint(CheckpointStart),
    EndCheckpoint(CheckpointEnd),
    InsertCheckpoint(CheckpointSample),
    InsertSystemStat(StatisticsBatch),
    InsertUserActivityStat(StatisticsBatch),
    InsertMessage(LogMessage),
    StartAfterSuite,
    EndAfterSuite,
    StartAfterClass,
    EndAfterClass,
    StartAfterMethod,
    EndAfterMethod,
}

impl LifecycleEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StartRun(_) => EventKind::StartRun,
            Self::EndRun => EventKind::EndRun,
            Self::UpdateRun(_) => EventKind::UpdateRun,
            Self::AddRunMetainfo { .. } => EventKind::AddRunMetainfo,
            Self::StartSuite { .. } => EventKind::StartSuite,
            Self::EndSuite => EventKind::EndSuite,
            Self::UpdateSuite(_) => EventKind::UpdateSuite,
            Self::ClearScenarioMetainfo => EventKind::ClearScenarioMetainfo,
            Self::AddScenarioMetainfo { .. } => EventKind::AddScenarioMetainfo,
            Self::StartTestCase(_) => EventKind::StartTestCase,
            Self::EndTestCase { .. } => EventKind::EndTestCase,
            Self::UpdateTestCase(_) => EventKind::UpdateTestCase,
            Self::JoinTestCase(_) => EventKind::JoinTestCase,
            Self::LeaveTestCase => EventKind::LeaveTestCase,
            Self::DeleteTestCase { .. } => EventKind::DeleteTestCase,
            Self::RememberLoadQueue { .. } => EventKind::RememberLoadQueue,
            Self::CleanupLoadQueue { .. } => EventKind::CleanupLoadQueue,
            Self::EndLoadQueue { .. } => EventKind::EndLoadQueue,
            Self::RegisterThreadWithLoadQueue { .. } => EventKind::RegisterThreadWithLoadQueue,
            Self::StartCheckpoint(_) => EventKind::StartCheckpoint,
            Self::EndCheckpoint(_) => EventKind::EndCheckpoint,
            Self::InsertCheckpoint(_) => EventKind::InsertCheckpoint,
            Self::InsertSystemStat(_) => EventKind::InsertSystemStat,
            Self::InsertUserActivityStat(_) => EventKind::InsertUserActivityStat,
            Self::InsertMessage(_) => EventKind::InsertMessage,
            Self::StartAfterSuite => EventKind::StartAfterSuite,
            Self::EndAfterSuite => EventKind::EndAfterSuite,
            Self::StartAfterClass => EventKind::StartAfterClass,
            Self::EndAfterClass => EventKind::EndAfterClass,
            Self::StartAfterMethod => EventKind::StartAfterMethod,
            Self::EndAfterMethod => EventKind::EndAfterMethod,
        }
    }

    /// Convenience constructor for a plain testcase/suite/run message.
    #[must_use]
    pub fn message(level: MessageLevel, text: impl Into<String>) -> Self {
        Self::InsertMessage(LogMessage {
            message: text.into(),
            level,
            escape_html: false,
            run_message: false,
        })
    }
}

/// Payload-free discriminant of a [`LifecycleEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StartRun,
    EndRun,
    UpdateRun,
    AddRunMetainfo,
    StartSuite,
    EndSuite,
    UpdateSuite,
    ClearScenarioMetainfo,
    AddScenarioMetainfo,
    StartTestCase,
    EndTestCase,
    UpdateTestCase,
    JoinTestCase,
    LeaveTestCase,
    DeleteTestCase,
    RememberLoadQueue,
    CleanupLoadQueue,
    EndLoadQueue,
    RegisterThreadWithLoadQueue,
    StartCheckpoint,
    EndCheckpoint,
    InsertCheckpoint,
    InsertSystemStat,
    InsertUserActivityStat,
    InsertMessage,
    StartAfterSuite,
    EndAfterSuite,
    StartAfterClass,
    EndAfterClass,
    StartAfterMethod,
    EndAfterMethod,
}

impl EventKind {
    pub const ALL: [Self; 31] = [
        Self::StartRun,
        Self::EndRun,
        Self::UpdateRun,
        Self::AddRunMetainfo,
        Self::StartSuite,
        Self::EndSuite,
        Self::UpdateSuite,
        Self::ClearScenarioMetainfo,
        Self::AddScenarioMetainfo,
        Self::StartTestCase,
        Self::EndTestCase,
        Self::UpdateTestCase,
        Self::JoinTestCase,
        Self::LeaveTestCase,
        Self::DeleteTestCase,
        Self::RememberLoadQueue,
        Self::CleanupLoadQueue,
        Self::EndLoadQueue,
        Self::RegisterThreadWithLoadQueue,
        Self::StartCheckpoint,
        Self::EndCheckpoint,
        Self::InsertCheckpoint,
        Self::InsertSystemStat,
        Self::InsertUserActivityStat,
        Self::InsertMessage,
        Self::StartAfterSuite,
        Self::EndAfterSuite,
        Self::StartAfterClass,
        Self::EndAfterClass,
        Self::StartAfterMethod,
        Self::EndAfterMethod,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartRun => "start_run",
            Self::EndRun => "end_run",
            Self::UpdateRun => "update_run",
            Self::AddRunMetainfo => "add_run_metainfo",
            Self::StartSuite => "start_suite",
            Self::EndSuite => "end_suite",
            Self::UpdateSuite => "update_suite",
            Self::ClearScenarioMetainfo => "clear_scenario_metainfo",
            Self::AddScenarioMetainfo => "add_scenario_metainfo",
            Self::StartTestCase => "start_test_case",
            Self::EndTestCase => "end_test_case",
            Self::UpdateTestCase => "update_test_case",
            Self::JoinTestCase => "join_test_case",
            Self::LeaveTestCase => "leave_test_case",
            Self::DeleteTestCase => "delete_test_case",
            Self::RememberLoadQueue => "remember_load_queue",
            Self::CleanupLoadQueue => "cleanup_load_queue",
            Self::EndLoadQueue => "end_load_queue",
            Self::RegisterThreadWithLoadQueue => "register_thread_with_load_queue",
            Self::StartCheckpoint => "start_checkpoint",
            Self::EndCheckpoint => "end_checkpoint",
            Self::InsertCheckpoint => "insert_checkpoint",
            Self::InsertSystemStat => "insert_system_stat",
            Self::InsertUserActivityStat => "insert_user_activity_stat",
            Self::InsertMessage => "insert_message",
            Self::StartAfterSuite => "start_after_suite",
            Self::EndAfterSuite => "end_after_suite",
            Self::StartAfterClass => "start_after_class",
            Self::EndAfterClass => "end_after_class",
            Self::StartAfterMethod => "start_after_method",
            Self::EndAfterMethod => "end_after_method",
        }
    }

    /// Lifecycle state(s) in which the event may be processed.
    #[must_use]
    pub const fn required_state(self) -> RequiredState {
        use LifecycleState::{Initialized, RunStarted, SuiteStarted, TestCaseStarted};
        match self {
            Self::StartRun | Self::JoinTestCase => RequiredState::Exactly(Initialized),
            Self::EndRun | Self::StartSuite => RequiredState::Exactly(RunStarted),
            Self::UpdateRun
            | Self::AddRunMetainfo
            | Self::StartAfterSuite
            | Self::EndAfterSuite
            | Self::StartAfterClass
            | Self::EndAfterClass
            | Self::StartAfterMethod
            | Self::EndAfterMethod
            | Self::InsertSystemStat
            | Self::InsertUserActivityStat => RequiredState::AtLeast(RunStarted),
            Self::EndSuite | Self::StartTestCase => RequiredState::Exactly(SuiteStarted),
            Self::UpdateSuite | Self::UpdateTestCase => RequiredState::AtLeast(SuiteStarted),
            Self::EndTestCase
            | Self::LeaveTestCase
            | Self::ClearScenarioMetainfo
            | Self::AddScenarioMetainfo
            | Self::RememberLoadQueue
            | Self::CleanupLoadQueue
            | Self::EndLoadQueue
            | Self::RegisterThreadWithLoadQueue
            | Self::StartCheckpoint
            | Self::EndCheckpoint
            | Self::InsertCheckpoint => RequiredState::Exactly(TestCaseStarted),
            Self::InsertMessage | Self::DeleteTestCase => RequiredState::Any,
        }
    }

    /// Whether the sink may buffer the write in batch mode.
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        matches!(
            self,
            Self::InsertMessage
                | Self::InsertCheckpoint
                | Self::InsertSystemStat
                | Self::InsertUserActivityStat
        )
    }

    /// Events whose producer blocks until the consumer has handled them.
    #[must_use]
    pub const fn wait_class(self) -> Option<WaitClass> {
        match self {
            Self::StartRun | Self::StartTestCase | Self::EndTestCase => Some(WaitClass::Short),
            Self::EndRun => Some(WaitClass::Long),
            _ => None,
        }
    }

    /// Events that may arrive before their target exists and are replayed later.
    #[must_use]
    pub const fn is_deferrable(self) -> bool {
        matches!(self, Self::UpdateRun | Self::UpdateSuite)
    }

    /// End events advance the state even when the sink fails.
    #[must_use]
    pub const fn ends_scope(self) -> bool {
        matches!(self, Self::EndRun | Self::EndSuite | Self::EndTestCase)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event stamped with its producer's thread name and submission time.
///
/// Fields are private: an envelope is immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    event: LifecycleEvent,
    producer_thread: String,
    timestamp_ms: i64,
}

impl Envelope {
    #[must_use]
    pub fn new(event: LifecycleEvent, producer_thread: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            event,
            producer_thread: producer_thread.into(),
            timestamp_ms,
        }
    }

    /// Stamp `event` with the calling thread and the current time.
    #[must_use]
    pub fn capture(event: LifecycleEvent) -> Self {
        let current = std::thread::current();
        let producer_thread = current
            .name()
            .map_or_else(|| format!("{:?}", current.id()), str::to_string);
        Self::new(event, producer_thread, now_ms())
    }

    #[must_use]
    pub const fn event(&self) -> &LifecycleEvent {
        &self.event
    }

    #[must_use]
    pub fn producer_thread(&self) -> &str {
        &self.producer_thread
    }

    #[must_use]
    pub const fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}
