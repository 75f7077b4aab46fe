//! The durable write sink the processor records into.
//!
//! The processor never retries: a sink either performs the write or returns a
//! [`SinkError`] whose [`class`](SinkError::class) tells the processor whether
//! the failure may come from a row deleted behind its back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{
    CheckpointEnd, CheckpointSample, CheckpointStart, EntityId, MessageLevel, RunInfo, RunUpdate,
    StatisticsBatch, SuiteUpdate, TestResult, TestcaseStart, TestcaseUpdate,
};

pub use crate::error::{FailedWrite, SinkError, SinkErrorClass};

pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Kind of report row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Run,
    Suite,
    Testcase,
    LoadQueue,
    Checkpoint,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Run => "run",
            Self::Suite => "suite",
            Self::Testcase => "testcase",
            Self::LoadQueue => "load_queue",
            Self::Checkpoint => "checkpoint",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkBackendKind {
    Memory,
    Sqlite,
}

impl SinkBackendKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsKind {
    System,
    UserActivity,
}

impl StatisticsKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::UserActivity => "user_activity",
        }
    }
}

/// A started checkpoint, as returned by the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: EntityId,
    pub load_queue_id: EntityId,
    pub name: String,
    pub thread: String,
    pub start_timestamp: i64,
    pub transfer_unit: String,
}

impl CheckpointInfo {
    /// Elapsed milliseconds between start and `end_timestamp`, never negative.
    #[must_use]
    pub fn response_time(&self, end_timestamp: i64) -> i64 {
        (end_timestamp - self.start_timestamp).max(0)
    }
}

/// Report level a message is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", content = "id", rename_all = "snake_case")]
pub enum MessageParent {
    Run(EntityId),
    Suite(EntityId),
    Testcase(EntityId),
}

impl MessageParent {
    #[must_use]
    pub const fn entity(self) -> EntityKind {
        match self {
            Self::Run(_) => EntityKind::Run,
            Self::Suite(_) => EntityKind::Suite,
            Self::Testcase(_) => EntityKind::Testcase,
        }
    }

    #[must_use]
    pub const fn id(self) -> EntityId {
        match self {
            Self::Run(id) | Self::Suite(id) | Self::Testcase(id) => id,
        }
    }
}

/// A message row ready to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub text: String,
    pub level: MessageLevel,
    pub escape_html: bool,
    pub machine: String,
    pub thread: String,
    pub timestamp_ms: i64,
}

/// Storage operations the processor needs.
///
/// Every write takes a `batch` flag: when set, the sink may buffer the write
/// until [`flush_cache`](WriteSink::flush_cache).
pub trait WriteSink: Send {
    fn backend_kind(&self) -> SinkBackendKind;

    /// Validate the backing store before the first run is created.
    fn run_db_sanity_check(&mut self) -> SinkResult<()>;

    fn start_run(&mut self, run: &RunInfo, timestamp_ms: i64, batch: bool)
    -> SinkResult<EntityId>;

    fn end_run(&mut self, run_id: EntityId, timestamp_ms: i64, batch: bool) -> SinkResult<()>;

    fn update_run(&mut self, run_id: EntityId, update: &RunUpdate, batch: bool) -> SinkResult<()>;

    fn add_run_metainfo(
        &mut self,
        run_id: EntityId,
        key: &str,
        value: &str,
        batch: bool,
    ) -> SinkResult<()>;

    fn start_suite(
        &mut self,
        run_id: EntityId,
        name: &str,
        package: &str,
        timestamp_ms: i64,
        batch: bool,
    ) -> SinkResult<EntityId>;

    fn end_suite(&mut self, suite_id: EntityId, timestamp_ms: i64, batch: bool) -> SinkResult<()>;

    fn update_suite(
        &mut self,
        suite_id: EntityId,
        update: &SuiteUpdate,
        batch: bool,
    ) -> SinkResult<()>;

    fn start_testcase(
        &mut self,
        suite_id: EntityId,
        testcase: &TestcaseStart,
        timestamp_ms: i64,
        batch: bool,
    ) -> SinkResult<EntityId>;

    fn end_testcase(
        &mut self,
        testcase_id: EntityId,
        result: TestResult,
        timestamp_ms: i64,
        batch: bool,
    ) -> SinkResult<()>;

    fn update_testcase(
        &mut self,
        testcase_id: EntityId,
        update: &TestcaseUpdate,
        batch: bool,
    ) -> SinkResult<()>;

    fn delete_testcases(&mut self, testcase_ids: &[EntityId]) -> SinkResult<()>;

    fn add_scenario_metainfo(
        &mut self,
        testcase_id: EntityId,
        key: &str,
        value: &str,
        batch: bool,
    ) -> SinkResult<()>;

    fn clear_scenario_metainfo(&mut self, testcase_id: EntityId, batch: bool) -> SinkResult<()>;

    fn start_checkpoint(
        &mut self,
        load_queue_id: EntityId,
        checkpoint: &CheckpointStart,
        batch: bool,
    ) -> SinkResult<CheckpointInfo>;

    fn end_checkpoint(
        &mut self,
        started: &CheckpointInfo,
        end: &CheckpointEnd,
        batch: bool,
    ) -> SinkResult<()>;

    fn insert_checkpoint(
        &mut self,
        load_queue_id: EntityId,
        sample: &CheckpointSample,
        batch: bool,
    ) -> SinkResult<()>;

    fn end_load_queue(
        &mut self,
        load_queue_id: EntityId,
        result: TestResult,
        timestamp_ms: i64,
        batch: bool,
    ) -> SinkResult<()>;

    fn insert_message(
        &mut self,
        testcase_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()>;

    fn insert_run_message(
        &mut self,
        run_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()>;

    fn insert_suite_message(
        &mut self,
        suite_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()>;

    fn insert_statistics(
        &mut self,
        testcase_id: EntityId,
        kind: StatisticsKind,
        stats: &StatisticsBatch,
        batch: bool,
    ) -> SinkResult<()>;

    fn is_run_present(&mut self, run_id: EntityId) -> SinkResult<bool>;

    fn is_suite_present(&mut self, suite_id: EntityId) -> SinkResult<bool>;

    fn is_testcase_present(&mut self, testcase_id: EntityId) -> SinkResult<bool>;

    /// Write out everything buffered by batched calls.
    fn flush_cache(&mut self) -> SinkResult<()>;

    fn delete_testcase(&mut self, testcase_id: EntityId) -> SinkResult<()> {
        self.delete_testcases(&[testcase_id])
    }

    fn insert_system_statistics(
        &mut self,
        testcase_id: EntityId,
        stats: &StatisticsBatch,
        batch: bool,
    ) -> SinkResult<()> {
        self.insert_statistics(testcase_id, StatisticsKind::System, stats, batch)
    }

    fn insert_user_activity_statistics(
        &mut self,
        testcase_id: EntityId,
        stats: &StatisticsBatch,
        batch: bool,
    ) -> SinkResult<()> {
        self.insert_statistics(testcase_id, StatisticsKind::UserActivity, stats, batch)
    }

    /// Presence of a parent row; load queues and checkpoints are not tracked.
    fn is_present(&mut self, entity: EntityKind, id: EntityId) -> SinkResult<bool> {
        match entity {
            EntityKind::Run => self.is_run_present(id),
            EntityKind::Suite => self.is_suite_present(id),
            EntityKind::Testcase => self.is_testcase_present(id),
            EntityKind::LoadQueue | EntityKind::Checkpoint => Ok(true),
        }
    }
}
