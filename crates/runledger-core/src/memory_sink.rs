//! In-memory write sink.
//!
//! Keeps the report in ordered maps, enforces the same parent/child
//! references as the SQLite backend and records every call. Failures and
//! latency can be injected per operation, and rows can be removed behind the
//! processor's back to simulate concurrent deletion.
//!
//! Clones share the same store, so a test can keep a handle while the
//! processor owns another.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::{
    CheckpointEnd, CheckpointResult, CheckpointSample, CheckpointStart, EntityId, RunInfo,
    RunUpdate, StatisticsBatch, SuiteUpdate, TestResult, TestcaseStart, TestcaseUpdate,
};
use crate::sink::{
    CheckpointInfo, EntityKind, FailedWrite, MessageParent, MessageRecord, SinkBackendKind,
    SinkError, SinkResult, StatisticsKind, WriteSink,
};

/// Sink operation, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkOp {
    RunDbSanityCheck,
    StartRun,
    EndRun,
    UpdateRun,
    AddRunMetainfo,
    StartSuite,
    EndSuite,
    UpdateSuite,
    StartTestcase,
    EndTestcase,
    UpdateTestcase,
    DeleteTestcases,
    AddScenarioMetainfo,
    ClearScenarioMetainfo,
    StartCheckpoint,
    EndCheckpoint,
    InsertCheckpoint,
    EndLoadQueue,
    InsertMessage,
    InsertRunMessage,
    InsertSuiteMessage,
    InsertStatistics,
    IsRunPresent,
    IsSuitePresent,
    IsTestcasePresent,
    FlushCache,
}

impl SinkOp {
    /// Operations whose target id is a testcase.
    #[must_use]
    pub const fn targets_testcase(self) -> bool {
        matches!(
            self,
            Self::EndTestcase
                | Self::UpdateTestcase
                | Self::AddScenarioMetainfo
                | Self::ClearScenarioMetainfo
                | Self::InsertMessage
                | Self::InsertStatistics
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkCall {
    pub op: SinkOp,
    pub target: Option<EntityId>,
    pub batch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: EntityId,
    pub run_name: String,
    pub os_name: String,
    pub product_name: String,
    pub version_name: String,
    pub build_name: String,
    pub host_name: String,
    pub user_note: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub metainfo: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteRow {
    pub suite_id: EntityId,
    pub run_id: EntityId,
    pub name: String,
    pub package: String,
    pub user_note: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseRow {
    pub testcase_id: EntityId,
    pub suite_id: EntityId,
    pub suite_full_name: String,
    pub scenario_name: String,
    pub scenario_description: String,
    pub testcase_name: String,
    pub user_note: Option<String>,
    pub result: Option<TestResult>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub scenario_metainfo: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub parent: MessageParent,
    pub record: MessageRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub checkpoint_id: EntityId,
    pub load_queue_id: EntityId,
    pub name: String,
    pub thread: String,
    pub start_timestamp: i64,
    pub response_time: Option<i64>,
    pub transfer_size: i64,
    pub transfer_unit: String,
    pub result: Option<CheckpointResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadQueueRow {
    pub load_queue_id: EntityId,
    pub result: TestResult,
    pub ended_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRow {
    pub testcase_id: EntityId,
    pub kind: StatisticsKind,
    pub stats: StatisticsBatch,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Message(MessageParent, MessageRecord),
    Statistics(EntityId, StatisticsKind, StatisticsBatch),
    Checkpoint(EntityId, CheckpointSample),
}

impl PendingWrite {
    fn parent(&self) -> (EntityKind, EntityId) {
        match self {
            Self::Message(parent, _) => (parent.entity(), parent.id()),
            Self::Statistics(testcase_id, ..) => (EntityKind::Testcase, *testcase_id),
            Self::Checkpoint(load_queue_id, _) => (EntityKind::LoadQueue, *load_queue_id),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    next_id: EntityId,
    runs: BTreeMap<EntityId, RunRow>,
    suites: BTreeMap<EntityId, SuiteRow>,
    testcases: BTreeMap<EntityId, TestcaseRow>,
    messages: Vec<MessageRow>,
    checkpoints: BTreeMap<EntityId, CheckpointRow>,
    load_queues: BTreeMap<EntityId, LoadQueueRow>,
    statistics: Vec<StatisticsRow>,
    pending: Vec<PendingWrite>,
    calls: Vec<SinkCall>,
    failures: HashMap<SinkOp, VecDeque<SinkError>>,
    latency: HashMap<SinkOp, Duration>,
    sanity_error: Option<SinkError>,
}

fn missing(entity: EntityKind, id: EntityId) -> SinkError {
    SinkError::ReferentialIntegrity {
        entity,
        message: format!("{entity} {id} does not exist"),
    }
}

impl MemoryStore {
    fn allocate(&mut self) -> EntityId {
        self.next_id += 1;
        self.next_id
    }

    fn testcase_mut(&mut self, testcase_id: EntityId) -> SinkResult<&mut TestcaseRow> {
        self.testcases
            .get_mut(&testcase_id)
            .ok_or_else(|| missing(EntityKind::Testcase, testcase_id))
    }

    fn check_parent(&self, parent: MessageParent) -> SinkResult<()> {
        let present = match parent {
            MessageParent::Run(id) => self.runs.contains_key(&id),
            MessageParent::Suite(id) => self.suites.contains_key(&id),
            MessageParent::Testcase(id) => self.testcases.contains_key(&id),
        };
        if present {
            Ok(())
        } else {
            Err(missing(parent.entity(), parent.id()))
        }
    }

    fn apply(&mut self, write: PendingWrite) -> SinkResult<()> {
        match write {
            PendingWrite::Message(parent, record) => {
                self.check_parent(parent)?;
                self.messages.push(MessageRow { parent, record });
            }
            PendingWrite::Statistics(testcase_id, kind, stats) => {
                if !self.testcases.contains_key(&testcase_id) {
                    return Err(missing(EntityKind::Testcase, testcase_id));
                }
                self.statistics.push(StatisticsRow {
                    testcase_id,
                    kind,
                    stats,
                });
            }
            PendingWrite::Checkpoint(load_queue_id, sample) => {
                let checkpoint_id = self.allocate();
                self.checkpoints.insert(
                    checkpoint_id,
                    CheckpointRow {
                        checkpoint_id,
                        load_queue_id,
                        name: sample.name,
                        thread: sample.thread,
                        start_timestamp: sample.start_timestamp,
                        response_time: Some(sample.response_time),
                        transfer_size: sample.transfer_size,
                        transfer_unit: sample.transfer_unit,
                        result: Some(sample.result),
                    },
                );
            }
        }
        Ok(())
    }

    fn write(&mut self, write: PendingWrite, batch: bool) -> SinkResult<()> {
        if batch {
            self.pending.push(write);
            Ok(())
        } else {
            self.apply(write)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call, apply injected latency and failures.
    fn enter(&self, op: SinkOp, target: Option<EntityId>, batch: bool) -> SinkResult<()> {
        let (latency, failure) = {
            let mut store = self.store();
            store.calls.push(SinkCall { op, target, batch });
            let latency = store.latency.get(&op).copied();
            let failure = store.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (latency, failure)
        };
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        failure.map_or(Ok(()), Err)
    }

    // -- Fault injection --

    /// Fail the next call of `op` with `err`. Queued failures fire in order.
    pub fn fail_next(&self, op: SinkOp, err: SinkError) {
        self.store().failures.entry(op).or_default().push_back(err);
    }

    /// Delay every call of `op`.
    pub fn set_latency(&self, op: SinkOp, latency: Duration) {
        self.store().latency.insert(op, latency);
    }

    pub fn fail_sanity_check(&self, err: SinkError) {
        self.store().sanity_error = Some(err);
    }

    /// Remove a testcase row as if another client deleted it.
    pub fn forget_testcase(&self, testcase_id: EntityId) {
        let mut store = self.store();
        store.testcases.remove(&testcase_id);
        store
            .messages
            .retain(|m| m.parent != MessageParent::Testcase(testcase_id));
    }

    pub fn forget_suite(&self, suite_id: EntityId) {
        self.store().suites.remove(&suite_id);
    }

    pub fn forget_run(&self, run_id: EntityId) {
        self.store().runs.remove(&run_id);
    }

    // -- Inspection --

    #[must_use]
    pub fn calls(&self) -> Vec<SinkCall> {
        self.store().calls.clone()
    }

    #[must_use]
    pub fn count(&self, op: SinkOp) -> usize {
        self.store().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.store().calls.clear();
    }

    #[must_use]
    pub fn runs(&self) -> Vec<RunRow> {
        self.store().runs.values().cloned().collect()
    }

    #[must_use]
    pub fn run(&self, run_id: EntityId) -> Option<RunRow> {
        self.store().runs.get(&run_id).cloned()
    }

    #[must_use]
    pub fn suites(&self) -> Vec<SuiteRow> {
        self.store().suites.values().cloned().collect()
    }

    #[must_use]
    pub fn suite(&self, suite_id: EntityId) -> Option<SuiteRow> {
        self.store().suites.get(&suite_id).cloned()
    }

    #[must_use]
    pub fn testcases(&self) -> Vec<TestcaseRow> {
        self.store().testcases.values().cloned().collect()
    }

    #[must_use]
    pub fn testcase(&self, testcase_id: EntityId) -> Option<TestcaseRow> {
        self.store().testcases.get(&testcase_id).cloned()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<MessageRow> {
        self.store().messages.clone()
    }

    #[must_use]
    pub fn checkpoints(&self) -> Vec<CheckpointRow> {
        self.store().checkpoints.values().cloned().collect()
    }

    #[must_use]
    pub fn load_queues(&self) -> Vec<LoadQueueRow> {
        self.store().load_queues.values().copied().collect()
    }

    #[must_use]
    pub fn statistics(&self) -> Vec<StatisticsRow> {
        self.store().statistics.clone()
    }

    /// Buffered writes not yet flushed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.store().pending.len()
    }
}

impl WriteSink for MemorySink {
    fn backend_kind(&self) -> SinkBackendKind {
        SinkBackendKind::Memory
    }

    fn run_db_sanity_check(&mut self) -> SinkResult<()> {
        self.enter(SinkOp::RunDbSanityCheck, None, false)?;
        self.store().sanity_error.clone().map_or(Ok(()), Err)
    }

    fn start_run(&mut self, run: &RunInfo, timestamp_ms: i64, batch: bool) -> SinkResult<EntityId> {
        self.enter(SinkOp::StartRun, None, batch)?;
        let mut store = self.store();
        let run_id = store.allocate();
        store.runs.insert(
            run_id,
            RunRow {
                run_id,
                run_name: run.run_name.clone(),
                os_name: run.os_name.clone(),
                product_name: run.product_name.clone(),
                version_name: run.version_name.clone(),
                build_name: run.build_name.clone(),
                host_name: run.host_name.clone(),
                user_note: None,
                started_at: timestamp_ms,
                ended_at: None,
                metainfo: Vec::new(),
            },
        );
        Ok(run_id)
    }

    fn end_run(&mut self, run_id: EntityId, timestamp_ms: i64, batch: bool) -> SinkResult<()> {
        self.enter(SinkOp::EndRun, Some(run_id), batch)?;
        let mut store = self.store();
        let run = store
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| missing(EntityKind::Run, run_id))?;
        run.ended_at = Some(timestamp_ms);
        Ok(())
    }

    fn update_run(&mut self, run_id: EntityId, update: &RunUpdate, batch: bool) -> SinkResult<()> {
        self.enter(SinkOp::UpdateRun, Some(run_id), batch)?;
        let mut store = self.store();
        let run = store
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| missing(EntityKind::Run, run_id))?;
        let fields = [
            (&mut run.run_name, &update.run_name),
            (&mut run.os_name, &update.os_name),
            (&mut run.product_name, &update.product_name),
            (&mut run.version_name, &update.version_name),
            (&mut run.build_name, &update.build_name),
            (&mut run.host_name, &update.host_name),
        ];
        for (column, value) in fields {
            if let Some(value) = value {
                column.clone_from(value);
            }
        }
        if let Some(note) = &update.user_note {
            run.user_note = Some(note.clone());
        }
        Ok(())
    }

    fn add_run_metainfo(
        &mut self,
        run_id: EntityId,
        key: &str,
        value: &str,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::AddRunMetainfo, Some(run_id), batch)?;
        let mut store = self.store();
        let run = store
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| missing(EntityKind::Run, run_id))?;
        run.metainfo.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn start_suite(
        &mut self,
        run_id: EntityId,
        name: &str,
        package: &str,
        timestamp_ms: i64,
        batch: bool,
    ) -> SinkResult<EntityId> {
        self.enter(SinkOp::StartSuite, Some(run_id), batch)?;
        let mut store = self.store();
        if !store.runs.contains_key(&run_id) {
            return Err(missing(EntityKind::Run, run_id));
        }
        let suite_id = store.allocate();
        store.suites.insert(
            suite_id,
            SuiteRow {
                suite_id,
                run_id,
                name: name.to_string(),
                package: package.to_string(),
                user_note: None,
                started_at: timestamp_ms,
                ended_at: None,
            },
        );
        Ok(suite_id)
    }

    fn end_suite(&mut self, suite_id: EntityId, timestamp_ms: i64, batch: bool) -> SinkResult<()> {
        self.enter(SinkOp::EndSuite, Some(suite_id), batch)?;
        let mut store = self.store();
        let suite = store
            .suites
            .get_mut(&suite_id)
            .ok_or_else(|| missing(EntityKind::Suite, suite_id))?;
        suite.ended_at = Some(timestamp_ms);
        Ok(())
    }

    fn update_suite(
        &mut self,
        suite_id: EntityId,
        update: &SuiteUpdate,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::UpdateSuite, Some(suite_id), batch)?;
        let mut store = self.store();
        let suite = store
            .suites
            .get_mut(&suite_id)
            .ok_or_else(|| missing(EntityKind::Suite, suite_id))?;
        if let Some(name) = &update.suite_name {
            suite.name.clone_from(name);
        }
        if let Some(note) = &update.user_note {
            suite.user_note = Some(note.clone());
        }
        Ok(())
    }

    fn start_testcase(
        &mut self,
        suite_id: EntityId,
        testcase: &TestcaseStart,
        timestamp_ms: i64,
        batch: bool,
    ) -> SinkResult<EntityId> {
        self.enter(SinkOp::StartTestcase, Some(suite_id), batch)?;
        let mut store = self.store();
        if !store.suites.contains_key(&suite_id) {
            return Err(missing(EntityKind::Suite, suite_id));
        }
        let testcase_id = store.allocate();
        store.testcases.insert(
            testcase_id,
            TestcaseRow {
                testcase_id,
                suite_id,
                suite_full_name: testcase.suite_full_name.clone(),
                scenario_name: testcase.scenario_name.clone(),
                scenario_description: testcase.scenario_description.clone(),
                testcase_name: testcase.testcase_name.clone(),
                user_note: None,
                result: Some(TestResult::Running),
                started_at: timestamp_ms,
                ended_at: None,
                scenario_metainfo: Vec::new(),
            },
        );
        Ok(testcase_id)
    }

    fn end_testcase(
        &mut self,
        testcase_id: EntityId,
        result: TestResult,
        timestamp_ms: i64,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::EndTestcase, Some(testcase_id), batch)?;
        let mut store = self.store();
        let row = store.testcase_mut(testcase_id)?;
        row.result = Some(result);
        row.ended_at = Some(timestamp_ms);
        Ok(())
    }

    fn update_testcase(
        &mut self,
        testcase_id: EntityId,
        update: &TestcaseUpdate,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::UpdateTestcase, Some(testcase_id), batch)?;
        let mut store = self.store();
        let row = store.testcase_mut(testcase_id)?;
        let fields = [
            (&mut row.suite_full_name, &update.suite_full_name),
            (&mut row.scenario_name, &update.scenario_name),
            (&mut row.scenario_description, &update.scenario_description),
            (&mut row.testcase_name, &update.testcase_name),
        ];
        for (column, value) in fields {
            if let Some(value) = value {
                column.clone_from(value);
            }
        }
        if let Some(note) = &update.user_note {
            row.user_note = Some(note.clone());
        }
        if let Some(result) = update.result {
            row.result = Some(result);
        }
        Ok(())
    }

    fn delete_testcases(&mut self, testcase_ids: &[EntityId]) -> SinkResult<()> {
        self.enter(SinkOp::DeleteTestcases, testcase_ids.first().copied(), false)?;
        for testcase_id in testcase_ids {
            self.forget_testcase(*testcase_id);
            let mut store = self.store();
            store.statistics.retain(|s| s.testcase_id != *testcase_id);
            store
                .pending
                .retain(|write| write.parent() != (EntityKind::Testcase, *testcase_id));
        }
        Ok(())
    }

    fn add_scenario_metainfo(
        &mut self,
        testcase_id: EntityId,
        key: &str,
        value: &str,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::AddScenarioMetainfo, Some(testcase_id), batch)?;
        let mut store = self.store();
        store
            .testcase_mut(testcase_id)?
            .scenario_metainfo
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn clear_scenario_metainfo(&mut self, testcase_id: EntityId, batch: bool) -> SinkResult<()> {
        self.enter(SinkOp::ClearScenarioMetainfo, Some(testcase_id), batch)?;
        let mut store = self.store();
        store.testcase_mut(testcase_id)?.scenario_metainfo.clear();
        Ok(())
    }

    fn start_checkpoint(
        &mut self,
        load_queue_id: EntityId,
        checkpoint: &CheckpointStart,
        batch: bool,
    ) -> SinkResult<CheckpointInfo> {
        self.enter(SinkOp::StartCheckpoint, Some(load_queue_id), batch)?;
        let mut store = self.store();
        let checkpoint_id = store.allocate();
        store.checkpoints.insert(
            checkpoint_id,
            CheckpointRow {
                checkpoint_id,
                load_queue_id,
                name: checkpoint.name.clone(),
                thread: checkpoint.thread.clone(),
                start_timestamp: checkpoint.start_timestamp,
                response_time: None,
                transfer_size: 0,
                transfer_unit: checkpoint.transfer_unit.clone(),
                result: None,
            },
        );
        Ok(CheckpointInfo {
            checkpoint_id,
            load_queue_id,
            name: checkpoint.name.clone(),
            thread: checkpoint.thread.clone(),
            start_timestamp: checkpoint.start_timestamp,
            transfer_unit: checkpoint.transfer_unit.clone(),
        })
    }

    fn end_checkpoint(
        &mut self,
        started: &CheckpointInfo,
        end: &CheckpointEnd,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::EndCheckpoint, Some(started.checkpoint_id), batch)?;
        let mut store = self.store();
        let row = store
            .checkpoints
            .get_mut(&started.checkpoint_id)
            .ok_or_else(|| missing(EntityKind::Checkpoint, started.checkpoint_id))?;
        row.response_time = Some(started.response_time(end.end_timestamp));
        row.transfer_size = end.transfer_size;
        row.result = Some(end.result);
        Ok(())
    }

    fn insert_checkpoint(
        &mut self,
        load_queue_id: EntityId,
        sample: &CheckpointSample,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::InsertCheckpoint, Some(load_queue_id), batch)?;
        self.store()
            .write(PendingWrite::Checkpoint(load_queue_id, sample.clone()), batch)
    }

    fn end_load_queue(
        &mut self,
        load_queue_id: EntityId,
        result: TestResult,
        timestamp_ms: i64,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::EndLoadQueue, Some(load_queue_id), batch)?;
        self.store().load_queues.insert(
            load_queue_id,
            LoadQueueRow {
                load_queue_id,
                result,
                ended_at: timestamp_ms,
            },
        );
        Ok(())
    }

    fn insert_message(
        &mut self,
        testcase_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::InsertMessage, Some(testcase_id), batch)?;
        self.store().write(
            PendingWrite::Message(MessageParent::Testcase(testcase_id), message.clone()),
            batch,
        )
    }

    fn insert_run_message(
        &mut self,
        run_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::InsertRunMessage, Some(run_id), batch)?;
        self.store().write(
            PendingWrite::Message(MessageParent::Run(run_id), message.clone()),
            batch,
        )
    }

    fn insert_suite_message(
        &mut self,
        suite_id: EntityId,
        message: &MessageRecord,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::InsertSuiteMessage, Some(suite_id), batch)?;
        self.store().write(
            PendingWrite::Message(MessageParent::Suite(suite_id), message.clone()),
            batch,
        )
    }

    fn insert_statistics(
        &mut self,
        testcase_id: EntityId,
        kind: StatisticsKind,
        stats: &StatisticsBatch,
        batch: bool,
    ) -> SinkResult<()> {
        self.enter(SinkOp::InsertStatistics, Some(testcase_id), batch)?;
        self.store().write(
            PendingWrite::Statistics(testcase_id, kind, stats.clone()),
            batch,
        )
    }

    fn is_run_present(&mut self, run_id: EntityId) -> SinkResult<bool> {
        self.enter(SinkOp::IsRunPresent, Some(run_id), false)?;
        Ok(self.store().runs.contains_key(&run_id))
    }

    fn is_suite_present(&mut self, suite_id: EntityId) -> SinkResult<bool> {
        self.enter(SinkOp::IsSuitePresent, Some(suite_id), false)?;
        Ok(self.store().suites.contains_key(&suite_id))
    }

    fn is_testcase_present(&mut self, testcase_id: EntityId) -> SinkResult<bool> {
        self.enter(SinkOp::IsTestcasePresent, Some(testcase_id), false)?;
        Ok(self.store().testcases.contains_key(&testcase_id))
    }

    fn flush_cache(&mut self) -> SinkResult<()> {
        self.enter(SinkOp::FlushCache, None, false)?;
        let mut store = self.store();
        let pending = std::mem::take(&mut store.pending);
        let mut failed = Vec::new();
        for write in pending {
            let (entity, id) = write.parent();
            if let Err(error) = store.apply(write) {
                failed.push(FailedWrite { entity, id, error });
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SinkError::BatchFailed(failed))
        }
    }
}
