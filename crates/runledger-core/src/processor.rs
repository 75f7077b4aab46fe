//! Event validation and dispatch onto the write sink.
//!
//! The processor is single-threaded: the consumer thread owns it and feeds it
//! envelopes in queue order. Each envelope is checked against the lifecycle
//! state, deferred, rejected, or applied to the sink, after which the state
//! is advanced.
//!
//! # Fault isolation
//!
//! A write that fails with a referential-integrity error is assumed to target
//! a row deleted by someone else. The processor asks the sink whether the row
//! is still present; a vanished testcase is marked deleted so later writes for
//! it are dropped without touching the sink. Either way the error is
//! swallowed. All other sink errors propagate to the caller. Batched writes
//! rejected at flush time are judged the same way, each against its own
//! parent row.
//!
//! End events (`end_run`, `end_suite`, `end_test_case`) always advance the
//! state, even when their write or the flush before them fails.

use tracing::{debug, debug_span, info, trace, warn};

use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::event::{
    CheckpointEnd, CheckpointSample, CheckpointStart, EntityId, Envelope, EventKind,
    LifecycleEvent, LogMessage, RunInfo, RunUpdate, StatisticsBatch, SuiteUpdate, TestResult,
    TestcaseStart, TestcaseUpdate,
};
use crate::identity::{DeletedTestcases, SuiteIdentityCache};
use crate::lifecycle::{self, Admission, LifecycleState, ProcessorState};
use crate::load_queue::LoadQueuesState;
use crate::routing::{self, MessageRoute};
use crate::sink::{
    EntityKind, FailedWrite, MessageRecord, SinkError, SinkErrorClass, SinkResult, StatisticsKind,
    WriteSink,
};

/// Host name used for message rows when none is configured.
#[must_use]
pub fn local_machine_name() -> String {
    let name = gethostname::gethostname().to_string_lossy().into_owned();
    if name.is_empty() {
        "unknown host".to_string()
    } else {
        name
    }
}

/// Removes a load queue from the bookkeeping when dropped, whatever the
/// outcome of the sink write in between.
struct LoadQueueRelease<'a> {
    queues: &'a mut LoadQueuesState,
    name: &'a str,
}

impl Drop for LoadQueueRelease<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.queues.remove(self.name) {
            debug!(load_queue = %self.name, error = %err, "Load queue already released");
        }
    }
}

pub struct Processor<S> {
    sink: S,
    config: ProcessorConfig,
    machine_name: String,
    state: ProcessorState,
    load_queues: LoadQueuesState,
    suites: SuiteIdentityCache,
    deleted: DeletedTestcases,
    pending_suite_update: Option<SuiteUpdate>,
    pending_run_update: Option<RunUpdate>,
}

impl<S: WriteSink> Processor<S> {
    pub fn new(sink: S, config: ProcessorConfig) -> Self {
        let machine_name = config
            .machine_name
            .clone()
            .unwrap_or_else(local_machine_name);
        Self {
            sink,
            config,
            machine_name,
            state: ProcessorState::default(),
            load_queues: LoadQueuesState::new(),
            suites: SuiteIdentityCache::new(),
            deleted: DeletedTestcases::new(),
            pending_suite_update: None,
            pending_run_update: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &ProcessorState {
        &self.state
    }

    #[must_use]
    pub const fn load_queues(&self) -> &LoadQueuesState {
        &self.load_queues
    }

    #[must_use]
    pub const fn suite_cache(&self) -> &SuiteIdentityCache {
        &self.suites
    }

    #[must_use]
    pub const fn deleted_testcases(&self) -> &DeletedTestcases {
        &self.deleted
    }

    #[must_use]
    pub const fn pending_suite_update(&self) -> Option<&SuiteUpdate> {
        self.pending_suite_update.as_ref()
    }

    #[must_use]
    pub const fn pending_run_update(&self) -> Option<&RunUpdate> {
        self.pending_run_update.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Called when the queue stayed empty for a poll interval.
    pub fn on_idle(&mut self) -> Result<()> {
        if self.config.batch_mode {
            trace!("Queue idle, flushing batched writes");
            self.flush_sink()?;
        }
        Ok(())
    }

    /// Write out anything the sink still buffers.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_sink()
    }

    /// Remove a testcase from the report. The id is marked deleted even if
    /// the sink fails, so no further writes target it.
    pub fn delete_testcase(&mut self, testcase_id: EntityId) -> Result<()> {
        let result = self.sink.delete_testcase(testcase_id);
        self.deleted.insert(testcase_id);
        match result {
            Ok(()) => {
                info!(testcase_id, "Deleted testcase");
                Ok(())
            }
            Err(err) => {
                warn!(testcase_id, error = %err, "Failed to delete testcase from sink");
                Err(err.into())
            }
        }
    }

    /// Validate and apply one event.
    pub fn process(&mut self, envelope: &Envelope) -> Result<()> {
        let event = envelope.event();
        let kind = event.kind();
        let _span = debug_span!("process_event", event = %kind, thread = envelope.producer_thread())
            .entered();

        match lifecycle::admit(kind, self.state.lifecycle()) {
            Admission::Accept => {}
            Admission::Defer => {
                self.defer(event);
                return Ok(());
            }
            Admission::Reject => {
                return Err(Error::StateViolation {
                    event: kind,
                    state: self.state.lifecycle(),
                    required: kind.required_state(),
                });
            }
        }

        let flushed = self.flush_before(kind);
        if flushed.is_err() && !kind.ends_scope() {
            return flushed;
        }
        let outcome = self.dispatch(envelope);
        match flushed {
            Ok(()) => outcome,
            Err(err) => {
                warn!(event = %kind, error = %err, "Flush before end event failed");
                outcome.and(Err(err))
            }
        }
    }

    /// Batched writes go out before any non-batchable event inside a testcase.
    fn flush_before(&mut self, kind: EventKind) -> Result<()> {
        if self.config.batch_mode
            && !kind.is_cacheable()
            && self.state.lifecycle() == LifecycleState::TestCaseStarted
        {
            self.flush_sink()
        } else {
            Ok(())
        }
    }

    fn flush_sink(&mut self) -> Result<()> {
        let result = self.sink.flush_cache();
        self.isolate(EntityKind::Testcase, None, result)
    }

    fn dispatch(&mut self, envelope: &Envelope) -> Result<()> {
        let event = envelope.event();
        let kind = event.kind();
        let timestamp = envelope.timestamp_ms();
        match event {
            LifecycleEvent::StartRun(info) => self.start_run(info, timestamp),
            LifecycleEvent::EndRun => self.end_run(timestamp),
            LifecycleEvent::UpdateRun(update) => self.update_run(update),
            LifecycleEvent::AddRunMetainfo { key, value } => {
                let run_id = self.require_run(kind)?;
                self.sink.add_run_metainfo(run_id, key, value, false)?;
                Ok(())
            }
            LifecycleEvent::StartSuite { name, package } => {
                self.start_suite(name, package, timestamp)
            }
            LifecycleEvent::EndSuite => self.end_suite(timestamp),
            LifecycleEvent::UpdateSuite(update) => self.update_suite(update),
            LifecycleEvent::ClearScenarioMetainfo => {
                let Some(testcase_id) = self.live_testcase() else {
                    return Ok(());
                };
                let result = self.sink.clear_scenario_metainfo(testcase_id, false);
                self.isolate(EntityKind::Testcase, Some(testcase_id), result)
            }
            LifecycleEvent::AddScenarioMetainfo { key, value } => {
                let Some(testcase_id) = self.live_testcase() else {
                    return Ok(());
                };
                let result = self
                    .sink
                    .add_scenario_metainfo(testcase_id, key, value, false);
                self.isolate(EntityKind::Testcase, Some(testcase_id), result)
            }
            LifecycleEvent::StartTestCase(testcase) => self.start_testcase(testcase, timestamp),
            LifecycleEvent::EndTestCase { result } => self.end_testcase(*result, timestamp),
            LifecycleEvent::UpdateTestCase(update) => self.update_testcase(update),
            LifecycleEvent::JoinTestCase(joined) => {
                self.state.join_testcase(*joined);
                info!(
                    run_id = joined.run_id,
                    testcase_id = joined.testcase_id,
                    "Joined testcase"
                );
                Ok(())
            }
            LifecycleEvent::LeaveTestCase => {
                debug!(testcase_id = ?self.state.testcase_id(), "Left joined testcase");
                self.state.leave_testcase();
                self.load_queues.clear();
                Ok(())
            }
            LifecycleEvent::DeleteTestCase { testcase_id } => self.delete_testcase(*testcase_id),
            LifecycleEvent::RememberLoadQueue {
                name,
                load_queue_id,
            } => {
                self.load_queues.remember(name, *load_queue_id)?;
                debug!(load_queue = %name, load_queue_id, "Load queue started");
                Ok(())
            }
            LifecycleEvent::CleanupLoadQueue { name } => {
                self.load_queues.remove(name)?;
                Ok(())
            }
            LifecycleEvent::EndLoadQueue { name, result } => {
                self.end_load_queue(name, *result, timestamp)
            }
            LifecycleEvent::RegisterThreadWithLoadQueue { thread, load_queue } => {
                self.load_queues.register_thread(thread, load_queue)
            }
            LifecycleEvent::StartCheckpoint(start) => self.start_checkpoint(start),
            LifecycleEvent::EndCheckpoint(end) => self.end_checkpoint(end),
            LifecycleEvent::InsertCheckpoint(sample) => self.insert_checkpoint(sample),
            LifecycleEvent::InsertSystemStat(stats) => {
                self.insert_statistics(StatisticsKind::System, stats)
            }
            LifecycleEvent::InsertUserActivityStat(stats) => {
                self.insert_statistics(StatisticsKind::UserActivity, stats)
            }
            LifecycleEvent::InsertMessage(message) => {
                self.insert_message(message, envelope.producer_thread(), timestamp)
            }
            LifecycleEvent::StartAfterSuite
            | LifecycleEvent::EndAfterSuite
            | LifecycleEvent::StartAfterClass
            | LifecycleEvent::EndAfterClass
            | LifecycleEvent::StartAfterMethod
            | LifecycleEvent::EndAfterMethod => {
                self.state.hooks_mut().apply(kind);
                Ok(())
            }
        }
    }

    fn batch_for(&self, kind: EventKind) -> bool {
        self.config.batch_mode && kind.is_cacheable()
    }

    fn require_run(&self, kind: EventKind) -> Result<EntityId> {
        self.state.run_id().ok_or(Error::StateViolation {
            event: kind,
            state: self.state.lifecycle(),
            required: kind.required_state(),
        })
    }

    fn require_suite(&self, kind: EventKind) -> Result<EntityId> {
        self.state.suite_id().ok_or(Error::StateViolation {
            event: kind,
            state: self.state.lifecycle(),
            required: kind.required_state(),
        })
    }

    /// Current testcase, unless it was deleted.
    fn live_testcase(&self) -> Option<EntityId> {
        self.state
            .testcase_id()
            .filter(|id| !self.deleted.contains(*id))
    }

    fn defer(&mut self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::UpdateSuite(update) => {
                if self.pending_suite_update.replace(update.clone()).is_some() {
                    debug!("Replaced pending suite update");
                }
                debug!("Suite update deferred until the next suite starts");
            }
            LifecycleEvent::UpdateRun(update) => {
                if self.pending_run_update.replace(update.clone()).is_some() {
                    debug!("Replaced pending run update");
                }
                debug!("Run update deferred until the run starts");
            }
            other => warn!(event = %other.kind(), "Event cannot be deferred; dropped"),
        }
    }

    /// Swallow referential-integrity failures, recording vanished testcases.
    ///
    /// Failed batched writes are judged one by one against their own parent.
    fn isolate(
        &mut self,
        entity: EntityKind,
        id: Option<EntityId>,
        result: SinkResult<()>,
    ) -> Result<()> {
        match (result, id) {
            (Ok(()), _) => Ok(()),
            (Err(SinkError::BatchFailed(failed)), _) => self.isolate_batch(failed),
            (Err(err), Some(id)) => self.isolate_write(entity, id, err),
            (Err(err), None) => Err(err.into()),
        }
    }

    fn isolate_batch(&mut self, failed: Vec<FailedWrite>) -> Result<()> {
        let mut first_error = None;
        for write in failed {
            if let Err(err) = self.isolate_write(write.entity, write.id, write.error) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn isolate_write(&mut self, entity: EntityKind, id: EntityId, err: SinkError) -> Result<()> {
        if err.class() != SinkErrorClass::ReferentialGhost {
            return Err(err.into());
        }

        if self.sink.is_present(entity, id)? {
            debug!(%entity, id, error = %err, "Referential failure on a present row; ignored");
        } else if entity == EntityKind::Testcase {
            self.deleted.insert(id);
            warn!(testcase_id = id, "Testcase was deleted; dropping its writes");
        } else {
            warn!(%entity, id, "Write target was deleted; write dropped");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    fn start_run(&mut self, info: &RunInfo, timestamp: i64) -> Result<()> {
        self.suites.clear();

        let run_id = if let Some(previous) = self.state.previous_run_id() {
            self.sink
                .update_run(previous, &RunUpdate::rename(&info.run_name), false)?;
            info!(run_id = previous, run_name = %info.run_name, "Continuing previous run");
            previous
        } else {
            self.sink.run_db_sanity_check()?;
            let run_id = self.sink.start_run(info, timestamp, false)?;
            info!(run_id, run_name = %info.run_name, "Run started");
            run_id
        };
        self.state.begin_run(run_id, &info.run_name);

        if let Some(pending) = self.pending_run_update.take() {
            debug!(run_id, "Applying deferred run update");
            self.apply_run_update(run_id, &pending)?;
        }
        Ok(())
    }

    fn end_run(&mut self, timestamp: i64) -> Result<()> {
        let result = match self.state.run_id() {
            Some(run_id) => self.sink.end_run(run_id, timestamp, false),
            None => Ok(()),
        };
        info!(run_id = ?self.state.run_id(), "Run ended");
        self.state.end_run();
        result.map_err(Into::into)
    }

    fn update_run(&mut self, update: &RunUpdate) -> Result<()> {
        let run_id = self.require_run(EventKind::UpdateRun)?;
        self.apply_run_update(run_id, update)
    }

    fn apply_run_update(&mut self, run_id: EntityId, update: &RunUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.sink.update_run(run_id, update, false)?;
        self.state
            .note_run_update(update.run_name.as_deref(), update.user_note.as_deref());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Suites
    // -------------------------------------------------------------------------

    fn start_suite(&mut self, name: &str, package: &str, timestamp: i64) -> Result<()> {
        let run_id = self.require_run(EventKind::StartSuite)?;
        let suite_id = if let Some(suite_id) = self.suites.get(run_id, name) {
            debug!(suite_id, suite = %name, "Reusing suite");
            suite_id
        } else {
            let suite_id = self
                .sink
                .start_suite(run_id, name, package, timestamp, false)?;
            self.suites.insert(run_id, name, suite_id);
            debug!(suite_id, suite = %name, "Suite started");
            suite_id
        };
        self.state.begin_suite(suite_id);

        if let Some(pending) = self.pending_suite_update.take() {
            debug!(suite_id, "Applying deferred suite update");
            self.update_suite(&pending)?;
        }
        Ok(())
    }

    fn end_suite(&mut self, timestamp: i64) -> Result<()> {
        let result = match self.state.suite_id() {
            Some(suite_id) => self.sink.end_suite(suite_id, timestamp, false),
            None => Ok(()),
        };
        self.state.end_suite(result.is_ok());
        result.map_err(Into::into)
    }

    fn update_suite(&mut self, update: &SuiteUpdate) -> Result<()> {
        let suite_id = self.require_suite(EventKind::UpdateSuite)?;
        let result = self.sink.update_suite(suite_id, update, false);
        if let (Some(run_id), Some(name)) = (
            self.state.run_id(),
            update.suite_name.as_deref().filter(|n| !n.is_empty()),
        ) {
            self.suites.rename(run_id, suite_id, name);
        }
        result.map_err(Into::into)
    }

    // -------------------------------------------------------------------------
    // Testcases
    // -------------------------------------------------------------------------

    fn start_testcase(&mut self, testcase: &TestcaseStart, timestamp: i64) -> Result<()> {
        let mut suite_id = self.require_suite(EventKind::StartTestCase)?;
        if let (Some(run_id), Some(simple_name)) = (
            self.state.run_id(),
            testcase
                .suite_simple_name
                .as_deref()
                .filter(|n| !n.is_empty()),
        ) {
            match self.suites.get(run_id, simple_name) {
                Some(cached) => suite_id = cached,
                None => warn!(
                    suite = %simple_name,
                    "Suite of testcase not found; using the current suite"
                ),
            }
        }

        let testcase_id = self
            .sink
            .start_testcase(suite_id, testcase, timestamp, false)?;
        info!(testcase_id, testcase = %testcase.testcase_name, "Testcase started");
        self.state.begin_testcase(testcase_id);
        Ok(())
    }

    fn end_testcase(&mut self, result: TestResult, timestamp: i64) -> Result<()> {
        let outcome = match self.live_testcase() {
            Some(testcase_id) => self.sink.end_testcase(testcase_id, result, timestamp, false),
            None => {
                debug!(testcase_id = ?self.state.testcase_id(), "Skipping end of deleted testcase");
                Ok(())
            }
        };
        info!(testcase_id = ?self.state.testcase_id(), ?result, "Testcase ended");
        self.state.end_testcase();
        self.load_queues.clear();
        outcome.map_err(Into::into)
    }

    fn update_testcase(&mut self, update: &TestcaseUpdate) -> Result<()> {
        let Some(testcase_id) = self
            .state
            .testcase_id()
            .or_else(|| self.state.last_executed_testcase_id())
        else {
            warn!("No current or last executed testcase to update");
            return Ok(());
        };
        if self.deleted.contains(testcase_id) {
            return Ok(());
        }
        let result = self.sink.update_testcase(testcase_id, update, false);
        self.isolate(EntityKind::Testcase, Some(testcase_id), result)
    }

    // -------------------------------------------------------------------------
    // Load queues and checkpoints
    // -------------------------------------------------------------------------

    fn end_load_queue(&mut self, name: &str, result: TestResult, timestamp: i64) -> Result<()> {
        let load_queue_id = self
            .load_queues
            .load_queue_id(name)
            .ok_or_else(|| Error::UnknownLoadQueue(name.to_string()))?;
        let _release = LoadQueueRelease {
            queues: &mut self.load_queues,
            name,
        };
        self.sink
            .end_load_queue(load_queue_id, result, timestamp, false)?;
        debug!(load_queue = %name, load_queue_id, "Load queue ended");
        Ok(())
    }

    /// Load queue of `thread`, unless checkpoints are off or the testcase
    /// was deleted.
    fn checkpoint_target(&self, thread: &str) -> Option<EntityId> {
        if !self.config.enable_checkpoints || self.deleted.excludes(self.state.testcase_id()) {
            return None;
        }
        let load_queue_id = self.load_queues.load_queue_for_thread(thread);
        if load_queue_id.is_none() {
            trace!(thread, "Thread has no load queue; checkpoint skipped");
        }
        load_queue_id
    }

    fn start_checkpoint(&mut self, start: &CheckpointStart) -> Result<()> {
        let Some(load_queue_id) = self.checkpoint_target(&start.thread) else {
            return Ok(());
        };
        let batch = self.batch_for(EventKind::StartCheckpoint);
        match self.sink.start_checkpoint(load_queue_id, start, batch) {
            Ok(started) => {
                self.load_queues.start_checkpoint(started);
                Ok(())
            }
            Err(err) => {
                let testcase_id = self.state.testcase_id();
                self.isolate(EntityKind::Testcase, testcase_id, Err(err))
            }
        }
    }

    fn end_checkpoint(&mut self, end: &CheckpointEnd) -> Result<()> {
        if self.checkpoint_target(&end.thread).is_none() {
            return Ok(());
        }
        let started = self.load_queues.end_checkpoint(&end.thread, &end.name)?;
        let batch = self.batch_for(EventKind::EndCheckpoint);
        let result = self.sink.end_checkpoint(&started, end, batch);
        let testcase_id = self.state.testcase_id();
        self.isolate(EntityKind::Testcase, testcase_id, result)
    }

    fn insert_checkpoint(&mut self, sample: &CheckpointSample) -> Result<()> {
        let Some(load_queue_id) = self.checkpoint_target(&sample.thread) else {
            return Ok(());
        };
        let batch = self.batch_for(EventKind::InsertCheckpoint);
        let result = self.sink.insert_checkpoint(load_queue_id, sample, batch);
        let testcase_id = self.state.testcase_id();
        self.isolate(EntityKind::Testcase, testcase_id, result)
    }

    // -------------------------------------------------------------------------
    // Statistics and messages
    // -------------------------------------------------------------------------

    fn insert_statistics(&mut self, kind: StatisticsKind, stats: &StatisticsBatch) -> Result<()> {
        let Some(testcase_id) = routing::statistics_target(&self.state) else {
            debug!(statistics = kind.as_str(), "No testcase for statistics; skipped");
            return Ok(());
        };
        if self.deleted.contains(testcase_id) {
            return Ok(());
        }
        let result = match kind {
            StatisticsKind::System => {
                let batch = self.batch_for(EventKind::InsertSystemStat);
                self.sink.insert_system_statistics(testcase_id, stats, batch)
            }
            StatisticsKind::UserActivity => {
                let batch = self.batch_for(EventKind::InsertUserActivityStat);
                self.sink
                    .insert_user_activity_statistics(testcase_id, stats, batch)
            }
        };
        self.isolate(EntityKind::Testcase, Some(testcase_id), result)
    }

    fn insert_message(&mut self, message: &LogMessage, thread: &str, timestamp: i64) -> Result<()> {
        let route = routing::route_message(
            &self.state,
            message.run_message,
            self.config.log_before_after_messages,
        );
        let record = MessageRecord {
            text: message.message.clone(),
            level: message.level,
            escape_html: message.escape_html,
            machine: self.machine_name.clone(),
            thread: thread.to_string(),
            timestamp_ms: timestamp,
        };
        let batch = self.batch_for(EventKind::InsertMessage);

        match route {
            MessageRoute::Run(run_id) => {
                let result = self.sink.insert_run_message(run_id, &record, batch);
                self.isolate(EntityKind::Run, Some(run_id), result)
            }
            MessageRoute::Suite(suite_id) => {
                let result = self.sink.insert_suite_message(suite_id, &record, batch);
                self.isolate(EntityKind::Suite, Some(suite_id), result)
            }
            MessageRoute::Testcase(testcase_id) => {
                if self.deleted.contains(testcase_id) {
                    return Ok(());
                }
                let result = self.sink.insert_message(testcase_id, &record, batch);
                self.isolate(EntityKind::Testcase, Some(testcase_id), result)
            }
            MessageRoute::Drop(reason) => {
                trace!(?reason, "Message dropped");
                Ok(())
            }
        }
    }
}
