//! End-to-end scenarios for the event processor over the in-memory sink.
//!
//! Each test drives a [`Processor`] with a realistic event sequence and checks
//! both the resulting report rows and the exact sink calls issued.

mod common;

use common::*;
use runledger_core::error::Error;
use runledger_core::event::{
    CheckpointResult, CheckpointSample, JoinedTestcase, LifecycleEvent, LogMessage, MessageLevel,
    RunUpdate, StatSample, StatisticsBatch, TestResult, TestcaseStart,
};
use runledger_core::lifecycle::LifecycleState;
use runledger_core::memory_sink::{MemorySink, SinkOp};
use runledger_core::sink::{EntityKind, MessageParent, StatisticsKind};
use runledger_core::{Processor, SinkError};

fn db_error() -> SinkError {
    SinkError::Database("disk I/O error".to_string())
}

fn stats() -> StatisticsBatch {
    StatisticsBatch {
        monitored_machine: "db-1".to_string(),
        samples: vec![StatSample {
            statistic_id: 3,
            value: 41.5,
        }],
        timestamp: 2_000,
    }
}

// ---------------------------------------------------------------------------
// Basic hierarchy
// ---------------------------------------------------------------------------

#[test]
fn run_suite_testcase_message_round() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);

    open_testcase(&mut p, "T1");
    apply(&mut p, message("hello")).unwrap();
    apply(&mut p, end_testcase(TestResult::Passed)).unwrap();
    apply(&mut p, LifecycleEvent::EndSuite).unwrap();
    apply(&mut p, LifecycleEvent::EndRun).unwrap();

    assert_eq!(sink.runs().len(), 1);
    assert_eq!(sink.suites().len(), 1);
    let testcases = sink.testcases();
    assert_eq!(testcases.len(), 1);
    assert_eq!(testcases[0].result, Some(TestResult::Passed));

    let messages = sink.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].parent,
        MessageParent::Testcase(testcases[0].testcase_id)
    );
    assert_eq!(messages[0].record.machine, "agent-1");
    assert_eq!(messages[0].record.thread, "main");

    assert_eq!(p.state().lifecycle(), LifecycleState::Initialized);
    assert_eq!(p.state().run_id(), None);
}

#[test]
fn duplicate_start_suite_reuses_id() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);

    apply(&mut p, start_run("R1")).unwrap();
    apply(&mut p, start_suite("S1")).unwrap();
    let first = p.state().suite_id();
    apply(&mut p, LifecycleEvent::EndSuite).unwrap();
    apply(&mut p, start_suite("S1")).unwrap();

    assert_eq!(p.state().suite_id(), first);
    assert_eq!(sink.count(SinkOp::StartSuite), 1);
    assert_eq!(sink.suites().len(), 1);
}

#[test]
fn renamed_suite_is_found_under_new_name() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);

    apply(&mut p, start_run("R1")).unwrap();
    apply(&mut p, start_suite("S1")).unwrap();
    let suite_id = p.state().suite_id();
    apply(&mut p, rename_suite("Checkout")).unwrap();
    apply(&mut p, LifecycleEvent::EndSuite).unwrap();

    apply(&mut p, start_suite("Checkout")).unwrap();
    assert_eq!(p.state().suite_id(), suite_id);
    apply(&mut p, LifecycleEvent::EndSuite).unwrap();

    apply(&mut p, start_suite("S1")).unwrap();
    assert_ne!(p.state().suite_id(), suite_id);
    assert_eq!(sink.count(SinkOp::StartSuite), 2);
}

#[test]
fn testcase_resolves_suite_by_simple_name() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);

    apply(&mut p, start_run("R1")).unwrap();
    apply(&mut p, start_suite("Login")).unwrap();
    let login = p.state().suite_id().unwrap();
    apply(&mut p, LifecycleEvent::EndSuite).unwrap();
    apply(&mut p, start_suite("Cart")).unwrap();

    apply(
        &mut p,
        LifecycleEvent::StartTestCase(TestcaseStart {
            suite_simple_name: Some("Login".to_string()),
            testcase_name: "t".to_string(),
            ..TestcaseStart::default()
        }),
    )
    .unwrap();

    let testcase = sink.testcase(p.state().testcase_id().unwrap()).unwrap();
    assert_eq!(testcase.suite_id, login);
}

// ---------------------------------------------------------------------------
// Deferred updates
// ---------------------------------------------------------------------------

#[test]
fn early_update_suite_applied_once_after_start() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);

    apply(&mut p, start_run("R1")).unwrap();
    apply(&mut p, rename_suite("first")).unwrap();
    apply(&mut p, rename_suite("second")).unwrap();
    assert_eq!(sink.count(SinkOp::UpdateSuite), 0);

    apply(&mut p, start_suite("S1")).unwrap();
    let suite_id = p.state().suite_id().unwrap();

    let updates: Vec<_> = sink
        .calls()
        .into_iter()
        .filter(|call| call.op == SinkOp::UpdateSuite)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].target, Some(suite_id));
    assert_eq!(sink.suite(suite_id).unwrap().name, "second");
    assert!(p.pending_suite_update().is_none());

    apply(&mut p, LifecycleEvent::EndSuite).unwrap();
    apply(&mut p, start_suite("S2")).unwrap();
    assert_eq!(sink.count(SinkOp::UpdateSuite), 1);
}

#[test]
fn early_update_run_applied_after_start() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);

    apply(
        &mut p,
        LifecycleEvent::UpdateRun(RunUpdate {
            user_note: Some("nightly build".to_string()),
            ..RunUpdate::default()
        }),
    )
    .unwrap();
    assert!(p.pending_run_update().is_some());

    apply(&mut p, start_run("R1")).unwrap();
    let run = sink.run(p.state().run_id().unwrap()).unwrap();
    assert_eq!(run.user_note.as_deref(), Some("nightly build"));
    assert_eq!(p.state().run_user_note(), Some("nightly build"));
    assert!(p.pending_run_update().is_none());
}

// ---------------------------------------------------------------------------
// State resets on sink failure
// ---------------------------------------------------------------------------

#[test]
fn end_events_reset_state_when_sink_fails() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");

    sink.fail_next(SinkOp::EndTestcase, db_error());
    let err = apply(&mut p, end_testcase(TestResult::Failed)).unwrap_err();
    assert!(matches!(err, Error::Sink(SinkError::Database(_))));
    assert_eq!(p.state().lifecycle(), LifecycleState::SuiteStarted);

    sink.fail_next(SinkOp::EndSuite, db_error());
    apply(&mut p, LifecycleEvent::EndSuite).unwrap_err();
    assert_eq!(p.state().lifecycle(), LifecycleState::RunStarted);

    sink.fail_next(SinkOp::EndRun, db_error());
    apply(&mut p, LifecycleEvent::EndRun).unwrap_err();
    assert_eq!(p.state().lifecycle(), LifecycleState::Initialized);
}

#[test]
fn run_continuation_reuses_previous_run() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);

    apply(&mut p, start_run("R1")).unwrap();
    let run_id = p.state().run_id();
    apply(&mut p, LifecycleEvent::EndRun).unwrap();
    apply(&mut p, start_run("R1 again")).unwrap();

    assert_eq!(p.state().run_id(), run_id);
    assert_eq!(p.state().lifecycle(), LifecycleState::RunStarted);
    assert_eq!(sink.count(SinkOp::StartRun), 1);
    assert_eq!(sink.count(SinkOp::RunDbSanityCheck), 1);
    assert_eq!(sink.runs()[0].run_name, "R1 again");
    assert_eq!(sink.runs()[0].product_name, "shop");
}

// ---------------------------------------------------------------------------
// Deletion and fault isolation
// ---------------------------------------------------------------------------

#[test]
fn deleted_open_testcase_drops_later_writes() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");
    let testcase_id = p.state().testcase_id().unwrap();

    p.delete_testcase(testcase_id).unwrap();
    sink.clear_calls();

    apply(&mut p, message("after delete")).unwrap();
    apply(&mut p, LifecycleEvent::InsertSystemStat(stats())).unwrap();
    apply(
        &mut p,
        LifecycleEvent::AddScenarioMetainfo {
            key: "k".to_string(),
            value: "v".to_string(),
        },
    )
    .unwrap();
    apply(&mut p, end_testcase(TestResult::Passed)).unwrap();

    assert!(
        sink.calls()
            .iter()
            .all(|call| !(call.op.targets_testcase() && call.target == Some(testcase_id)))
    );
    assert!(sink.messages().is_empty());
    assert_eq!(p.state().lifecycle(), LifecycleState::SuiteStarted);
}

#[test]
fn externally_deleted_suite_message_is_swallowed() {
    let sink = MemorySink::new();
    let mut p = Processor::new(
        sink.clone(),
        runledger_core::config::ProcessorConfig {
            log_before_after_messages: true,
            ..config()
        },
    );
    apply(&mut p, start_run("R1")).unwrap();
    apply(&mut p, start_suite("S1")).unwrap();
    sink.forget_suite(p.state().suite_id().unwrap());

    apply(&mut p, message("orphan")).unwrap();
    assert_eq!(sink.count(SinkOp::IsSuitePresent), 1);
    assert!(sink.messages().is_empty());
}

#[test]
fn busy_sink_error_propagates() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");

    sink.fail_next(SinkOp::InsertMessage, SinkError::Busy("locked".to_string()));
    let err = apply(&mut p, message("x")).unwrap_err();
    assert!(matches!(err, Error::Sink(SinkError::Busy(_))));
    assert!(p.deleted_testcases().is_empty());
}

#[test]
fn referential_error_on_present_testcase_is_ignored() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");
    let testcase_id = p.state().testcase_id().unwrap();

    sink.fail_next(
        SinkOp::InsertMessage,
        SinkError::ReferentialIntegrity {
            entity: EntityKind::Testcase,
            message: "spurious".to_string(),
        },
    );
    apply(&mut p, message("x")).unwrap();
    assert!(!p.deleted_testcases().contains(testcase_id));
    apply(&mut p, message("y")).unwrap();
    assert_eq!(sink.messages().len(), 1);
}

// ---------------------------------------------------------------------------
// Load queues and checkpoints
// ---------------------------------------------------------------------------

#[test]
fn remember_running_load_queue_conflicts() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");

    apply(
        &mut p,
        LifecycleEvent::RememberLoadQueue {
            name: "LQ1".to_string(),
            load_queue_id: 5,
        },
    )
    .unwrap();
    let err = apply(
        &mut p,
        LifecycleEvent::RememberLoadQueue {
            name: "LQ1".to_string(),
            load_queue_id: 6,
        },
    )
    .unwrap_err();

    assert!(matches!(err, Error::AlreadyRunningConflict { .. }));
    assert_eq!(p.load_queues().load_queue_id("LQ1"), Some(5));
}

#[test]
fn checkpoints_from_unregistered_threads_never_reach_sink() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");
    sink.clear_calls();

    apply_from(&mut p, "vu-9", checkpoint_start("vu-9", "login")).unwrap();
    apply_from(&mut p, "vu-9", checkpoint_end("vu-9", "login")).unwrap();
    apply_from(
        &mut p,
        "vu-9",
        LifecycleEvent::InsertCheckpoint(CheckpointSample {
            name: "login".to_string(),
            thread: "vu-9".to_string(),
            start_timestamp: 1,
            response_time: 2,
            transfer_size: 0,
            transfer_unit: String::new(),
            result: CheckpointResult::Failed,
        }),
    )
    .unwrap();

    assert!(sink.calls().is_empty());
}

#[test]
fn checkpoint_cycle_on_registered_thread() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");

    apply(
        &mut p,
        LifecycleEvent::RememberLoadQueue {
            name: "LQ1".to_string(),
            load_queue_id: 5,
        },
    )
    .unwrap();
    apply(
        &mut p,
        LifecycleEvent::RegisterThreadWithLoadQueue {
            thread: "vu-1".to_string(),
            load_queue: "LQ1".to_string(),
        },
    )
    .unwrap();
    apply_from(&mut p, "vu-1", checkpoint_start("vu-1", "login")).unwrap();
    assert_eq!(p.load_queues().open_checkpoint_count(), 1);
    apply_from(&mut p, "vu-1", checkpoint_end("vu-1", "login")).unwrap();

    let checkpoints = sink.checkpoints();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].load_queue_id, 5);
    assert_eq!(checkpoints[0].response_time, Some(250));

    let err = apply_from(&mut p, "vu-1", checkpoint_end("vu-1", "login")).unwrap_err();
    assert!(matches!(err, Error::UnknownCheckpoint { .. }));

    apply(
        &mut p,
        LifecycleEvent::EndLoadQueue {
            name: "LQ1".to_string(),
            result: TestResult::Passed,
        },
    )
    .unwrap();
    assert!(p.load_queues().is_empty());
    assert_eq!(sink.load_queues()[0].load_queue_id, 5);
}

#[test]
fn disabled_checkpoints_are_skipped() {
    let sink = MemorySink::new();
    let mut p = Processor::new(
        sink.clone(),
        runledger_core::config::ProcessorConfig {
            enable_checkpoints: false,
            ..config()
        },
    );
    open_testcase(&mut p, "T1");
    apply(
        &mut p,
        LifecycleEvent::RememberLoadQueue {
            name: "LQ1".to_string(),
            load_queue_id: 5,
        },
    )
    .unwrap();
    apply(
        &mut p,
        LifecycleEvent::RegisterThreadWithLoadQueue {
            thread: "vu-1".to_string(),
            load_queue: "LQ1".to_string(),
        },
    )
    .unwrap();
    apply_from(&mut p, "vu-1", checkpoint_start("vu-1", "login")).unwrap();
    assert_eq!(sink.count(SinkOp::StartCheckpoint), 0);
}

#[test]
fn end_testcase_clears_load_queues() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");
    apply(
        &mut p,
        LifecycleEvent::RememberLoadQueue {
            name: "LQ1".to_string(),
            load_queue_id: 5,
        },
    )
    .unwrap();
    apply(&mut p, end_testcase(TestResult::Passed)).unwrap();
    assert!(p.load_queues().is_empty());
}

// ---------------------------------------------------------------------------
// Message and statistics routing
// ---------------------------------------------------------------------------

#[test]
fn hook_messages_follow_configuration() {
    for persist in [false, true] {
        let sink = MemorySink::new();
        let mut p = Processor::new(
            sink.clone(),
            runledger_core::config::ProcessorConfig {
                log_before_after_messages: persist,
                ..config()
            },
        );
        apply(&mut p, start_run("R1")).unwrap();
        apply(&mut p, message("setup")).unwrap();
        apply(&mut p, start_suite("S1")).unwrap();
        apply(&mut p, message("before class")).unwrap();

        let expected = if persist { 2 } else { 0 };
        assert_eq!(sink.messages().len(), expected, "persist = {persist}");
    }
}

#[test]
fn run_message_flag_targets_run() {
    let sink = MemorySink::new();
    let mut p = Processor::new(
        sink.clone(),
        runledger_core::config::ProcessorConfig {
            log_before_after_messages: true,
            ..config()
        },
    );
    open_testcase(&mut p, "T1");
    apply(
        &mut p,
        LifecycleEvent::InsertMessage(LogMessage {
            message: "environment ready".to_string(),
            level: MessageLevel::System,
            escape_html: false,
            run_message: true,
        }),
    )
    .unwrap();

    let messages = sink.messages();
    assert_eq!(
        messages[0].parent,
        MessageParent::Run(p.state().run_id().unwrap())
    );
}

#[test]
fn after_method_messages_and_stats_go_to_last_testcase() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");
    let testcase_id = p.state().testcase_id().unwrap();
    apply(&mut p, end_testcase(TestResult::Passed)).unwrap();

    apply(&mut p, LifecycleEvent::StartAfterMethod).unwrap();
    apply(&mut p, message("teardown")).unwrap();
    apply(&mut p, LifecycleEvent::InsertUserActivityStat(stats())).unwrap();
    apply(&mut p, LifecycleEvent::EndAfterMethod).unwrap();
    apply(&mut p, message("dropped")).unwrap();

    let messages = sink.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].parent, MessageParent::Testcase(testcase_id));
    let statistics = sink.statistics();
    assert_eq!(statistics.len(), 1);
    assert_eq!(statistics[0].kind, StatisticsKind::UserActivity);
    assert_eq!(statistics[0].testcase_id, testcase_id);
}

#[test]
fn after_method_message_skips_newly_opened_testcase() {
    let sink = MemorySink::new();
    let mut p = processor(&sink);
    open_testcase(&mut p, "T1");
    let first = p.state().testcase_id().unwrap();
    apply(&mut p, end_testcase(TestResult::Passed)).unwrap();
    apply(&mut p, start_testcase("T2")).unwrap();
    let second = p.state().testcase_id().unwrap();

    apply(&mut p, LifecycleEvent::StartAfterMethod).unwrap();
    apply(&mut p, message("late teardown of T1")).unwrap();
    apply(&mut p, LifecycleEvent::EndAfterMethod).unwrap();
    apply(&mut p, message("T2 body")).unwrap();

    let parents: Vec<_> = sink.messages().iter().map(|m| m.parent).collect();
    assert_eq!(
        parents,
        vec![MessageParent::Testcase(first), MessageParent::Testcase(second)]
    );
}

// ---------------------------------------------------------------------------
// Joining testcases
// ---------------------------------------------------------------------------

#[test]
fn joined_testcase_receives_messages() {
    let sink = MemorySink::new();
    let mut owner = processor(&sink);
    open_testcase(&mut owner, "T1");
    let run_id = owner.state().run_id().unwrap();
    let testcase_id = owner.state().testcase_id().unwrap();

    let mut agent = processor(&sink);
    apply(
        &mut agent,
        LifecycleEvent::JoinTestCase(JoinedTestcase {
            run_id,
            testcase_id,
        }),
    )
    .unwrap();
    assert_eq!(agent.state().lifecycle(), LifecycleState::TestCaseStarted);
    apply(&mut agent, message("from agent")).unwrap();
    apply(&mut agent, LifecycleEvent::LeaveTestCase).unwrap();

    assert_eq!(agent.state().lifecycle(), LifecycleState::Initialized);
    assert_eq!(
        sink.messages()[0].parent,
        MessageParent::Testcase(testcase_id)
    );
}

// ---------------------------------------------------------------------------
// Batch mode
// ---------------------------------------------------------------------------

#[test]
fn batch_mode_defers_cacheable_writes_until_flush() {
    let sink = MemorySink::new();
    let mut p = Processor::new(
        sink.clone(),
        runledger_core::config::ProcessorConfig {
            batch_mode: true,
            ..config()
        },
    );
    open_testcase(&mut p, "T1");
    apply(&mut p, message("buffered")).unwrap();
    assert_eq!(sink.pending_len(), 1);
    assert!(sink.messages().is_empty());

    apply(&mut p, end_testcase(TestResult::Passed)).unwrap();
    assert_eq!(sink.pending_len(), 0);
    assert_eq!(sink.messages().len(), 1);
}

fn batched_processor(sink: &MemorySink) -> Processor<MemorySink> {
    Processor::new(
        sink.clone(),
        runledger_core::config::ProcessorConfig {
            batch_mode: true,
            ..config()
        },
    )
}

#[test]
fn batched_writes_of_deleted_testcase_do_not_block_its_end() {
    let sink = MemorySink::new();
    let mut p = batched_processor(&sink);
    open_testcase(&mut p, "T1");
    let testcase_id = p.state().testcase_id().unwrap();
    apply(&mut p, message("buffered")).unwrap();
    apply(&mut p, LifecycleEvent::InsertSystemStat(stats())).unwrap();

    p.delete_testcase(testcase_id).unwrap();
    assert_eq!(sink.pending_len(), 0);

    apply(&mut p, end_testcase(TestResult::Passed)).unwrap();
    assert_eq!(p.state().lifecycle(), LifecycleState::SuiteStarted);
    assert!(sink.messages().is_empty());
    assert!(sink.statistics().is_empty());
}

#[test]
fn flush_failure_on_vanished_testcase_marks_it_deleted() {
    let sink = MemorySink::new();
    let mut p = batched_processor(&sink);
    open_testcase(&mut p, "T1");
    let testcase_id = p.state().testcase_id().unwrap();
    apply(&mut p, message("buffered")).unwrap();

    sink.forget_testcase(testcase_id);
    apply(&mut p, end_testcase(TestResult::Passed)).unwrap();

    assert!(p.deleted_testcases().contains(testcase_id));
    assert_eq!(p.state().lifecycle(), LifecycleState::SuiteStarted);
    assert_eq!(sink.count(SinkOp::EndTestcase), 0);
    p.on_idle().unwrap();
}

#[test]
fn end_testcase_runs_even_if_flush_fails() {
    let sink = MemorySink::new();
    let mut p = batched_processor(&sink);
    open_testcase(&mut p, "T1");
    apply(&mut p, message("buffered")).unwrap();

    sink.fail_next(SinkOp::FlushCache, SinkError::Busy("locked".to_string()));
    let err = apply(&mut p, end_testcase(TestResult::Passed)).unwrap_err();

    assert!(matches!(err, Error::Sink(SinkError::Busy(_))));
    assert_eq!(sink.count(SinkOp::EndTestcase), 1);
    assert_eq!(p.state().lifecycle(), LifecycleState::SuiteStarted);
}

#[test]
fn non_end_event_stops_on_flush_failure() {
    let sink = MemorySink::new();
    let mut p = batched_processor(&sink);
    open_testcase(&mut p, "T1");
    apply(&mut p, message("buffered")).unwrap();

    sink.fail_next(SinkOp::FlushCache, SinkError::Busy("locked".to_string()));
    let err = apply(
        &mut p,
        LifecycleEvent::AddScenarioMetainfo {
            key: "browser".to_string(),
            value: "firefox".to_string(),
        },
    )
    .unwrap_err();

    assert!(matches!(err, Error::Sink(SinkError::Busy(_))));
    assert_eq!(sink.count(SinkOp::AddScenarioMetainfo), 0);
    assert_eq!(p.state().lifecycle(), LifecycleState::TestCaseStarted);
}
