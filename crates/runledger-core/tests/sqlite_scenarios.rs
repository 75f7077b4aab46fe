//! Pipeline over the SQLite sink: rows land in the database and rows deleted
//! by another client are detected through foreign-key violations.

use std::time::Duration;

use rusqlite::Connection;
use runledger_core::bridge::{WaitOutcome, WaitTimeouts};
use runledger_core::config::ProcessorConfig;
use runledger_core::event::{
    LifecycleEvent, MessageLevel, RunInfo, StatSample, StatisticsBatch, TestResult, TestcaseStart,
};
use runledger_core::pipeline::PipelineConfig;
use runledger_core::sink::WriteSink;
use runledger_core::sqlite_sink::SqliteSink;
use runledger_core::{Envelope, EventPipeline, Processor, Result};

fn pipeline_config(batch_mode: bool) -> PipelineConfig {
    PipelineConfig {
        processor: ProcessorConfig {
            batch_mode,
            machine_name: Some("agent-1".to_string()),
            ..ProcessorConfig::default()
        },
        timeouts: WaitTimeouts {
            short: Duration::from_secs(10),
            long: Duration::from_secs(10),
        },
    }
}

fn start_testcase(name: &str) -> LifecycleEvent {
    LifecycleEvent::StartTestCase(TestcaseStart {
        testcase_name: name.to_string(),
        ..TestcaseStart::default()
    })
}

fn apply(processor: &mut Processor<SqliteSink>, event: LifecycleEvent) -> Result<()> {
    processor.process(&Envelope::new(event, "main", 1))
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

#[test]
fn recorded_run_is_queryable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.db");

    let sink = SqliteSink::open(&path, 100).unwrap();
    let pipeline = EventPipeline::start(sink, pipeline_config(true)).unwrap();
    let outcome = pipeline
        .dispatch(LifecycleEvent::StartRun(RunInfo {
            run_name: "nightly".to_string(),
            ..RunInfo::default()
        }))
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Completed);
    pipeline
        .dispatch(LifecycleEvent::StartSuite {
            name: "Login".to_string(),
            package: "acme".to_string(),
        })
        .unwrap();
    pipeline.dispatch(start_testcase("valid password")).unwrap();
    pipeline
        .dispatch(LifecycleEvent::message(MessageLevel::Info, "typed password"))
        .unwrap();
    pipeline
        .dispatch(LifecycleEvent::InsertSystemStat(StatisticsBatch {
            monitored_machine: "db-1".to_string(),
            samples: vec![StatSample {
                statistic_id: 1,
                value: 0.25,
            }],
            timestamp: 9,
        }))
        .unwrap();
    pipeline
        .dispatch(LifecycleEvent::EndTestCase {
            result: TestResult::Passed,
        })
        .unwrap();
    pipeline.dispatch(LifecycleEvent::EndSuite).unwrap();
    pipeline.dispatch(LifecycleEvent::EndRun).unwrap();
    pipeline.shutdown().unwrap();

    let sink = SqliteSink::open(&path, 100).unwrap();
    let summary = sink.summary().unwrap();
    assert_eq!(summary.runs.len(), 1);
    assert_eq!(summary.runs[0].run_name, "nightly");
    assert_eq!(summary.runs[0].passed, 1);
    assert!(summary.runs[0].ended_at.is_some());
    assert_eq!(summary.messages, 1);
    assert_eq!(summary.statistics, 1);

    let conn = sink.connection();
    let machine: String = conn
        .query_row("SELECT machine FROM messages", [], |row| row.get(0))
        .unwrap();
    assert_eq!(machine, "agent-1");
}

#[test]
fn testcase_deleted_by_another_client_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.db");

    let sink = SqliteSink::open(&path, 100).unwrap();
    let mut processor = Processor::new(sink, pipeline_config(false).processor);

    apply(&mut processor, LifecycleEvent::StartRun(RunInfo::default())).unwrap();
    apply(
        &mut processor,
        LifecycleEvent::StartSuite {
            name: "Login".to_string(),
            package: String::new(),
        },
    )
    .unwrap();
    apply(&mut processor, start_testcase("t")).unwrap();
    let testcase_id = processor.state().testcase_id().unwrap();

    let other = Connection::open(&path).unwrap();
    other.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
    other
        .execute("DELETE FROM testcases WHERE testcase_id = ?1", [testcase_id])
        .unwrap();

    apply(
        &mut processor,
        LifecycleEvent::message(MessageLevel::Error, "into the void"),
    )
    .unwrap();
    assert!(processor.deleted_testcases().contains(testcase_id));

    apply(
        &mut processor,
        LifecycleEvent::EndTestCase {
            result: TestResult::Failed,
        },
    )
    .unwrap();

    let mut sink = processor.into_sink();
    assert!(!sink.is_testcase_present(testcase_id).unwrap());
    assert_eq!(count(sink.connection(), "SELECT COUNT(*) FROM messages"), 0);
}

fn open_batched_testcase(path: &std::path::Path) -> (Processor<SqliteSink>, i64) {
    let sink = SqliteSink::open(path, 100).unwrap();
    let mut processor = Processor::new(sink, pipeline_config(true).processor);
    apply(&mut processor, LifecycleEvent::StartRun(RunInfo::default())).unwrap();
    apply(
        &mut processor,
        LifecycleEvent::StartSuite {
            name: "Cart".to_string(),
            package: String::new(),
        },
    )
    .unwrap();
    apply(&mut processor, start_testcase("checkout")).unwrap();
    let testcase_id = processor.state().testcase_id().unwrap();
    apply(
        &mut processor,
        LifecycleEvent::message(MessageLevel::Info, "buffered"),
    )
    .unwrap();
    assert_eq!(processor.sink().pending_len(), 1);
    (processor, testcase_id)
}

#[test]
fn deleted_testcase_with_buffered_message_still_ends() {
    let dir = tempfile::tempdir().unwrap();
    let (mut processor, testcase_id) = open_batched_testcase(&dir.path().join("report.db"));

    processor.delete_testcase(testcase_id).unwrap();
    apply(
        &mut processor,
        LifecycleEvent::EndTestCase {
            result: TestResult::Passed,
        },
    )
    .unwrap();

    assert_eq!(
        processor.state().lifecycle(),
        runledger_core::lifecycle::LifecycleState::SuiteStarted
    );
    let sink = processor.into_sink();
    assert_eq!(sink.pending_len(), 0);
    assert_eq!(count(sink.connection(), "SELECT COUNT(*) FROM messages"), 0);
}

#[test]
fn buffered_message_to_externally_deleted_testcase_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.db");
    let (mut processor, testcase_id) = open_batched_testcase(&path);

    let other = Connection::open(&path).unwrap();
    other.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
    other
        .execute("DELETE FROM testcases WHERE testcase_id = ?1", [testcase_id])
        .unwrap();

    apply(
        &mut processor,
        LifecycleEvent::EndTestCase {
            result: TestResult::Passed,
        },
    )
    .unwrap();
    assert!(processor.deleted_testcases().contains(testcase_id));
    assert_eq!(
        processor.state().lifecycle(),
        runledger_core::lifecycle::LifecycleState::SuiteStarted
    );
    processor.on_idle().unwrap();
}
