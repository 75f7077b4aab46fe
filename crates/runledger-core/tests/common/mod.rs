//! Shared helpers for processor and pipeline integration tests.

#![allow(dead_code)]

use runledger_core::config::ProcessorConfig;
use runledger_core::event::{
    CheckpointEnd, CheckpointResult, CheckpointStart, Envelope, LifecycleEvent, MessageLevel,
    RunInfo, SuiteUpdate, TestResult, TestcaseStart,
};
use runledger_core::memory_sink::MemorySink;
use runledger_core::{Processor, Result};

// ---------------------------------------------------------------------------
// Processor harness
// ---------------------------------------------------------------------------

pub fn config() -> ProcessorConfig {
    ProcessorConfig {
        machine_name: Some("agent-1".to_string()),
        ..ProcessorConfig::default()
    }
}

pub fn processor(sink: &MemorySink) -> Processor<MemorySink> {
    Processor::new(sink.clone(), config())
}

/// Apply `event` as if produced by `thread`.
pub fn apply_from(
    processor: &mut Processor<MemorySink>,
    thread: &str,
    event: LifecycleEvent,
) -> Result<()> {
    processor.process(&Envelope::new(event, thread, 1_000))
}

pub fn apply(processor: &mut Processor<MemorySink>, event: LifecycleEvent) -> Result<()> {
    apply_from(processor, "main", event)
}

// ---------------------------------------------------------------------------
// Event builders
// ---------------------------------------------------------------------------

pub fn start_run(name: &str) -> LifecycleEvent {
    LifecycleEvent::StartRun(RunInfo {
        run_name: name.to_string(),
        product_name: "shop".to_string(),
        ..RunInfo::default()
    })
}

pub fn start_suite(name: &str) -> LifecycleEvent {
    LifecycleEvent::StartSuite {
        name: name.to_string(),
        package: "com.acme".to_string(),
    }
}

pub fn rename_suite(name: &str) -> LifecycleEvent {
    LifecycleEvent::UpdateSuite(SuiteUpdate {
        suite_name: Some(name.to_string()),
        user_note: None,
    })
}

pub fn start_testcase(name: &str) -> LifecycleEvent {
    LifecycleEvent::StartTestCase(TestcaseStart {
        suite_full_name: "com.acme.Login".to_string(),
        testcase_name: name.to_string(),
        ..TestcaseStart::default()
    })
}

pub fn end_testcase(result: TestResult) -> LifecycleEvent {
    LifecycleEvent::EndTestCase { result }
}

pub fn message(text: &str) -> LifecycleEvent {
    LifecycleEvent::message(MessageLevel::Info, text)
}

pub fn checkpoint_start(thread: &str, name: &str) -> LifecycleEvent {
    LifecycleEvent::StartCheckpoint(CheckpointStart {
        name: name.to_string(),
        thread: thread.to_string(),
        start_timestamp: 10_000,
        transfer_unit: "KB".to_string(),
    })
}

pub fn checkpoint_end(thread: &str, name: &str) -> LifecycleEvent {
    LifecycleEvent::EndCheckpoint(CheckpointEnd {
        name: name.to_string(),
        thread: thread.to_string(),
        end_timestamp: 10_250,
        transfer_size: 4,
        result: CheckpointResult::Passed,
    })
}

/// Run, suite and testcase opened in order.
pub fn open_testcase(processor: &mut Processor<MemorySink>, testcase: &str) {
    apply(processor, start_run("R1")).unwrap();
    apply(processor, start_suite("S1")).unwrap();
    apply(processor, start_testcase(testcase)).unwrap();
}
