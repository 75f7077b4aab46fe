//! One-shot completion signals for synchronizing events.
//!
//! A producer submitting `start_run`, `start_test_case`, `end_test_case` or
//! `end_run` blocks on a [`CompletionWaiter`] until the consumer settles the
//! matching [`Completion`], or until a bounded wait expires. A timed-out wait
//! is logged and the producer proceeds; if the event then fails, the error is
//! parked in [`LateFailures`] and re-raised by the next synchronizing submit.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::event::EventKind;

/// How long a producer is willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitClass {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeouts {
    pub short: Duration,
    pub long: Duration,
}

impl WaitTimeouts {
    #[must_use]
    pub const fn for_class(&self, class: WaitClass) -> Duration {
        match class {
            WaitClass::Short => self.short,
            WaitClass::Long => self.long,
        }
    }
}

impl Default for WaitTimeouts {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for WaitTimeouts {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            short: Duration::from_secs(config.short_timeout_secs),
            long: Duration::from_secs(config.long_timeout_secs),
        }
    }
}

/// Result of a submission as seen by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WaitOutcome {
    /// Enqueued without waiting.
    Queued,
    /// The consumer processed the event successfully.
    Completed,
    /// The wait expired; the event may still be processed later.
    TimedOut { waited_ms: u64 },
}

const PENDING: u8 = 0;
const SETTLED: u8 = 1;
const ABANDONED: u8 = 2;

/// Who got to the event first: the consumer settling it or the producer
/// giving up. Exactly one side wins.
#[derive(Debug, Default)]
struct Handoff(AtomicU8);

impl Handoff {
    fn claim_settle(&self) -> bool {
        self.0
            .compare_exchange(PENDING, SETTLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Create a linked completion pair for one event.
#[must_use]
pub fn completion(kind: EventKind) -> (Completion, CompletionWaiter) {
    let (tx, rx) = channel::bounded(1);
    let handoff = Arc::new(Handoff::default());
    (
        Completion {
            kind,
            tx,
            handoff: Arc::clone(&handoff),
        },
        CompletionWaiter { kind, rx, handoff },
    )
}

/// Consumer half. Settled exactly once, by value.
#[derive(Debug)]
pub struct Completion {
    kind: EventKind,
    tx: Sender<Result<()>>,
    handoff: Arc<Handoff>,
}

impl Completion {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Deliver the outcome to the waiting producer. If the producer already
    /// stopped waiting, the outcome is handed back.
    pub fn settle(self, outcome: Result<()>) -> std::result::Result<(), Result<()>> {
        if !self.handoff.claim_settle() {
            return Err(outcome);
        }
        self.tx.send(outcome).map_err(|undelivered| undelivered.0)
    }
}

/// Producer half.
#[derive(Debug)]
pub struct CompletionWaiter {
    kind: EventKind,
    rx: Receiver<Result<()>>,
    handoff: Arc<Handoff>,
}

impl CompletionWaiter {
    /// Block until the consumer settles the event or `timeout` elapses.
    ///
    /// A settle that races the timeout is still delivered here rather than
    /// lost.
    pub fn wait(self, timeout: Duration) -> Result<WaitOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome.map(|()| WaitOutcome::Completed),
            Err(RecvTimeoutError::Timeout) if self.handoff.abandon() => {
                warn!(
                    event = %self.kind,
                    timeout_ms = timeout.as_millis() as u64,
                    "Event not processed in time; continuing without waiting"
                );
                Ok(WaitOutcome::TimedOut {
                    waited_ms: timeout.as_millis() as u64,
                })
            }
            Err(RecvTimeoutError::Timeout) => match self.rx.recv() {
                Ok(outcome) => outcome.map(|()| WaitOutcome::Completed),
                Err(_) => Err(self.closed()),
            },
            Err(RecvTimeoutError::Disconnected) => Err(self.closed()),
        }
    }

    fn closed(&self) -> Error {
        Error::PipelineClosed(format!(
            "consumer dropped {} without settling it",
            self.kind
        ))
    }
}

/// Failures of synchronizing events whose producer had already timed out.
///
/// Holds the most recent one; an older unreported failure is replaced.
#[derive(Debug, Default)]
pub struct LateFailures {
    slot: Mutex<Option<Error>>,
}

impl LateFailures {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, err: Error) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(err);
    }

    pub fn take(&self) -> Option<Error> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
