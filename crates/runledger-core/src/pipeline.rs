//! Event queue, consumer thread and producer API.
//!
//! Producers on any thread push [`Envelope`]s onto an unbounded FIFO. A single
//! consumer thread owns the [`Processor`] and applies events in arrival order.
//! Testcase deletions bypass the FIFO on their own channel and are drained
//! every time the consumer wakes up, before the popped event is applied.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::bridge::{self, Completion, LateFailures, WaitClass, WaitOutcome, WaitTimeouts};
use crate::config::{Config, ProcessorConfig};
use crate::error::{Error, Result};
use crate::event::{EntityId, Envelope, LifecycleEvent};
use crate::lifecycle::ObservedState;
use crate::logging::CONSOLE_TARGET;
use crate::processor::Processor;
use crate::sink::WriteSink;

const CONSUMER_THREAD_NAME: &str = "runledger-consumer";

/// Settings for [`EventPipeline::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub processor: ProcessorConfig,
    pub timeouts: WaitTimeouts,
}

impl PipelineConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            processor: config.processor.clone(),
            timeouts: WaitTimeouts::from(&config.bridge),
        }
    }
}

enum QueueItem {
    Event {
        envelope: Envelope,
        completion: Option<Completion>,
    },
    /// Nudge the consumer to drain pending deletions.
    Wake,
    Shutdown,
}

/// Producer handle to a running consumer thread.
pub struct EventPipeline {
    events: Sender<QueueItem>,
    deletions: Sender<EntityId>,
    observed: Arc<ObservedState>,
    late_failures: Arc<LateFailures>,
    timeouts: WaitTimeouts,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("queued", &self.events.len())
            .field("timeouts", &self.timeouts)
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl EventPipeline {
    /// Spawn the consumer thread over `sink`.
    pub fn start<S: WriteSink + 'static>(sink: S, config: PipelineConfig) -> Result<Self> {
        let (events, event_rx) = channel::unbounded();
        let (deletions, deletion_rx) = channel::unbounded();
        let observed = Arc::new(ObservedState::new());
        let late_failures = Arc::new(LateFailures::new());

        let poll_timeout = config.processor.poll_timeout();
        let backend = sink.backend_kind();
        let consumer = Consumer {
            processor: Processor::new(sink, config.processor),
            events: event_rx,
            deletions: deletion_rx,
            observed: Arc::clone(&observed),
            late_failures: Arc::clone(&late_failures),
            poll_timeout,
        };
        let worker = thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.into())
            .spawn(move || consumer.run())?;

        info!(
            backend = backend.as_str(),
            poll_timeout_ms = poll_timeout.as_millis() as u64,
            "Event pipeline started"
        );
        Ok(Self {
            events,
            deletions,
            observed,
            late_failures,
            timeouts: config.timeouts,
            worker: Some(worker),
        })
    }

    /// Snapshot of the consumer's lifecycle state.
    #[must_use]
    pub fn observed(&self) -> &ObservedState {
        &self.observed
    }

    #[must_use]
    pub const fn timeouts(&self) -> WaitTimeouts {
        self.timeouts
    }

    /// Enqueue without waiting.
    pub fn submit(&self, event: LifecycleEvent) -> Result<()> {
        self.submit_envelope(Envelope::capture(event))
    }

    pub fn submit_envelope(&self, envelope: Envelope) -> Result<()> {
        self.enqueue(envelope, None)
    }

    /// Enqueue and block until the consumer has applied the event, or the
    /// timeout of `class` expires.
    pub fn submit_and_wait(&self, event: LifecycleEvent, class: WaitClass) -> Result<WaitOutcome> {
        self.submit_envelope_and_wait(Envelope::capture(event), class)
    }

    pub fn submit_envelope_and_wait(
        &self,
        envelope: Envelope,
        class: WaitClass,
    ) -> Result<WaitOutcome> {
        let (done, waiter) = bridge::completion(envelope.kind());
        self.enqueue(envelope, Some(done))?;
        let outcome = waiter.wait(self.timeouts.for_class(class))?;
        if let Some(late) = self.late_failures.take() {
            warn!(error = %late, "Re-raising failure of an event that outlived its wait");
            return Err(late);
        }
        Ok(outcome)
    }

    /// Route an event by kind: deletions go out-of-band, synchronizing
    /// events wait, everything else is queued.
    pub fn dispatch(&self, event: LifecycleEvent) -> Result<WaitOutcome> {
        self.dispatch_envelope(Envelope::capture(event))
    }

    pub fn dispatch_envelope(&self, envelope: Envelope) -> Result<WaitOutcome> {
        if let LifecycleEvent::DeleteTestCase { testcase_id } = envelope.event() {
            self.request_deletion(*testcase_id)?;
            return Ok(WaitOutcome::Queued);
        }
        match envelope.kind().wait_class() {
            Some(class) => self.submit_envelope_and_wait(envelope, class),
            None => {
                self.submit_envelope(envelope)?;
                Ok(WaitOutcome::Queued)
            }
        }
    }

    /// Ask the consumer to delete a testcase ahead of queued events.
    pub fn request_deletion(&self, testcase_id: EntityId) -> Result<()> {
        self.deletions.send(testcase_id).map_err(|_| {
            Error::PipelineClosed(format!("deletion of testcase {testcase_id} not delivered"))
        })?;
        let _ = self.events.send(QueueItem::Wake);
        Ok(())
    }

    /// Drain the queue, flush the sink and join the consumer thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.events.send(QueueItem::Shutdown);
        worker
            .join()
            .map_err(|_| Error::PipelineClosed("consumer thread panicked".to_string()))?;
        debug!("Event pipeline stopped");
        match self.late_failures.take() {
            Some(late) => Err(late),
            None => Ok(()),
        }
    }

    fn enqueue(&self, envelope: Envelope, completion: Option<Completion>) -> Result<()> {
        let kind = envelope.kind();
        self.events
            .send(QueueItem::Event {
                envelope,
                completion,
            })
            .map_err(|_| Error::PipelineClosed(format!("{kind} not delivered")))
    }
}

impl Drop for EventPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "Event pipeline stopped with an unreported failure");
        }
    }
}

struct Consumer<S> {
    processor: Processor<S>,
    events: Receiver<QueueItem>,
    deletions: Receiver<EntityId>,
    observed: Arc<ObservedState>,
    late_failures: Arc<LateFailures>,
    poll_timeout: Duration,
}

impl<S: WriteSink> Consumer<S> {
    fn run(mut self) {
        loop {
            let item = self.events.recv_timeout(self.poll_timeout);
            self.drain_deletions();
            match item {
                Ok(QueueItem::Event {
                    envelope,
                    completion,
                }) => self.apply(&envelope, completion),
                Ok(QueueItem::Wake) => {}
                Ok(QueueItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = self.processor.on_idle() {
                        warn!(target: CONSOLE_TARGET, error = %err, "Idle flush failed");
                    }
                }
            }
        }

        self.drain_deletions();
        if let Err(err) = self.processor.flush() {
            error!(target: CONSOLE_TARGET, error = %err, "Final flush failed");
        }
        debug!("Consumer loop exited");
    }

    fn drain_deletions(&mut self) {
        for testcase_id in self.deletions.try_iter() {
            if let Err(err) = self.processor.delete_testcase(testcase_id) {
                warn!(target: CONSOLE_TARGET, testcase_id, error = %err, "Testcase deletion failed");
            }
        }
        self.observed.publish(self.processor.state());
    }

    fn apply(&mut self, envelope: &Envelope, completion: Option<Completion>) {
        let result = self.processor.process(envelope);
        self.observed.publish(self.processor.state());

        match completion {
            Some(done) => {
                if let Err(Err(err)) = done.settle(result) {
                    error!(
                        target: CONSOLE_TARGET,
                        event = %envelope.kind(),
                        error = %err,
                        "Event failed after its producer stopped waiting"
                    );
                    self.late_failures.record(err);
                }
            }
            None => {
                if let Err(err) = result {
                    warn!(
                        target: CONSOLE_TARGET,
                        event = %envelope.kind(),
                        error = %err,
                        "Event failed"
                    );
                }
            }
        }
    }
}
