//! Upstream poller.
//!
//! One poller per stream. It asks the upstream source for everything since
//! its checkpoint, hands the batch to a [`BatchSink`] and only then moves the
//! checkpoint forward. A failed iteration leaves the checkpoint alone, so the
//! next window always covers the failed one. Duplicate suppression is the
//! sink's job.

use crate::classify::extract_fields;
use crate::ingest::{BatchSink, SinkError};
use crate::models::{IngestResult, IngestStatus, RawMessage, StreamKind};
use crate::upstream::{UpstreamClient, UpstreamError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lookback window in whole hours: `max(1, ceil((now - last) / 1h))`, or
/// `default_hours` without a checkpoint.
pub fn since_hours(now: DateTime<Utc>, last_checked: Option<DateTime<Utc>>, default_hours: u32) -> u32 {
    let Some(last) = last_checked else {
        return default_hours.max(1);
    };
    let elapsed_ms = (now - last).num_milliseconds().max(0);
    let hour_ms = 3_600_000;
    let hours = (elapsed_ms + hour_ms - 1) / hour_ms;
    u32::try_from(hours).unwrap_or(u32::MAX).max(1)
}

/// What triggers the next iteration
#[derive(Debug, Clone)]
pub enum Scheduler {
    /// Fixed timer, started after the previous iteration completes
    Foreground { interval: Duration },
    /// External wake-ups (periodic or on demand)
    WakeUp { signal: Arc<Notify> },
}

/// Result of one successful iteration
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub stream: StreamKind,
    pub fetched_at: DateTime<Utc>,
    pub hours: u32,
    pub messages: Vec<RawMessage>,
    pub results: Vec<IngestResult>,
    /// Checkpoint after this iteration
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Last poll failure, for display
#[derive(Debug, Clone, PartialEq)]
pub struct PollFailure {
    pub stream: StreamKind,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Error slot shared by the pollers of one process
#[derive(Clone)]
pub struct ErrorSlot(Arc<watch::Sender<Option<PollFailure>>>);

impl Default for ErrorSlot {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self(Arc::new(tx))
    }
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, failure: PollFailure) {
        self.0.send_replace(Some(failure));
    }

    /// Clear the slot if it holds a failure of `stream`
    pub fn clear(&self, stream: StreamKind) {
        self.0.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|f| f.stream == stream) {
                *slot = None;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> Option<PollFailure> {
        self.0.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PollFailure>> {
        self.0.subscribe()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub struct Poller {
    stream: StreamKind,
    upstream: UpstreamClient,
    sink: Arc<dyn BatchSink>,
    default_window_hours: u32,
    checkpoint: Option<DateTime<Utc>>,
    errors: ErrorSlot,
}

impl Poller {
    pub fn new(
        stream: StreamKind,
        upstream: UpstreamClient,
        sink: Arc<dyn BatchSink>,
        default_window_hours: u32,
        errors: ErrorSlot,
    ) -> Self {
        Self {
            stream,
            upstream,
            sink,
            default_window_hours,
            checkpoint: None,
            errors,
        }
    }

    /// Resume from a persisted checkpoint
    pub fn with_checkpoint(mut self, checkpoint: Option<DateTime<Utc>>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn checkpoint(&self) -> Option<DateTime<Utc>> {
        self.checkpoint
    }

    /// Run one fetch-and-ingest iteration.
    ///
    /// The checkpoint moves to `now` only when the sink accepted the batch and
    /// no item was turned away because the store is still initializing.
    pub async fn poll_once(&mut self, now: DateTime<Utc>) -> Result<PollOutcome, PollError> {
        let hours = since_hours(now, self.checkpoint, self.default_window_hours);

        match self.fetch_and_submit(hours).await {
            Ok((messages, results)) => {
                let initializing = results
                    .iter()
                    .filter(|r| r.status == IngestStatus::NotSaved)
                    .count();
                if initializing == 0 {
                    self.checkpoint = Some(now);
                } else {
                    info!(
                        stream = %self.stream,
                        initializing,
                        "Store initializing, keeping checkpoint"
                    );
                }
                self.errors.clear(self.stream);

                Ok(PollOutcome {
                    stream: self.stream,
                    fetched_at: now,
                    hours,
                    messages,
                    results,
                    checkpoint: self.checkpoint,
                })
            }
            Err(e) => {
                warn!(stream = %self.stream, hours, error = %e, "Poll failed");
                self.errors.record(PollFailure {
                    stream: self.stream,
                    at: now,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn fetch_and_submit(
        &self,
        hours: u32,
    ) -> Result<(Vec<RawMessage>, Vec<IngestResult>), PollError> {
        let mut messages = self.upstream.fetch_recent(self.stream, hours).await?;
        for message in &mut messages {
            extract_fields(message);
        }

        if messages.is_empty() {
            return Ok((messages, Vec::new()));
        }
        let results = self.sink.submit(self.stream, messages.clone()).await?;
        Ok((messages, results))
    }

    /// Poll until shutdown. Each iteration completes before the scheduler is
    /// consulted again, so iterations of one stream never overlap.
    pub async fn run(
        mut self,
        scheduler: Scheduler,
        outcomes: Option<mpsc::Sender<PollOutcome>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(stream = %self.stream, scheduler = ?scheduler, "Poller started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Ok(outcome) = self.poll_once(Utc::now()).await {
                if let Some(tx) = &outcomes {
                    if tx.send(outcome).await.is_err() {
                        debug!(stream = %self.stream, "Outcome receiver gone");
                        break;
                    }
                }
            }

            let next = async {
                match &scheduler {
                    Scheduler::Foreground { interval } => tokio::time::sleep(*interval).await,
                    Scheduler::WakeUp { signal } => signal.notified().await,
                }
            };
            tokio::select! {
                () = next => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(stream = %self.stream, "Poller stopped");
    }

    /// Run on a background task
    pub fn spawn(
        self,
        scheduler: Scheduler,
        outcomes: Option<mpsc::Sender<PollOutcome>>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(scheduler, outcomes, shutdown))
    }
}
