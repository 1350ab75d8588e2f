//! Background polling on the server.
//!
//! Covers the case where no operator has the dashboard open: both streams are
//! polled on periodic wake-ups and fed straight into the ingestion service.
//! Wake-ups can also be requested on demand.

use crate::config::Config;
use crate::ingest::BatchSink;
use crate::models::StreamKind;
use crate::poller::{ErrorSlot, Poller, Scheduler};
use crate::upstream::UpstreamClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Background poller for both streams
pub struct BackgroundPoller {
    upstream: UpstreamClient,
    sink: Arc<dyn BatchSink>,
    errors: ErrorSlot,
    wake_interval: Duration,
    notification_window_hours: u32,
    cancellation_window_hours: u32,
    notifications_signal: Arc<Notify>,
    cancellations_signal: Arc<Notify>,
}

impl BackgroundPoller {
    pub fn new(
        config: &Config,
        upstream: UpstreamClient,
        sink: Arc<dyn BatchSink>,
        errors: ErrorSlot,
    ) -> Self {
        Self {
            upstream,
            sink,
            errors,
            wake_interval: config.background_wake_interval,
            notification_window_hours: config.notification_window_hours,
            cancellation_window_hours: config.cancellation_window_hours,
            notifications_signal: Arc::new(Notify::new()),
            cancellations_signal: Arc::new(Notify::new()),
        }
    }

    /// Request an immediate iteration of both streams. Wake-ups arriving while
    /// an iteration runs collapse into one follow-up iteration.
    pub fn wake(&self) {
        self.notifications_signal.notify_one();
        self.cancellations_signal.notify_one();
    }

    /// Start both pollers and the periodic wake-up task
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        for (stream, window, signal) in [
            (
                StreamKind::Notifications,
                self.notification_window_hours,
                self.notifications_signal.clone(),
            ),
            (
                StreamKind::Cancellations,
                self.cancellation_window_hours,
                self.cancellations_signal.clone(),
            ),
        ] {
            let poller = Poller::new(
                stream,
                self.upstream.clone(),
                self.sink.clone(),
                window,
                self.errors.clone(),
            );
            handles.push(poller.spawn(Scheduler::WakeUp { signal }, None, shutdown.clone()));
        }

        let worker = self.clone();
        let mut shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            info!(
                interval_secs = worker.wake_interval.as_secs(),
                "Started background wake-ups"
            );

            let start = tokio::time::Instant::now() + worker.wake_interval;
            let mut ticker = tokio::time::interval_at(start, worker.wake_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Background wake-up");
                        worker.wake();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }
}
