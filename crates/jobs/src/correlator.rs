//! Completion event correlation and result aggregation.
//!
//! [`ResultCorrelator`] consumes raw channel messages, keeps only those
//! whose job id is tracked by this session, and appends each decoded
//! result fragment to the aggregate. Observers read the aggregate
//! through a `tokio::sync::watch` channel, which only changes when a
//! fragment is merged.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metascan_core::metadata::MetadataResult;
use metascan_core::notify::{Notification, NotificationSink};
use metascan_core::types::JobId;
use metascan_events::message::{ChannelMessage, CompletionEvent};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::tracker::JobTracker;

/// Message of the success notification sent for every merged result.
pub const COMPLETION_MESSAGE: &str = "Batch job completed successfully.";

/// A delivered event that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Event payload has no job id: {0}")]
    MissingJobId(#[source] serde_json::Error),

    #[error("Result payload for job {job_id} is invalid: {source}")]
    InvalidResult {
        job_id: JobId,
        #[source]
        source: serde_json::Error,
    },
}

/// What happened to one delivered event.
#[derive(Debug)]
pub enum Correlation {
    /// The fragment was appended to the aggregate.
    Merged { job_id: JobId, entries: usize },
    /// The job belongs to another session or an unrelated consumer.
    Untracked(JobId),
    /// The same event instance was already consumed (dedup enabled).
    Duplicate(JobId),
    /// The event was malformed and dropped.
    Dropped(ParseError),
}

/// Correlates completion events with tracked jobs and owns the
/// aggregate result.
pub struct ResultCorrelator {
    tracker: Arc<JobTracker>,
    aggregate: watch::Sender<MetadataResult>,
    sink: Arc<dyn NotificationSink>,
    seen_events: Option<Mutex<HashSet<String>>>,
    merged: AtomicUsize,
}

impl ResultCorrelator {
    pub fn new(tracker: Arc<JobTracker>, sink: Arc<dyn NotificationSink>) -> Self {
        let (aggregate, _) = watch::channel(MetadataResult::default());
        Self {
            tracker,
            aggregate,
            sink,
            seen_events: None,
            merged: AtomicUsize::new(0),
        }
    }

    /// Apply each event instance at most once.
    ///
    /// Events are keyed by replay id, or by job id plus raw payload when
    /// the transport reports no replay id.
    pub fn with_event_dedup(mut self) -> Self {
        self.seen_events = Some(Mutex::new(HashSet::new()));
        self
    }

    /// Current aggregate.
    pub fn snapshot(&self) -> MetadataResult {
        self.aggregate.borrow().clone()
    }

    pub fn has_results(&self) -> bool {
        self.aggregate.borrow().has_results()
    }

    /// Number of events merged so far.
    pub fn merged_count(&self) -> usize {
        self.merged.load(Ordering::SeqCst)
    }

    /// Receive the aggregate every time a fragment is merged.
    pub fn subscribe_updates(&self) -> watch::Receiver<MetadataResult> {
        self.aggregate.subscribe()
    }

    /// Correlate and, if relevant, merge one delivered event.
    pub async fn on_event(&self, message: &ChannelMessage) -> Correlation {
        let event = match CompletionEvent::from_message(message) {
            Ok(event) => event,
            Err(e) => {
                let error = ParseError::MissingJobId(e);
                tracing::warn!(
                    channel = %message.channel,
                    replay_id = ?message.replay_id,
                    error = %error,
                    "Dropping undecodable event",
                );
                return Correlation::Dropped(error);
            }
        };
        let job_id = JobId::new(event.job_id.clone());

        if !self.tracker.is_tracked(&job_id).await {
            tracing::debug!(job_id = %job_id, "Ignoring event for untracked job");
            return Correlation::Untracked(job_id);
        }

        if let Some(seen) = &self.seen_events {
            let key = match message.replay_id {
                Some(replay_id) => format!("replay:{replay_id}"),
                None => format!("job:{job_id}:{}", message.payload),
            };
            if !seen.lock().await.insert(key) {
                tracing::debug!(job_id = %job_id, "Ignoring redelivered event");
                return Correlation::Duplicate(job_id);
            }
        }

        let fragment: MetadataResult = match event.decode_result() {
            Ok(fragment) => fragment,
            Err(source) => {
                let error = ParseError::InvalidResult {
                    job_id: job_id.clone(),
                    source,
                };
                tracing::warn!(job_id = %job_id, error = %error, "Dropping event with invalid result");
                return Correlation::Dropped(error);
            }
        };

        let entries = fragment.entry_count();
        self.merged.fetch_add(1, Ordering::SeqCst);
        self.aggregate.send_modify(|aggregate| aggregate.merge(fragment));

        tracing::info!(job_id = %job_id, entries, "Merged job result");
        self.sink.notify(Notification::success(COMPLETION_MESSAGE));

        Correlation::Merged { job_id, entries }
    }

    /// Consume delivered messages until cancelled or the sender side is
    /// dropped.
    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::UnboundedReceiver<ChannelMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Correlator shutting down");
                    break;
                }
                message = messages.recv() => match message {
                    Some(message) => {
                        self.on_event(&message).await;
                    }
                    None => {
                        tracing::debug!("Message channel closed, correlator stopping");
                        break;
                    }
                }
            }
        }
    }
}
