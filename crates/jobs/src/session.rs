//! Per-session wiring of submitter, tracker, subscription and correlator.
//!
//! A [`MetadataSession`] is the explicit context object a front end
//! holds for as long as its extraction view is alive. It subscribes to
//! the completion channel on [`activate`](MetadataSession::activate) and
//! unsubscribes on [`deactivate`](MetadataSession::deactivate); each
//! component only receives the handles it needs.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use metascan_core::entity::{EntityCatalog, EntityScope};
use metascan_core::metadata::{JobRequest, MetadataResult};
use metascan_core::notify::{Notification, NotificationSink};
use metascan_core::types::JobId;
use metascan_events::{
    ChannelTransport, SubscriptionError, SubscriptionHandle, SubscriptionManager,
    SubscriptionState,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{JobService, JobServiceError};
use crate::config::SessionConfig;
use crate::correlator::ResultCorrelator;
use crate::submitter::{JobSubmitter, ScopedSubmission, SubmissionError};
use crate::tracker::JobTracker;

/// One extraction session.
pub struct MetadataSession {
    config: SessionConfig,
    service: Arc<dyn JobService>,
    tracker: Arc<JobTracker>,
    submitter: JobSubmitter,
    subscriptions: SubscriptionManager,
    correlator: Arc<ResultCorrelator>,
    sink: Arc<dyn NotificationSink>,
    active: Mutex<Option<ActiveSession>>,
    opening: StdMutex<Option<Opening>>,
    attempts: AtomicU64,
    in_flight: AtomicUsize,
}

/// An activation waiting for the transport to open.
struct Opening {
    attempt: u64,
    cancel: CancellationToken,
}

/// Resources held between activation and deactivation.
struct ActiveSession {
    handle: SubscriptionHandle,
    cancel: CancellationToken,
    correlator_task: JoinHandle<()>,
}

impl MetadataSession {
    /// Build a session. Transport failures are reported to `sink` as
    /// error notifications for the lifetime of the session.
    pub fn new(
        config: SessionConfig,
        service: Arc<dyn JobService>,
        transport: Arc<dyn ChannelTransport>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let tracker = Arc::new(JobTracker::new());
        let submitter = JobSubmitter::new(Arc::clone(&service), Arc::clone(&tracker));

        let subscriptions = SubscriptionManager::new(transport)
            .with_shutdown_timeout(config.shutdown_timeout())
            .with_strict_usage(config.strict_usage);
        let error_sink = Arc::clone(&sink);
        subscriptions.on_transport_error(move |e| {
            error_sink.notify(Notification::error(e.to_string()));
        });

        let mut correlator = ResultCorrelator::new(Arc::clone(&tracker), Arc::clone(&sink));
        if config.dedupe_events {
            correlator = correlator.with_event_dedup();
        }

        Self {
            config,
            service,
            tracker,
            submitter,
            subscriptions,
            correlator: Arc::new(correlator),
            sink,
            active: Mutex::new(None),
            opening: StdMutex::new(None),
            attempts: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// Subscribe to the completion channel and start correlating.
    ///
    /// Fails with [`SubscriptionError::AlreadySubscribed`] when the
    /// session is already active, and with
    /// [`SubscriptionError::Cancelled`] when [`deactivate`](Self::deactivate)
    /// runs before the channel opens.
    pub async fn activate(&self) -> Result<SubscriptionHandle, SubscriptionError> {
        let channel = self.config.event_channel.clone();
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        {
            let mut opening = self.lock_opening();
            if opening.is_none() {
                *opening = Some(Opening {
                    attempt,
                    cancel: cancel.clone(),
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => Err(SubscriptionError::Cancelled(channel.clone())),
            result = self.subscriptions.subscribe(channel.clone(), self.config.replay_from, tx) => result,
        };
        self.clear_opening(attempt);
        let handle = subscribed?;

        let mut active = self.active.lock().await;
        if cancel.is_cancelled() {
            drop(active);
            self.subscriptions.unsubscribe(&handle).await;
            tracing::info!(subscription = %handle, "Activation cancelled by deactivate");
            return Err(SubscriptionError::Cancelled(channel));
        }

        let stop = CancellationToken::new();
        let correlator_task = tokio::spawn(Arc::clone(&self.correlator).run(rx, stop.clone()));

        // A previous subscription that failed on its own still has a
        // correlator task waiting for its closed channel.
        if let Some(stale) = active.replace(ActiveSession {
            handle: handle.clone(),
            cancel: stop,
            correlator_task,
        }) {
            stale.cancel.cancel();
            let _ = stale.correlator_task.await;
        }

        tracing::info!(subscription = %handle, "Session activated");
        Ok(handle)
    }

    /// Unsubscribe and stop correlating. Safe to call repeatedly.
    ///
    /// An activation still waiting for the transport is cancelled.
    pub async fn deactivate(&self) {
        if let Some(opening) = self.lock_opening().take() {
            opening.cancel.cancel();
        }

        let Some(active) = self.active.lock().await.take() else {
            tracing::debug!("Deactivate called on inactive session");
            return;
        };

        self.subscriptions.unsubscribe(&active.handle).await;

        // The delivery task dropped its sender, so the correlator drains
        // what is queued and exits on its own.
        let mut task = active.correlator_task;
        if tokio::time::timeout(self.config.shutdown_timeout(), &mut task)
            .await
            .is_err()
        {
            tracing::warn!("Correlator did not drain in time, cancelling");
            active.cancel.cancel();
            let _ = task.await;
        }

        tracing::info!(subscription = %active.handle, "Session deactivated");
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscriptions.state()
    }

    fn lock_opening(&self) -> std::sync::MutexGuard<'_, Option<Opening>> {
        self.opening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_opening(&self, attempt: u64) {
        let mut opening = self.lock_opening();
        if opening.as_ref().is_some_and(|o| o.attempt == attempt) {
            *opening = None;
        }
    }

    /// Submit one single-scope request and notify the user of the outcome.
    pub async fn submit(&self, request: &JobRequest) -> Result<JobId, SubmissionError> {
        let _loading = InFlight::enter(&self.in_flight);
        let result = self.submitter.submit(request).await;
        self.report_submission(request.scope(), &result);
        result
    }

    /// Submit a selection that may span both scopes, one job per scope.
    pub async fn submit_selection(&self, request: JobRequest) -> Vec<ScopedSubmission> {
        let _loading = InFlight::enter(&self.in_flight);
        let outcomes = self.submitter.submit_selection(request).await;
        for outcome in &outcomes {
            self.report_submission(Some(outcome.scope), &outcome.result);
        }
        outcomes
    }

    /// Fetch and classify the entities the service can inspect.
    pub async fn catalog(&self) -> Result<EntityCatalog, JobServiceError> {
        let _loading = InFlight::enter(&self.in_flight);
        match self.service.list_entities().await {
            Ok(names) => Ok(EntityCatalog::from_names(names)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list entities");
                self.sink.notify(Notification::error(
                    e.message().map(str::to_string).unwrap_or_default(),
                ));
                Err(e)
            }
        }
    }

    /// Aggregate of every correlated result so far.
    pub fn results(&self) -> MetadataResult {
        self.correlator.snapshot()
    }

    pub fn has_results(&self) -> bool {
        self.correlator.has_results()
    }

    /// Number of completion events merged into the aggregate.
    pub fn merged_count(&self) -> usize {
        self.correlator.merged_count()
    }

    /// Observe the aggregate; changes only when a result is merged.
    pub fn updates(&self) -> watch::Receiver<MetadataResult> {
        self.correlator.subscribe_updates()
    }

    /// True while a submission or catalog request is in flight.
    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    fn report_submission(
        &self,
        scope: Option<EntityScope>,
        result: &Result<JobId, SubmissionError>,
    ) {
        let notification = match result {
            Ok(_) => {
                let scope = scope.map(EntityScope::as_str).unwrap_or("selected");
                Notification::success(format!("Processing of {scope} objects started."))
            }
            Err(e) => Notification::error(e.to_string()),
        };
        self.sink.notify(notification);
    }
}

/// Counts an in-flight request for as long as it is alive.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
