//! Subscription lifecycle for a single broadcast channel.
//!
//! [`SubscriptionManager`] owns at most one live subscription. It opens
//! the channel through a [`ChannelTransport`], runs a delivery task that
//! pushes each message onto the caller's mpsc sender, reports transport
//! failures to every registered error listener, and tears the
//! subscription down on [`unsubscribe`](SubscriptionManager::unsubscribe).
//!
//! State machine:
//!
//! ```text
//! Idle -> Subscribing -> Subscribed -> Idle      (unsubscribe)
//!                        Subscribed -> Error -> Idle (transport failure, then unsubscribe)
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::message::{ChannelMessage, ChannelName, ReplayPosition};
use crate::transport::{ChannelTransport, MessageStream, TransportError};

/// How long `unsubscribe` waits for the delivery task to exit.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked for every transport failure.
pub type ErrorListener = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Subscribed,
    Error,
}

/// Reference to the live subscription returned by
/// [`SubscriptionManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: Uuid,
    channel: ChannelName,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.channel, self.id)
    }
}

/// Errors returned by [`SubscriptionManager::subscribe`].
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// A subscription is already being established or is live.
    /// Callers must unsubscribe first. Panics instead when the manager
    /// enforces strict usage (the default in debug builds).
    #[error("A subscription to {0} is already active")]
    AlreadySubscribed(ChannelName),

    /// The caller stopped waiting before the channel opened.
    #[error("Subscription to {0} was cancelled before it opened")]
    Cancelled(ChannelName),

    /// The transport could not open the channel.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Manages the single channel subscription of one session instance.
pub struct SubscriptionManager {
    transport: Arc<dyn ChannelTransport>,
    shared: Arc<Shared>,
    shutdown_timeout: Duration,
    strict_usage: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<ErrorListener>>,
}

struct Inner {
    state: SubscriptionState,
    channel: Option<ChannelName>,
    active: Option<ActiveSubscription>,
}

/// Internal bookkeeping for the live subscription.
struct ActiveSubscription {
    id: Uuid,
    cancel: CancellationToken,
    task_handle: tokio::task::JoinHandle<()>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SubscriptionState::Idle,
                    channel: None,
                    active: None,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            strict_usage: cfg!(debug_assertions),
        }
    }

    /// Override how long teardown waits for the delivery task.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Panic on a second concurrent subscribe instead of returning
    /// [`SubscriptionError::AlreadySubscribed`]. On by default in debug
    /// builds.
    pub fn with_strict_usage(mut self, strict: bool) -> Self {
        self.strict_usage = strict;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.shared.lock_inner().state
    }

    /// Register a listener for transport failures.
    ///
    /// Listeners are instance-wide and stay registered across
    /// subscriptions. They only report; they cannot stop delivery.
    pub fn on_transport_error<F>(&self, listener: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Open `channel` and deliver every message to `on_message`.
    ///
    /// Rejected with [`SubscriptionError::AlreadySubscribed`] while a
    /// subscription is being established or is live; the existing
    /// subscription is left untouched. Allowed from `Idle` and `Error`.
    ///
    /// Dropping the returned future before it resolves returns the
    /// manager to `Idle`.
    pub async fn subscribe(
        &self,
        channel: ChannelName,
        replay: ReplayPosition,
        on_message: mpsc::UnboundedSender<ChannelMessage>,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        {
            let mut inner = self.shared.lock_inner();
            if matches!(
                inner.state,
                SubscriptionState::Subscribing | SubscriptionState::Subscribed
            ) {
                let active = inner.channel.clone().unwrap_or_else(|| channel.clone());
                tracing::error!(
                    channel = %channel,
                    active_channel = %active,
                    "Subscribe called while a subscription is already active",
                );
                if self.strict_usage {
                    drop(inner);
                    panic!("subscribe called while a subscription to {active} is already active");
                }
                return Err(SubscriptionError::AlreadySubscribed(active));
            }
            inner.state = SubscriptionState::Subscribing;
            inner.channel = Some(channel.clone());
        }

        let opening = OpeningGuard {
            shared: &self.shared,
            channel: &channel,
            armed: true,
        };

        let stream = match self.transport.open(&channel, replay).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Failed to open subscription");
                opening.disarm();
                {
                    let mut inner = self.shared.lock_inner();
                    inner.state = SubscriptionState::Error;
                    inner.channel = None;
                }
                self.shared.report(&e);
                return Err(e.into());
            }
        };
        opening.disarm();

        // Hold the lock while spawning so a delivery task that fails
        // immediately observes its own registration in `mark_failed`.
        let mut inner = self.shared.lock_inner();
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let task_handle = tokio::spawn(run_delivery(
            id,
            stream,
            on_message,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));

        inner.state = SubscriptionState::Subscribed;
        inner.active = Some(ActiveSubscription {
            id,
            cancel,
            task_handle,
        });

        tracing::info!(channel = %channel, replay = %replay, subscription_id = %id, "Subscribed");
        Ok(SubscriptionHandle { id, channel })
    }

    /// Tear down the subscription referenced by `handle`.
    ///
    /// Idempotent: a stale or unknown handle is logged and ignored. The
    /// manager is `Idle` afterwards unless a different subscription is
    /// live.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let active = {
            let mut inner = self.shared.lock_inner();
            if inner.active.as_ref().is_some_and(|a| a.id == handle.id) {
                inner.state = SubscriptionState::Idle;
                inner.channel = None;
                inner.active.take()
            } else {
                if inner.state == SubscriptionState::Error {
                    inner.state = SubscriptionState::Idle;
                    inner.channel = None;
                }
                None
            }
        };

        let Some(active) = active else {
            tracing::debug!(subscription = %handle, "Unsubscribe for inactive handle ignored");
            return;
        };

        active.cancel.cancel();
        let mut task = active.task_handle;
        if tokio::time::timeout(self.shutdown_timeout, &mut task)
            .await
            .is_err()
        {
            tracing::warn!(subscription = %handle, "Delivery task did not stop in time, aborting");
            task.abort();
        }

        tracing::info!(subscription = %handle, "Unsubscribed");
    }
}

/// Returns the manager to `Idle` if `subscribe` is dropped while the
/// transport is still opening.
struct OpeningGuard<'a> {
    shared: &'a Shared,
    channel: &'a ChannelName,
    armed: bool,
}

impl OpeningGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.shared.lock_inner();
        if inner.state == SubscriptionState::Subscribing {
            inner.state = SubscriptionState::Idle;
            inner.channel = None;
            tracing::debug!(channel = %self.channel, "Subscribe abandoned while opening");
        }
    }
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invoke every listener; a panicking listener is logged and skipped.
    fn report(&self, error: &TransportError) {
        let listeners: Vec<ErrorListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(error))).is_err() {
                tracing::error!(error = %error, "Transport error listener panicked");
            }
        }
    }

    /// Drop the live subscription after a fatal transport failure.
    fn mark_failed(&self, id: Uuid) {
        let mut inner = self.lock_inner();
        if inner.active.as_ref().is_some_and(|a| a.id == id) {
            inner.active = None;
            inner.channel = None;
            inner.state = SubscriptionState::Error;
        }
    }
}

/// Delivery loop: forward messages until cancelled, the consumer goes
/// away, or the transport fails.
async fn run_delivery(
    id: Uuid,
    mut stream: MessageStream,
    on_message: mpsc::UnboundedSender<ChannelMessage>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(subscription_id = %id, "Delivery cancelled");
                return;
            }
            next = stream.next() => match next {
                Some(Ok(message)) => {
                    if on_message.send(message).is_err() {
                        tracing::debug!(subscription_id = %id, "Message consumer dropped, stopping delivery");
                        return;
                    }
                }
                Some(Err(e)) if !e.is_fatal() => {
                    tracing::warn!(subscription_id = %id, error = %e, "Transport reported a recoverable error");
                    shared.report(&e);
                }
                Some(Err(e)) => {
                    tracing::error!(subscription_id = %id, error = %e, "Subscription failed");
                    shared.mark_failed(id);
                    shared.report(&e);
                    return;
                }
                None => {
                    let e = TransportError::Closed("subscription stream ended".to_string());
                    tracing::error!(subscription_id = %id, "Subscription stream ended");
                    shared.mark_failed(id);
                    shared.report(&e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::transport::InProcessTransport;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager_with_bus() -> (SubscriptionManager, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let transport = Arc::new(InProcessTransport::new(Arc::clone(&bus)));
        (SubscriptionManager::new(transport).with_strict_usage(false), bus)
    }

    /// Transport whose first `open` never completes; later calls read
    /// from the bus.
    struct StallsOnce {
        calls: AtomicUsize,
        bus: Arc<EventBus>,
    }

    #[async_trait::async_trait]
    impl ChannelTransport for StallsOnce {
        async fn open(
            &self,
            channel: &ChannelName,
            replay: ReplayPosition,
        ) -> Result<MessageStream, TransportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                futures::future::pending::<()>().await;
            }
            InProcessTransport::new(Arc::clone(&self.bus))
                .open(channel, replay)
                .await
        }
    }

    /// Transport whose streams fail immediately (or never open).
    struct FailingTransport {
        open_fails: bool,
    }

    #[async_trait::async_trait]
    impl ChannelTransport for FailingTransport {
        async fn open(
            &self,
            _channel: &ChannelName,
            _replay: ReplayPosition,
        ) -> Result<MessageStream, TransportError> {
            if self.open_fails {
                return Err(TransportError::Connection("refused".into()));
            }
            Ok(futures::stream::iter(vec![Err(TransportError::Delivery("reset".into()))]).boxed())
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_messages() {
        let (manager, bus) = manager_with_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await
            .unwrap();
        assert_eq!(manager.state(), SubscriptionState::Subscribed);

        bus.publish(&ChannelName::default(), serde_json::json!({"jobId": "J1"}));
        let message = rx.recv().await.unwrap();
        assert_eq!(message.payload["jobId"], "J1");

        manager.unsubscribe(&handle).await;
    }

    #[tokio::test]
    async fn second_subscribe_is_rejected_and_first_stays_live() {
        let (manager, bus) = manager_with_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let handle = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await
            .unwrap();

        let second = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx2)
            .await;
        assert_matches!(second, Err(SubscriptionError::AlreadySubscribed(_)));
        assert_eq!(manager.state(), SubscriptionState::Subscribed);

        bus.publish(&ChannelName::default(), serde_json::json!({"jobId": "J2"}));
        assert_eq!(rx.recv().await.unwrap().payload["jobId"], "J2");

        manager.unsubscribe(&handle).await;
    }

    #[tokio::test]
    async fn unsubscribe_twice_is_idle_and_silent() {
        let (manager, bus) = manager_with_bus();
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await
            .unwrap();

        manager.unsubscribe(&handle).await;
        assert_eq!(manager.state(), SubscriptionState::Idle);
        assert_eq!(bus.receiver_count(), 0);

        manager.unsubscribe(&handle).await;
        assert_eq!(manager.state(), SubscriptionState::Idle);
    }

    #[tokio::test]
    async fn resubscribe_after_unsubscribe_is_allowed() {
        let (manager, _bus) = manager_with_bus();
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx.clone())
            .await
            .unwrap();
        manager.unsubscribe(&first).await;

        let second = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await
            .unwrap();
        assert_ne!(first.id(), second.id());

        // The stale handle must not tear down the new subscription.
        manager.unsubscribe(&first).await;
        assert_eq!(manager.state(), SubscriptionState::Subscribed);

        manager.unsubscribe(&second).await;
    }

    #[tokio::test]
    async fn delivery_failure_moves_to_error_and_notifies_listeners() {
        let manager = SubscriptionManager::new(Arc::new(FailingTransport { open_fails: false }));
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        manager.on_transport_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await
            .unwrap();

        for _ in 0..50 {
            if manager.state() == SubscriptionState::Error {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.state(), SubscriptionState::Error);
        assert_eq!(reported.load(Ordering::SeqCst), 1);

        manager.unsubscribe(&handle).await;
        assert_eq!(manager.state(), SubscriptionState::Idle);
    }

    #[tokio::test]
    async fn open_failure_is_returned_and_reported() {
        let manager = SubscriptionManager::new(Arc::new(FailingTransport { open_fails: true }));
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        manager.on_transport_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await;

        assert_matches!(result, Err(SubscriptionError::Transport(TransportError::Connection(_))));
        assert_eq!(manager.state(), SubscriptionState::Error);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_subscribe_returns_to_idle() {
        let bus = Arc::new(EventBus::default());
        let manager = SubscriptionManager::new(Arc::new(StallsOnce {
            calls: AtomicUsize::new(0),
            bus: Arc::clone(&bus),
        }));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let stalled = tokio::time::timeout(
            Duration::from_millis(50),
            manager.subscribe(ChannelName::default(), ReplayPosition::Latest, tx.clone()),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(manager.state(), SubscriptionState::Idle);

        let handle = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await
            .unwrap();
        bus.publish(&ChannelName::default(), serde_json::json!({"jobId": "J1"}));
        assert_eq!(rx.recv().await.unwrap().payload["jobId"], "J1");

        manager.unsubscribe(&handle).await;
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_delivery() {
        let bus = Arc::new(EventBus::new(2, 0));
        let manager = SubscriptionManager::new(Arc::new(InProcessTransport::new(Arc::clone(&bus))));
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        manager.on_transport_error(|_| panic!("listener failure"));
        manager.on_transport_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await
            .unwrap();

        // Overflow the broadcast buffer so the delivery task sees a lag.
        for n in 0..5 {
            bus.publish(&ChannelName::default(), serde_json::json!({"n": n}));
        }
        bus.publish(&ChannelName::default(), serde_json::json!({"n": "last"}));

        let last = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let message = rx.recv().await.unwrap();
                if message.payload["n"] == "last" {
                    return message;
                }
            }
        })
        .await;

        assert!(last.is_ok());
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), SubscriptionState::Subscribed);

        manager.unsubscribe(&handle).await;
    }

    #[tokio::test]
    #[should_panic(expected = "already active")]
    async fn strict_usage_panics_on_second_subscribe() {
        let bus = Arc::new(EventBus::default());
        let manager = SubscriptionManager::new(Arc::new(InProcessTransport::new(bus)))
            .with_strict_usage(true);
        let (tx, _rx) = mpsc::unbounded_channel();

        manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx.clone())
            .await
            .unwrap();
        let _ = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await;
    }

    #[tokio::test]
    async fn unsubscribe_past_shutdown_timeout_still_stops_delivery() {
        let bus = Arc::new(EventBus::default());
        let manager = SubscriptionManager::new(Arc::new(InProcessTransport::new(Arc::clone(&bus))))
            .with_shutdown_timeout(Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = manager
            .subscribe(ChannelName::default(), ReplayPosition::Latest, tx)
            .await
            .unwrap();
        manager.unsubscribe(&handle).await;
        assert_eq!(manager.state(), SubscriptionState::Idle);

        // The task is gone either way: its sender is dropped.
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert_matches!(closed, Ok(None));
        assert_eq!(bus.receiver_count(), 0);
    }
}
