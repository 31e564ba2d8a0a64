//! # Common Adapter Infrastructure
//!
//! Shared contracts and plumbing for every broker adapter: the
//! [`BasicClient`] / [`StreamingClient`] traits the orchestrator programs
//! against, the cancellable [`Subscription`] stream, connection state
//! notification, and the guard that owns an adapter's background tasks.

use async_trait::async_trait;
use futures::Stream;
use mq_config::ProviderKind;
use mq_types::{
    AcknowledgeableMessage, BrokerError, BrokerResult, ConnectionConfig, ConnectionState,
    ConsumerConfig, ConsumerInfo, PublishAck, StreamConfig, StreamInfo, UnifiedMessage,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

// ============================================================================
// CORE TRAITS
// ============================================================================

/// Publish/subscribe contract every provider implements
#[async_trait]
pub trait BasicClient: Send + Sync + fmt::Debug {
    fn provider(&self) -> ProviderKind;

    /// Open the connection; a second call while connecting is rejected
    async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<()>;

    /// Close the connection and release every subscription
    async fn disconnect(&self) -> BrokerResult<()>;

    async fn publish(&self, message: UnifiedMessage, subject: &str) -> BrokerResult<()>;

    /// Start a lazy, cancellable stream of messages matching `pattern`
    async fn subscribe(&self, pattern: &str) -> BrokerResult<Subscription<UnifiedMessage>>;

    /// Cancel every subscription opened for `pattern`
    async fn unsubscribe(&self, pattern: &str) -> BrokerResult<()>;

    async fn request(
        &self,
        _message: UnifiedMessage,
        _subject: &str,
        _timeout: Duration,
    ) -> BrokerResult<Option<UnifiedMessage>> {
        Err(BrokerError::not_supported(format!(
            "request/reply on {}",
            self.provider()
        )))
    }

    /// Best-effort preview of the most recent messages on `subject`
    async fn fetch_last(&self, _subject: &str, _count: usize) -> BrokerResult<Vec<UnifiedMessage>> {
        Err(BrokerError::not_supported(format!(
            "fetch-last on {}",
            self.provider()
        )))
    }

    fn state(&self) -> ConnectionState;

    /// Every state transition from now on
    fn state_changes(&self) -> broadcast::Receiver<ConnectionState>;
}

/// Persistent-stream extension of [`BasicClient`]
#[async_trait]
pub trait StreamingClient: BasicClient {
    /// View the same adapter instance through its basic contract
    fn as_basic(self: Arc<Self>) -> Arc<dyn BasicClient>;

    /// False when the broker offered no stream context at connect time
    fn is_streaming_available(&self) -> bool;

    async fn list_streams(&self) -> BrokerResult<Vec<StreamInfo>>;
    async fn create_stream(&self, config: StreamConfig) -> BrokerResult<StreamInfo>;
    async fn delete_stream(&self, name: &str) -> BrokerResult<()>;
    async fn stream_info(&self, name: &str) -> BrokerResult<Option<StreamInfo>>;

    async fn list_consumers(&self, stream: &str) -> BrokerResult<Vec<ConsumerInfo>>;
    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> BrokerResult<ConsumerInfo>;
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> BrokerResult<()>;
    async fn consumer_info(&self, stream: &str, consumer: &str)
        -> BrokerResult<Option<ConsumerInfo>>;

    async fn publish_persistent(
        &self,
        message: UnifiedMessage,
        subject: &str,
    ) -> BrokerResult<PublishAck>;

    /// Continuous pull consumption; replaces any running consume of the same consumer
    async fn consume(
        &self,
        stream: &str,
        consumer: &str,
    ) -> BrokerResult<Subscription<AcknowledgeableMessage>>;

    /// One bounded pull; an expiry without messages yields an empty list
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        expires: Duration,
    ) -> BrokerResult<Vec<AcknowledgeableMessage>>;
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Broker-side cleanup for a subscription
///
/// `cancel` must not block: implementations detach local routing right away
/// and spawn any network round-trips.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

/// Sender half handed to the transport receive loop
pub type SubscriptionSender<T> = mpsc::UnboundedSender<BrokerResult<T>>;

/// Lazy, cancellable stream of subscription items
///
/// An `Err` item is terminal for this subscription only. Dropping the
/// subscription cancels it.
pub struct Subscription<T> {
    pattern: String,
    receiver: mpsc::UnboundedReceiver<BrokerResult<T>>,
    cancel: Option<Arc<dyn CancelHandle>>,
}

impl<T> Subscription<T> {
    pub fn new(
        pattern: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<BrokerResult<T>>,
        cancel: Arc<dyn CancelHandle>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            receiver,
            cancel: Some(cancel),
        }
    }

    /// Channel pair for a new subscription
    pub fn channel() -> (SubscriptionSender<T>, mpsc::UnboundedReceiver<BrokerResult<T>>) {
        mpsc::unbounded_channel()
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next item; `None` once the subscription ended or was cancelled
    pub async fn recv(&mut self) -> Option<BrokerResult<T>> {
        self.receiver.recv().await
    }

    /// Idempotent; never waits on the network
    pub fn cancel(&mut self) {
        if let Some(handle) = self.cancel.take() {
            debug!(pattern = %self.pattern, "Cancelling subscription");
            handle.cancel();
        }
        self.receiver.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = BrokerResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Run `work` on the current runtime if there is one
///
/// Cancellation can happen from `Drop`, possibly after the runtime is gone.
pub fn spawn_detached<F>(work: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(work);
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Current connection state plus a broadcast of every transition
#[derive(Debug)]
pub struct StateNotifier {
    current: RwLock<ConnectionState>,
    tx: broadcast::Sender<ConnectionState>,
}

impl Default for StateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StateNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            current: RwLock::new(ConnectionState::Disconnected),
            tx,
        }
    }

    pub fn get(&self) -> ConnectionState {
        self.current.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Record and broadcast a transition; repeated states are not re-sent
    pub fn set(&self, state: ConnectionState) {
        let mut current = self.current.write();
        if *current == state {
            return;
        }
        *current = state.clone();
        drop(current);
        let _ = self.tx.send(state);
    }

    /// Atomically move to `Connecting`, rejecting a concurrent attempt
    pub fn begin_connect(&self) -> BrokerResult<()> {
        let mut current = self.current.write();
        match &*current {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                Err(BrokerError::connection_failed(
                    "a connection attempt is already in progress",
                ))
            }
            ConnectionState::Connected => Err(BrokerError::connection_failed("already connected")),
            _ => {
                *current = ConnectionState::Connecting;
                drop(current);
                let _ = self.tx.send(ConnectionState::Connecting);
                Ok(())
            }
        }
    }

    /// Finish a connect attempt with its outcome
    pub fn finish_connect(&self, result: &BrokerResult<()>) {
        match result {
            Ok(()) => self.set(ConnectionState::Connected),
            Err(e) => self.set(ConnectionState::Error(e.to_string())),
        }
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Owns spawned tasks and aborts them when dropped
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCancel(AtomicUsize);

    impl CancelHandle for CountingCancel {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_subscription_cancel_is_idempotent() {
        let counter = Arc::new(CountingCancel::default());
        let (tx, rx) = Subscription::<u32>::channel();
        let mut sub = Subscription::new("orders.>", rx, counter.clone());

        tx.send(Ok(1)).unwrap();
        assert_eq!(sub.next().await, Some(Ok(1)));

        sub.cancel();
        sub.cancel();
        drop(sub);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(tx.send(Ok(2)).is_err());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let counter = Arc::new(CountingCancel::default());
        let (_tx, rx) = Subscription::<u32>::channel();
        drop(Subscription::new("a", rx, counter.clone()));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_ends_when_sender_dropped() {
        let (tx, rx) = Subscription::<u32>::channel();
        let mut sub = Subscription::new("a", rx, Arc::new(CountingCancel::default()));
        tx.send(Err(BrokerError::subscription_failed("channel closed"))).unwrap();
        drop(tx);
        assert!(matches!(sub.recv().await, Some(Err(BrokerError::SubscriptionFailed(_)))));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_state_notifier_transitions() {
        let notifier = StateNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.begin_connect().unwrap();
        assert!(notifier.begin_connect().is_err());
        notifier.finish_connect(&Ok(()));
        notifier.set(ConnectionState::Connected);

        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connecting);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_task_set_aborts_on_drop() {
        let tasks = TaskSet::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn(async move {
            let _keep = tx;
            std::future::pending::<()>().await;
        });
        assert_eq!(tasks.len(), 1);
        drop(tasks);
        assert!(rx.await.is_err());
    }
}
