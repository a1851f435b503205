//! Keyed work queue driving every syncer
//!
//! Guarantees per key: at most one reconcile in flight, a trigger that
//! arrives while the key is in flight re-runs it once afterwards, and
//! pending duplicates collapse into one entry. Failures back off
//! exponentially per key with no attempt limit; the count lives in memory
//! only and resets on success. An ownership collision is the one failure
//! left alone until the key is triggered again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, warn};

use vkube_common::metrics::{record_panic, record_queue_depth, ReconcileTimer};
use vkube_common::retry::RetryConfig;
use vkube_common::Result;

use crate::object::ObjectKey;

/// What the queue should do with a key after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Wait for the next trigger
    AwaitChange,
    /// Reconcile again after the delay
    RequeueAfter(Duration),
}

/// Stream of keys to reconcile
pub type KeyStream = BoxStream<'static, ObjectKey>;

/// Reconcile function bound to one syncer
pub type ReconcileFn =
    Arc<dyn Fn(ObjectKey) -> BoxFuture<'static, Result<ReconcileAction>> + Send + Sync>;

/// Queue tuning
#[derive(Clone, Debug)]
pub struct QueueOptions {
    /// Upper bound on concurrent reconciles
    pub max_concurrent: usize,
    /// Per-key backoff for retryable failures
    pub backoff: RetryConfig,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
        }
    }
}

impl QueueOptions {
    /// Defaults with the given concurrency (at least one)
    pub fn with_concurrency(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            ..Self::default()
        }
    }
}

enum Outcome {
    Done(Result<ReconcileAction>),
    Panicked(String),
}

/// One syncer's queue
pub struct WorkQueue {
    name: String,
    options: QueueOptions,
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    delayed: DelayQueue<ObjectKey>,
    delayed_keys: HashMap<ObjectKey, delay_queue::Key>,
    failures: HashMap<ObjectKey, u32>,
}

impl WorkQueue {
    /// Empty queue for the named syncer
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            options,
            pending: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            delayed: DelayQueue::new(),
            delayed_keys: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    /// Process keys from `triggers` until `cancel` fires.
    ///
    /// Reconcile errors and panics never end the loop; on cancellation
    /// in-flight reconciles are aborted.
    pub async fn run(
        mut self,
        triggers: Vec<KeyStream>,
        reconcile: ReconcileFn,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut triggers = stream::select_all(triggers);
        let mut triggers_open = true;
        let mut tasks: JoinSet<(ObjectKey, Outcome)> = JoinSet::new();

        loop {
            while self.in_flight.len() < self.options.max_concurrent {
                let Some(key) = self.pending.pop_front() else {
                    break;
                };
                self.queued.remove(&key);
                record_queue_depth(&self.name, -1);
                self.in_flight.insert(key.clone());
                tasks.spawn(run_one(self.name.clone(), key, reconcile.clone()));
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                next = triggers.next(), if triggers_open => match next {
                    Some(key) => self.enqueue(key),
                    None => {
                        debug!(syncer = %self.name, "all trigger streams ended");
                        triggers_open = false;
                    }
                },
                Some(expired) = self.delayed.next(), if !self.delayed.is_empty() => {
                    let key = expired.into_inner();
                    self.delayed_keys.remove(&key);
                    self.enqueue(key);
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok((key, outcome)) => self.complete(key, outcome),
                    Err(e) => error!(syncer = %self.name, error = %e, "reconcile task aborted"),
                },
            }
        }

        tasks.shutdown().await;
        record_queue_depth(&self.name, -(self.pending.len() as i64));
        debug!(syncer = %self.name, "work queue stopped");
        Ok(())
    }

    fn enqueue(&mut self, key: ObjectKey) {
        if let Some(delay_key) = self.delayed_keys.remove(&key) {
            self.delayed.remove(&delay_key);
        }
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return;
        }
        if self.queued.insert(key.clone()) {
            record_queue_depth(&self.name, 1);
            self.pending.push_back(key);
        }
    }

    fn enqueue_after(&mut self, key: ObjectKey, delay: Duration) {
        if self.queued.contains(&key) {
            return;
        }
        match self.delayed_keys.get(&key) {
            Some(delay_key) => self.delayed.reset(delay_key, delay),
            None => {
                let delay_key = self.delayed.insert(key.clone(), delay);
                self.delayed_keys.insert(key, delay_key);
            }
        }
    }

    fn complete(&mut self, key: ObjectKey, outcome: Outcome) {
        self.in_flight.remove(&key);

        let retry_after = match outcome {
            Outcome::Done(Ok(ReconcileAction::AwaitChange)) => {
                self.failures.remove(&key);
                None
            }
            Outcome::Done(Ok(ReconcileAction::RequeueAfter(delay))) => {
                self.failures.remove(&key);
                Some(delay)
            }
            Outcome::Done(Err(e)) if e.is_retryable() => {
                let delay = self.next_backoff(&key);
                warn!(
                    syncer = %self.name,
                    object = %key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed, requeueing"
                );
                Some(delay)
            }
            Outcome::Done(Err(e)) => {
                self.failures.remove(&key);
                error!(
                    syncer = %self.name,
                    object = %key,
                    error = %e,
                    error_kind = e.kind(),
                    "reconcile failed on an ownership conflict, waiting for the next change"
                );
                None
            }
            Outcome::Panicked(message) => {
                let delay = self.next_backoff(&key);
                error!(
                    syncer = %self.name,
                    object = %key,
                    panic = %message,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile panicked, requeueing"
                );
                Some(delay)
            }
        };

        if self.dirty.remove(&key) {
            self.enqueue(key);
        } else if let Some(delay) = retry_after {
            self.enqueue_after(key, delay);
        }
    }

    fn next_backoff(&mut self, key: &ObjectKey) -> Duration {
        let attempts = self.failures.entry(key.clone()).or_insert(0);
        *attempts += 1;
        self.options.backoff.delay_for_attempt(*attempts)
    }
}

async fn run_one(name: String, key: ObjectKey, reconcile: ReconcileFn) -> (ObjectKey, Outcome) {
    let timer = ReconcileTimer::start(name.clone());
    let result = AssertUnwindSafe(reconcile(key.clone())).catch_unwind().await;
    let outcome = match result {
        Ok(Ok(action)) => {
            timer.success();
            Outcome::Done(Ok(action))
        }
        Ok(Err(e)) => {
            timer.error(e.kind());
            Outcome::Done(Err(e))
        }
        Err(payload) => {
            timer.error("panic");
            record_panic(&name);
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Outcome::Panicked(message)
        }
    };
    (key, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use vkube_common::Error;

    fn receiver_stream(mut rx: mpsc::UnboundedReceiver<ObjectKey>) -> KeyStream {
        stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("default", name)
    }

    fn spawn_queue(
        options: QueueOptions,
        reconcile: ReconcileFn,
    ) -> (
        mpsc::UnboundedSender<ObjectKey>,
        CancellationToken,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let queue = WorkQueue::new("test", options);
        let handle = tokio::spawn(queue.run(vec![receiver_stream(rx)], reconcile, cancel.clone()));
        (tx, cancel, handle)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn story_pending_duplicates_collapse_into_one_reconcile() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());

        let recorded = calls.clone();
        let wait = gate.clone();
        let reconcile: ReconcileFn = Arc::new(move |k: ObjectKey| {
            let recorded = recorded.clone();
            let wait = wait.clone();
            async move {
                if k.name == "blocker" {
                    wait.notified().await;
                }
                recorded.lock().push(k.name.clone());
                Ok(ReconcileAction::AwaitChange)
            }
            .boxed()
        });

        let (tx, cancel, handle) = spawn_queue(QueueOptions::with_concurrency(1), reconcile);
        tx.send(key("blocker")).unwrap();
        settle().await;
        for _ in 0..5 {
            tx.send(key("a")).unwrap();
        }
        settle().await;
        gate.notify_one();
        settle().await;

        assert_eq!(*calls.lock(), vec!["blocker", "a"]);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn story_trigger_during_reconcile_reruns_the_key_once_afterwards() {
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let (r, m, c, g) = (running.clone(), max_seen.clone(), calls.clone(), gate.clone());
        let reconcile: ReconcileFn = Arc::new(move |_k: ObjectKey| {
            let (r, m, c, g) = (r.clone(), m.clone(), c.clone(), g.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    g.notified().await;
                }
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(ReconcileAction::AwaitChange)
            }
            .boxed()
        });

        let (tx, cancel, handle) = spawn_queue(QueueOptions::default(), reconcile);
        tx.send(key("a")).unwrap();
        settle().await;
        tx.send(key("a")).unwrap();
        tx.send(key("a")).unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn story_conflicts_back_off_and_ownership_collisions_stop() {
        let calls = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
        let recorded = calls.clone();
        let reconcile: ReconcileFn = Arc::new(move |k: ObjectKey| {
            let recorded = recorded.clone();
            async move {
                *recorded.lock().entry(k.name.clone()).or_default() += 1;
                match k.name.as_str() {
                    "conflicting" => Err(Error::conflict("default/conflicting", "stale resourceVersion")),
                    _ => Err(Error::ownership("default/owned", "not managed by vkube")),
                }
            }
            .boxed()
        });

        let (tx, cancel, handle) = spawn_queue(QueueOptions::default(), reconcile);
        tx.send(key("conflicting")).unwrap();
        tx.send(key("owned")).unwrap();
        settle().await;

        // backoff is 1s, 2s, 4s with up to 1.5x slack: 3 retries well within 20s
        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }

        let calls = calls.lock().clone();
        assert!(calls["conflicting"] >= 4, "conflict retried: {calls:?}");
        assert_eq!(calls["owned"], 1);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn story_forbidden_and_invalid_errors_keep_retrying() {
        let calls = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
        let recorded = calls.clone();
        let reconcile: ReconcileFn = Arc::new(move |k: ObjectKey| {
            let recorded = recorded.clone();
            async move {
                *recorded.lock().entry(k.name.clone()).or_default() += 1;
                match k.name.as_str() {
                    "forbidden" => Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "rbac not propagated".to_string(),
                        reason: "Forbidden".to_string(),
                        code: 403,
                    }))),
                    _ => Err(Error::validation_for("services", "port out of range")),
                }
            }
            .boxed()
        });

        let (tx, cancel, handle) = spawn_queue(QueueOptions::default(), reconcile);
        tx.send(key("forbidden")).unwrap();
        tx.send(key("invalid")).unwrap();
        settle().await;

        for _ in 0..120 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }

        let calls = calls.lock().clone();
        assert!(calls["forbidden"] >= 4, "403 retried: {calls:?}");
        assert!(calls["invalid"] >= 4, "validation retried: {calls:?}");
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn story_panicking_reconcile_is_recovered_and_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let reconcile: ReconcileFn = Arc::new(move |_k: ObjectKey| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                Ok(ReconcileAction::AwaitChange)
            }
            .boxed()
        });

        let (tx, cancel, handle) = spawn_queue(QueueOptions::default(), reconcile);
        tx.send(key("a")).unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_schedules_another_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let reconcile: ReconcileFn = Arc::new(move |_k: ObjectKey| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(ReconcileAction::RequeueAfter(Duration::from_secs(60))) }.boxed()
        });

        let (tx, cancel, handle) = spawn_queue(QueueOptions::default(), reconcile);
        tx.send(key("node-1")).unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_an_idle_queue() {
        let reconcile: ReconcileFn =
            Arc::new(|_k: ObjectKey| async { Ok(ReconcileAction::AwaitChange) }.boxed());
        let cancel = CancellationToken::new();
        cancel.cancel();
        WorkQueue::new("idle", QueueOptions::default())
            .run(vec![stream::pending().boxed()], reconcile, cancel)
            .await
            .unwrap();
    }
}
