//! Per-bot channel-scoped fair-queue router.
//!
//! A bounded per-key queue with exactly one serial worker task, so that
//! enqueue order is preserved for one [`ConversationKey`] while
//! unrelated keys run fully concurrently. The map of live queues is a
//! guarded single-writer map: insert on first use, evict the
//! longest-idle entry under saturation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use warden_domain::config::RouterConfig;
use warden_domain::error::{Error, Result};
use warden_domain::ConversationKey;

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One pending unit of work for a [`ConversationKey`].
/// `payload` is kept alongside the boxed invocation closure purely for
/// parity with the data model — the closure already owns it by the
/// time the item is constructed.
pub struct QueueItem<P> {
    pub conversation_key: ConversationKey,
    pub payload: Option<P>,
    pub enqueue_time: Instant,
    invoke: Box<dyn FnOnce() -> HandlerFuture + Send>,
}

/// Per-key queue state, shared between the router's map and the
/// spawned serial worker task.
struct QueueHandle<P> {
    sender: mpsc::Sender<QueueItem<P>>,
    pending: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    last_activity: Arc<Mutex<(Instant, DateTime<Utc>)>>,
    idle_notify: Arc<Notify>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P> QueueHandle<P> {
    fn is_evictable(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && !self.in_flight.load(Ordering::Acquire)
    }

    fn is_idle(&self) -> bool {
        self.is_evictable()
    }
}

/// Snapshot row for one conversation key, consumed by the read-only
/// monitoring endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub conversation_key: String,
    pub pending: usize,
    pub in_flight: bool,
    pub last_activity: DateTime<Utc>,
}

/// Per-bot router snapshot: per-key rows plus the total pending count.
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub bot_id: String,
    pub total_pending: usize,
    pub queues: Vec<QueueSnapshot>,
}

/// The per-bot fair-queue router.
///
/// `P` is the payload type carried by one message — an already-validated
/// inbound message tuple, by the time it reaches the router.
pub struct ChannelRouter<P: Send + 'static> {
    bot_id: String,
    config: RouterConfig,
    queues: Mutex<HashMap<ConversationKey, Arc<QueueHandle<P>>>>,
}

impl<P: Send + 'static> ChannelRouter<P> {
    pub fn new(bot_id: impl Into<String>, config: RouterConfig) -> Self {
        Self {
            bot_id: bot_id.into(),
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live conversation-key queues.
    pub fn channel_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Enqueue `payload` for `key`, to be passed to `handler` by the
    /// key's single serial worker once every earlier item for `key` has
    /// completed. Creates the queue (and its worker task) lazily on
    /// first use.
    ///
    /// Returns `RouterSaturated` if the router is at `max_channels` and
    /// no existing queue is idle enough to evict, or `ChannelBacklogged`
    /// if `key`'s queue is full and stays full past the bounded wait.
    pub async fn enqueue<F, Fut>(&self, key: ConversationKey, payload: P, handler: F) -> Result<()>
    where
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.get_or_create_queue(&key)?;

        let key_for_item = key.clone();
        let mut payload_slot = Some(payload);
        let invoke: Box<dyn FnOnce() -> HandlerFuture + Send> = {
            // Safe to unwrap: `payload_slot` is populated above and the
            // closure below runs at most once (it's an FnOnce target).
            let p = payload_slot.take().expect("payload present exactly once");
            Box::new(move || Box::pin(handler(p)) as HandlerFuture)
        };
        let item = QueueItem {
            conversation_key: key_for_item,
            payload: None,
            enqueue_time: Instant::now(),
            invoke,
        };

        match handle.sender.try_send(item) {
            Ok(()) => {
                handle.pending.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                warden_domain::trace::TraceEvent::ChannelBacklogged {
                    bot_id: &self.bot_id,
                    conversation_key: &key.as_key_string(),
                    pending: handle.pending.load(Ordering::Acquire),
                }
                .emit();
                let wait = Duration::from_millis(self.config.backlog_wait_ms);
                match tokio::time::timeout(wait, handle.sender.send(item)).await {
                    Ok(Ok(())) => {
                        handle.pending.fetch_add(1, Ordering::AcqRel);
                        Ok(())
                    }
                    _ => Err(Error::ChannelBacklogged(key.as_key_string())),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::ChannelBacklogged(format!(
                    "{}: queue worker no longer running",
                    key.as_key_string()
                )))
            }
        }
    }

    fn get_or_create_queue(&self, key: &ConversationKey) -> Result<Arc<QueueHandle<P>>> {
        let mut queues = self.queues.lock();
        if let Some(handle) = queues.get(key) {
            return Ok(handle.clone());
        }

        if queues.len() >= self.config.max_channels {
            let evictable = queues
                .iter()
                .filter(|(_, h)| h.is_evictable())
                .min_by_key(|(_, h)| h.last_activity.lock().0)
                .map(|(k, _)| k.clone());

            match evictable {
                Some(victim_key) => {
                    if let Some(victim) = queues.remove(&victim_key) {
                        victim.cancel.cancel();
                        warden_domain::trace::TraceEvent::ChannelQueueEvicted {
                            bot_id: &self.bot_id,
                            conversation_key: &victim_key.as_key_string(),
                        }
                        .emit();
                    }
                }
                None => {
                    warden_domain::trace::TraceEvent::RouterSaturated {
                        bot_id: &self.bot_id,
                        conversation_key: &key.as_key_string(),
                    }
                    .emit();
                    return Err(Error::RouterSaturated(format!(
                        "{}: at max_channels={} with no idle queue to evict",
                        self.bot_id, self.config.max_channels
                    )));
                }
            }
        }

        let handle = Arc::new(self.spawn_queue(key.clone()));
        queues.insert(key.clone(), handle.clone());
        warden_domain::trace::TraceEvent::ChannelQueueCreated {
            bot_id: &self.bot_id,
            conversation_key: &key.as_key_string(),
        }
        .emit();
        Ok(handle)
    }

    fn spawn_queue(&self, key: ConversationKey) -> QueueHandle<P> {
        let (tx, rx) = mpsc::channel::<QueueItem<P>>(self.config.queue_capacity);
        let pending = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));
        let now = Instant::now();
        let last_activity = Arc::new(Mutex::new((now, Utc::now())));
        let idle_notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            rx,
            pending.clone(),
            in_flight.clone(),
            last_activity.clone(),
            idle_notify.clone(),
            cancel.clone(),
        ));

        let _ = &key; // key already captured in the router's map key
        QueueHandle {
            sender: tx,
            pending,
            in_flight,
            last_activity,
            idle_notify,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Completes once `key`'s queue is empty and its worker is not
    /// mid-handler. Used during stop and in tests.
    pub async fn wait_channel_idle(&self, key: &ConversationKey) {
        let handle = {
            let queues = self.queues.lock();
            match queues.get(key) {
                Some(h) => h.clone(),
                None => return,
            }
        };
        loop {
            if handle.is_idle() {
                return;
            }
            let notified = handle.idle_notify.notified();
            if handle.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Completes once every live queue is idle.
    pub async fn wait_all_idle(&self) {
        let keys: Vec<ConversationKey> = self.queues.lock().keys().cloned().collect();
        for key in keys {
            self.wait_channel_idle(&key).await;
        }
    }

    /// Signal all workers to drain remaining items, waiting up to
    /// `drain_timeout` before cancelling stragglers outright.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let handles: Vec<Arc<QueueHandle<P>>> = {
            let mut queues = self.queues.lock();
            queues.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            // Dropping the sender side (by dropping every Arc clone we
            // hold) lets the worker drain what's already queued and
            // then exit on its own; `handle` here is the last clone.
            let deadline = tokio::time::Instant::now() + drain_timeout;
            let join = handle.worker.lock().take();
            drop(handle);
            if let Some(join) = join {
                if tokio::time::timeout_at(deadline, join).await.is_err() {
                    tracing::warn!("router shutdown: worker did not drain in time, task left running to completion");
                }
            }
        }
    }

    /// Read-only accessor for the monitoring endpoint.
    pub fn snapshot(&self) -> RouterSnapshot {
        let queues = self.queues.lock();
        let mut rows: Vec<QueueSnapshot> = queues
            .iter()
            .map(|(key, handle)| QueueSnapshot {
                conversation_key: key.as_key_string(),
                pending: handle.pending.load(Ordering::Acquire),
                in_flight: handle.in_flight.load(Ordering::Acquire),
                last_activity: handle.last_activity.lock().1,
            })
            .collect();
        rows.sort_by(|a, b| a.conversation_key.cmp(&b.conversation_key));
        let total_pending = rows.iter().map(|r| r.pending).sum();
        RouterSnapshot {
            bot_id: self.bot_id.clone(),
            total_pending,
            queues: rows,
        }
    }
}

async fn run_worker<P>(
    mut rx: mpsc::Receiver<QueueItem<P>>,
    pending: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    last_activity: Arc<Mutex<(Instant, DateTime<Utc>)>>,
    idle_notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some(item) = item else { break };

        *last_activity.lock() = (Instant::now(), Utc::now());
        in_flight.store(true, Ordering::Release);
        (item.invoke)().await;
        in_flight.store(false, Ordering::Release);
        pending.fetch_sub(1, Ordering::AcqRel);
        idle_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::Mutex as AsyncMutex;

    fn test_config() -> RouterConfig {
        RouterConfig {
            max_channels: 2,
            queue_capacity: 4,
            backlog_wait_ms: 200,
        }
    }

    #[tokio::test]
    async fn ordering_within_one_key_is_preserved() {
        let router = Arc::new(ChannelRouter::<u32>::new("bot_1", test_config()));
        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let key = ConversationKey::channel("c1");

        for i in 0..5 {
            let order = order.clone();
            router
                .enqueue(key.clone(), i, move |payload| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order.lock().await.push(payload);
                })
                .await
                .unwrap();
        }

        router.wait_channel_idle(&key).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let router = Arc::new(ChannelRouter::<u32>::new("bot_1", test_config()));
        let c1 = ConversationKey::channel("c1");
        let c2 = ConversationKey::channel("c2");

        let start = Instant::now();
        router
            .enqueue(c1.clone(), 1, |_| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
            })
            .await
            .unwrap();
        router
            .enqueue(c2.clone(), 2, |_| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
            })
            .await
            .unwrap();

        router.wait_all_idle().await;
        assert!(
            start.elapsed() < Duration::from_millis(290),
            "expected concurrent handling, took {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn saturation_evicts_idle_queue_before_failing() {
        let router = ChannelRouter::<u32>::new("bot_1", test_config());
        let c1 = ConversationKey::channel("c1");
        let c2 = ConversationKey::channel("c2");
        let c3 = ConversationKey::channel("c3");

        router.enqueue(c1.clone(), 1, |_| async {}).await.unwrap();
        router.wait_channel_idle(&c1).await;
        router.enqueue(c2.clone(), 2, |_| async {}).await.unwrap();
        router.wait_channel_idle(&c2).await;

        // Both c1 and c2 are idle now; c3 should evict the LRU one (c1)
        // rather than fail, since max_channels = 2.
        router.enqueue(c3.clone(), 3, |_| async {}).await.unwrap();
        assert_eq!(router.channel_count(), 2);
    }

    #[tokio::test]
    async fn saturation_fails_when_nothing_is_evictable() {
        let router = ChannelRouter::<u32>::new("bot_1", test_config());
        let c1 = ConversationKey::channel("c1");
        let c2 = ConversationKey::channel("c2");
        let c3 = ConversationKey::channel("c3");

        let gate = Arc::new(tokio::sync::Notify::new());
        let g1 = gate.clone();
        router
            .enqueue(c1.clone(), 1, move |_| async move {
                g1.notified().await;
            })
            .await
            .unwrap();
        let g2 = gate.clone();
        router
            .enqueue(c2.clone(), 2, move |_| async move {
                g2.notified().await;
            })
            .await
            .unwrap();

        // Give the workers a moment to pick the items up (in_flight=true).
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = router.enqueue(c3.clone(), 3, |_| async {}).await.unwrap_err();
        assert!(matches!(err, Error::RouterSaturated(_)));

        gate.notify_waiters();
    }

    #[tokio::test]
    async fn full_queue_backlogs_then_fails() {
        let mut config = test_config();
        config.queue_capacity = 1;
        config.backlog_wait_ms = 30;
        let router = ChannelRouter::<u32>::new("bot_1", config);
        let key = ConversationKey::channel("c1");

        let gate = Arc::new(tokio::sync::Notify::new());
        let g = gate.clone();
        router
            .enqueue(key.clone(), 1, move |_| async move {
                g.notified().await;
            })
            .await
            .unwrap();
        // Second item fills the bounded channel (capacity 1).
        router.enqueue(key.clone(), 2, |_| async {}).await.unwrap();

        // Third has nowhere to go and the first handler never finishes
        // within the short backlog wait.
        let err = router.enqueue(key.clone(), 3, |_| async {}).await.unwrap_err();
        assert!(matches!(err, Error::ChannelBacklogged(_)));

        gate.notify_waiters();
    }

    #[tokio::test]
    async fn chunking_order_survives_interleaved_keys() {
        let router = Arc::new(ChannelRouter::<u32>::new("bot_1", test_config()));
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let key = ConversationKey::dm("u1");

        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            let counter = counter.clone();
            router
                .enqueue(key.clone(), 0u32, move |_| async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    seen.lock().await.push(n);
                })
                .await
                .unwrap();
        }
        router.wait_channel_idle(&key).await;
        assert_eq!(*seen.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn snapshot_reports_pending_and_bot_total() {
        let router = ChannelRouter::<u32>::new("bot_1", test_config());
        let key = ConversationKey::channel("c1");
        let gate = Arc::new(tokio::sync::Notify::new());
        let g = gate.clone();
        router
            .enqueue(key.clone(), 1, move |_| async move {
                g.notified().await;
            })
            .await
            .unwrap();
        router.enqueue(key.clone(), 2, |_| async {}).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snap = router.snapshot();
        assert_eq!(snap.bot_id, "bot_1");
        assert_eq!(snap.total_pending, 2);
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn shutdown_drains_pending_items() {
        let router = ChannelRouter::<u32>::new("bot_1", test_config());
        let key = ConversationKey::channel("c1");
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        router
            .enqueue(key.clone(), 1, move |_| async move {
                done2.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        router.shutdown(Duration::from_millis(500)).await;
        assert!(done.load(Ordering::SeqCst));
    }
}
