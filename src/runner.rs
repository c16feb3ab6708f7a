//! Watch loop and work queue driving the reconciler
//!
//! Kyma change notifications are turned into keys by [`EventRouter`],
//! filtered by the admission rules and handed to a [`WorkQueue`]. The queue
//! runs at most one reconcile per key at a time; a key that changes while it
//! is being reconciled is reconciled once more afterwards. Distinct keys run
//! concurrently up to a fixed limit.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ObjectKey;
use crate::controller::{admit, error_policy, reconcile, Context, KymaEvent, KymaSnapshot};
use crate::crd::Kyma;
use crate::Error;

fn admit_deletion(key: ObjectKey, snapshot: &KymaSnapshot) -> Option<ObjectKey> {
    admit(&KymaEvent::Deleted(snapshot)).then_some(key)
}

/// Tracks the last snapshot of every watched Kyma and classifies events
#[derive(Default)]
pub struct EventRouter {
    snapshots: HashMap<ObjectKey, KymaSnapshot>,
    relisted: Option<HashSet<ObjectKey>>,
}

impl EventRouter {
    /// Create a router that has not seen any Kyma yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one watch event and return the keys that need a reconcile
    pub fn handle(&mut self, event: watcher::Event<Kyma>) -> Vec<ObjectKey> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(kyma) => {
                if let (Some(relisted), Some(key)) =
                    (self.relisted.as_mut(), ObjectKey::from_kyma(&kyma))
                {
                    relisted.insert(key);
                }
                self.applied(&kyma).into_iter().collect()
            }
            watcher::Event::InitDone => self.relist_done(),
            watcher::Event::Apply(kyma) => self.applied(&kyma).into_iter().collect(),
            watcher::Event::Delete(kyma) => {
                let Some(key) = ObjectKey::from_kyma(&kyma) else {
                    return Vec::new();
                };
                self.snapshots.remove(&key);
                let snapshot = KymaSnapshot::of(&kyma);
                admit_deletion(key, &snapshot).into_iter().collect()
            }
        }
    }

    fn applied(&mut self, kyma: &Kyma) -> Option<ObjectKey> {
        let Some(key) = ObjectKey::from_kyma(kyma) else {
            warn!("ignoring kyma without namespace");
            return None;
        };

        let new = KymaSnapshot::of(kyma);
        let admitted = match self.snapshots.get(&key) {
            Some(old) => admit(&KymaEvent::Updated { old, new: &new }),
            None => admit(&KymaEvent::Created(&new)),
        };
        self.snapshots.insert(key.clone(), new);

        if admitted {
            Some(key)
        } else {
            debug!(kyma = %key, "event not admitted");
            None
        }
    }

    /// Kymas missing from a completed relist were deleted while the watch was down
    fn relist_done(&mut self) -> Vec<ObjectKey> {
        let Some(relisted) = self.relisted.take() else {
            return Vec::new();
        };

        let gone: Vec<ObjectKey> = self
            .snapshots
            .keys()
            .filter(|key| !relisted.contains(*key))
            .cloned()
            .collect();

        gone.into_iter()
            .filter_map(|key| {
                let snapshot = self.snapshots.remove(&key)?;
                info!(kyma = %key, "kyma disappeared while the watch was down");
                admit_deletion(key, &snapshot)
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyState {
    /// Waiting in the channel
    Queued,
    /// Being reconciled
    Running,
    /// Being reconciled and enqueued again meanwhile
    RunningDirty,
}

/// Deduplicating queue of Kyma keys
///
/// Each key has at most one pending requeue deadline; the earliest one wins.
pub struct WorkQueue {
    states: DashMap<ObjectKey, KeyState>,
    deadlines: DashMap<ObjectKey, Instant>,
    tx: mpsc::UnboundedSender<ObjectKey>,
    cancel: CancellationToken,
}

impl WorkQueue {
    /// Create a queue and the receiver [`process`] consumes
    pub fn new(cancel: CancellationToken) -> (Arc<Self>, mpsc::UnboundedReceiver<ObjectKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            states: DashMap::new(),
            deadlines: DashMap::new(),
            tx,
            cancel,
        });
        (queue, rx)
    }

    /// Schedule a reconcile for `key`
    ///
    /// A key that is already queued is not queued twice. A key that is
    /// running is marked to run once more after the current run. A pending
    /// requeue of the key is dropped, the run it would trigger happens now.
    pub fn enqueue(&self, key: ObjectKey) {
        self.deadlines.remove(&key);
        match self.states.entry(key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(KeyState::Queued);
                if self.tx.send(key).is_err() {
                    debug!("work queue closed, dropping key");
                }
            }
            Entry::Occupied(mut entry) => {
                if *entry.get() == KeyState::Running {
                    entry.insert(KeyState::RunningDirty);
                }
            }
        }
    }

    /// Schedule a reconcile for `key` after `delay`
    ///
    /// If the key already has an earlier or equal deadline pending, this is a
    /// no-op. A later pending deadline is replaced.
    pub fn enqueue_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let deadline = Instant::now() + delay;
        match self.deadlines.entry(key.clone()) {
            Entry::Occupied(entry) if *entry.get() <= deadline => {
                debug!(kyma = %key, "earlier requeue already pending");
                return;
            }
            Entry::Occupied(mut entry) => {
                entry.insert(deadline);
            }
            Entry::Vacant(entry) => {
                entry.insert(deadline);
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    // A replaced or dropped deadline leaves nothing to do
                    let current = queue.deadlines.remove_if(&key, |_, d| *d == deadline);
                    if current.is_some() {
                        queue.enqueue(key);
                    }
                }
            }
        });
    }

    /// Number of keys queued or running
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True if nothing is queued or running
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn start(&self, key: &ObjectKey) {
        self.states.insert(key.clone(), KeyState::Running);
    }

    fn finish(&self, key: &ObjectKey) {
        if let Entry::Occupied(mut entry) = self.states.entry(key.clone()) {
            if *entry.get() == KeyState::RunningDirty {
                entry.insert(KeyState::Queued);
                if self.tx.send(key.clone()).is_err() {
                    debug!("work queue closed, dropping key");
                }
            } else {
                entry.remove();
            }
        }
    }
}

/// Marks a key finished even if its reconcile panics
struct FinishGuard {
    queue: Arc<WorkQueue>,
    key: ObjectKey,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.queue.finish(&self.key);
    }
}

/// Run `reconcile` for every key coming out of the queue until cancelled
///
/// `reconcile` returns the delay after which the key should run again, if
/// any. In-flight reconciles are awaited before this returns.
pub async fn process<F, Fut>(
    queue: Arc<WorkQueue>,
    mut rx: mpsc::UnboundedReceiver<ObjectKey>,
    max_concurrent: usize,
    reconcile: F,
) where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    let permits = u32::try_from(max_concurrent.max(1)).unwrap_or(u32::MAX);
    let semaphore = Arc::new(Semaphore::new(permits as usize));
    let reconcile = Arc::new(reconcile);
    let cancel = queue.cancel.clone();

    loop {
        let key = tokio::select! {
            _ = cancel.cancelled() => break,
            key = rx.recv() => match key {
                Some(key) => key,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        queue.start(&key);
        let guard = FinishGuard {
            queue: Arc::clone(&queue),
            key: key.clone(),
        };
        let reconcile = Arc::clone(&reconcile);
        let task_queue = Arc::clone(&queue);

        tokio::spawn(async move {
            let requeue = reconcile(key.clone()).await;
            drop(permit);
            drop(guard);

            if let Some(delay) = requeue {
                debug!(kyma = %key, delay_secs = delay.as_secs(), "requeueing");
                task_queue.enqueue_after(key, delay);
            }
        });
    }

    // Wait for in-flight reconciles
    let _ = semaphore.acquire_many(permits).await;
}

/// Watch Kyma resources and reconcile them until `cancel` fires
pub async fn run(
    kymas: Api<Kyma>,
    ctx: Arc<Context>,
    max_concurrent: usize,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let (queue, rx) = WorkQueue::new(cancel.clone());

    let reconcile_ctx = Arc::clone(&ctx);
    let worker = tokio::spawn(process(
        Arc::clone(&queue),
        rx,
        max_concurrent,
        move |key: ObjectKey| {
            let ctx = Arc::clone(&reconcile_ctx);
            async move {
                let action = match reconcile(key.clone(), Arc::clone(&ctx)).await {
                    Ok(action) => action,
                    Err(e) => error_policy(&key, &e, &ctx),
                };
                action.requeue_after()
            }
        },
    ));

    let stream = watcher(kymas, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    let mut router = EventRouter::new();
    info!(max_concurrent, "watching kyma resources");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested, stopping watch");
                break;
            }
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for key in router.handle(event) {
                        queue.enqueue(key);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "kyma watch failed, retrying"),
                None => {
                    warn!("kyma watch ended");
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    worker
        .await
        .map_err(|e| Error::config(format!("work queue task failed: {e}")))?;
    info!("all reconciles finished");
    Ok(())
}
