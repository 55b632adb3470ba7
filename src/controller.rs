//! Keyed work queue and the worker loop that drains it.
//!
//! A key is never handed to two workers at once: re-adding a key that is in
//! flight defers it until the worker calls [`WorkQueue::done`].

use crate::reconciler::{self, Action, Context};
use crate::source_controller;
use crate::migration::{ObjectKey, SourceClusterRef};
use crate::{Result, log_debug, log_error, log_warn};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

struct QueueState<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    in_flight: HashSet<K>,
    deferred: HashSet<K>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                deferred: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if state.in_flight.contains(&key) {
            state.deferred.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark `key` as finished, releasing a deferred re-add.
    pub fn done(&self, key: &K) {
        let deferred = {
            let mut state = self.state();
            state.in_flight.remove(key);
            state.deferred.remove(key)
        };
        if deferred {
            self.add(key.clone());
        }
    }

    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One kind of object the controller knows how to reconcile.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    async fn reconcile(&self, key: &Self::Key) -> Result<Action>;

    /// Base delay before retrying a key whose reconcile failed.
    fn error_requeue(&self) -> Duration;
}

pub struct MigrationReconciler {
    ctx: Arc<Context>,
}

impl MigrationReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for MigrationReconciler {
    type Key = ObjectKey;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        reconciler::reconcile(&self.ctx, key).await
    }

    fn error_requeue(&self) -> Duration {
        self.ctx.config.requeue.short()
    }
}

pub struct SourceReconciler {
    ctx: Arc<Context>,
}

impl SourceReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for SourceReconciler {
    type Key = SourceClusterRef;

    async fn reconcile(&self, key: &SourceClusterRef) -> Result<Action> {
        source_controller::reconcile_source(&self.ctx, key).await
    }

    fn error_requeue(&self) -> Duration {
        source_controller::NOT_READY_REQUEUE
    }
}

/// Spread retries of failing keys over up to a tenth of the base delay.
fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64 / 10).max(1);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<R::Key>>,
    concurrency: usize,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: R, concurrency: usize) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue: WorkQueue::new(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<R::Key>> {
        Arc::clone(&self.queue)
    }

    /// Drain the queue until it is shut down, then wait for running reconciles.
    pub async fn run(&self) {
        let permits = Arc::new(Semaphore::new(self.concurrency));

        while let Some(key) = self.queue.next().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let reconciler = Arc::clone(&self.reconciler);
            let queue = Arc::clone(&self.queue);

            tokio::spawn(async move {
                let _permit = permit;
                let task_key = key.clone();
                let task_reconciler = Arc::clone(&reconciler);
                // A panicking reconcile only costs this key a retry.
                let outcome =
                    tokio::spawn(async move { task_reconciler.reconcile(&task_key).await }).await;

                match outcome {
                    Ok(Ok(Action::Requeue(after))) => {
                        log_debug!("Requeue {} in {:?}", key, after);
                        queue.add_after(key.clone(), after);
                    }
                    Ok(Ok(Action::AwaitChange)) => {}
                    Ok(Err(err)) => {
                        log_warn!("Reconcile of {} failed: {}", key, err);
                        queue.add_after(key.clone(), jittered(reconciler.error_requeue()));
                    }
                    Err(join_err) => {
                        log_error!("Reconcile of {} aborted: {}", key, join_err);
                        queue.add_after(key.clone(), jittered(reconciler.error_requeue()));
                    }
                }
                queue.done(&key);
            });
        }

        let _ = permits.acquire_many(self.concurrency as u32).await;
    }
}
