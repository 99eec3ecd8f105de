//! Generic watch-queue-worker reconciliation dispatcher
//!
//! Shared infrastructure for every controller in the system: a watch stream
//! feeds typed events into a deduplicating work queue, and a pool of
//! workers re-fetches the current object from a local synced cache and
//! invokes the handler. The dispatcher fixes the concurrency contract the
//! orchestrator runs under:
//!
//! - handler invocations for the **same key are never concurrent**
//! - invocations for **different keys run in parallel**
//! - a handler may return immediately after spawning detached background
//!   work; the dispatcher neither tracks nor cancels such work
//!
//! On handler error the key is requeued with exponential backoff up to a
//! bounded retry count, then dropped with a logged error; the operator must
//! re-trigger by updating the object. Success clears the backoff state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::retry::RetryConfig;
use crate::Error;

/// Bounded number of requeues for a failing key before it is dropped
pub const MAX_RETRIES: u32 = 5;

/// Kind of change a watch notification reported
///
/// After the initial sync the watch folds creations into `Modified`; the
/// distinction only matters for logging, handlers re-fetch current state
/// regardless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Object seen during the initial sync
    Added,
    /// Object created or updated after the initial sync
    Modified,
    /// Object deleted
    Deleted,
}

/// Stable identity of a watched object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace, absent for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a namespaced key
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A typed event handed to the handler: what happened, to which key
#[derive(Clone, Debug)]
pub struct Event {
    /// Kind of change
    pub kind: EventKind,
    /// Identity of the changed object
    pub key: ObjectKey,
}

/// Reconciliation handler invoked by dispatcher workers
///
/// `object` is the current object re-fetched from the synced cache, never
/// the event payload; it is `None` when the object no longer exists.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventHandler<K: 'static + Send + Sync>: Send + Sync {
    /// Process one event; an error requeues the key with backoff
    async fn handle(&self, event: Event, object: Option<Arc<K>>) -> Result<(), Error>;
}

/// Deduplicating work queue with per-key serialization
///
/// A key already waiting in the queue is not queued twice, and a key being
/// processed is not handed to a second worker until the first finishes.
struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Event>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue an event unless its key is already waiting
    fn push(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        if state.queued.contains(&event.key) {
            debug!(key = %event.key, "event coalesced with queued entry");
            return;
        }
        state.queued.insert(event.key.clone());
        state.pending.push_back(event);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Pop the first event whose key is not being processed, marking it
    /// active
    fn try_pop(&self) -> Option<Event> {
        let mut state = self.state.lock().unwrap();
        let position = state
            .pending
            .iter()
            .position(|event| !state.active.contains(&event.key))?;
        let event = state.pending.remove(position)?;
        state.queued.remove(&event.key);
        state.active.insert(event.key.clone());
        Some(event)
    }

    /// Wait until an eligible event is available
    async fn pop(&self) -> Event {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }

    /// Mark a key's processing finished, releasing queued events for it
    fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(key);
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Watch-queue-worker dispatcher for one resource type
pub struct Dispatcher<K>
where
    K: Resource + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    api: Api<K>,
    handler: Arc<dyn EventHandler<K>>,
    workers: usize,
    retry: RetryConfig,
}

impl<K> Dispatcher<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Create a dispatcher over the given API with the given handler
    pub fn new(api: Api<K>, handler: Arc<dyn EventHandler<K>>, workers: usize) -> Self {
        Self {
            api,
            handler,
            workers: workers.max(1),
            retry: RetryConfig {
                max_attempts: MAX_RETRIES,
                initial_delay: std::time::Duration::from_secs(1),
                max_delay: std::time::Duration::from_secs(300),
                backoff_multiplier: 2.0,
            },
        }
    }

    /// Run the watch loop and workers until the shutdown signal fires
    ///
    /// Shutting down stops the watch and the workers; procedures already
    /// launched by the handler are detached tasks and run to completion on
    /// their own.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let queue = Arc::new(WorkQueue::new());
        let retries: Arc<Mutex<HashMap<ObjectKey, u32>>> = Arc::new(Mutex::new(HashMap::new()));

        let (reader, writer) = reflector::store::<K>();
        let stream = reflector::reflector(writer, watcher(self.api, watcher::Config::default()));

        let mut tasks = Vec::new();
        for worker_id in 0..self.workers {
            let queue = queue.clone();
            let retries = retries.clone();
            let handler = self.handler.clone();
            let reader = reader.clone();
            let retry = self.retry.clone();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                debug!(worker = worker_id, "dispatcher worker started");
                loop {
                    let event = tokio::select! {
                        event = queue.pop() => event,
                        _ = shutdown.changed() => break,
                    };
                    process_event(&*handler, &reader, &queue, &retries, &retry, event).await;
                }
                debug!(worker = worker_id, "dispatcher worker stopped");
            }));
        }

        let feeder_queue = queue.clone();
        let mut shutdown_feed = shutdown.clone();
        let feeder = tokio::spawn(async move {
            futures::pin_mut!(stream);
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = shutdown_feed.changed() => break,
                };
                match item {
                    Some(Ok(event)) => {
                        for event in map_watch_event(event) {
                            debug!(key = %event.key, kind = ?event.kind, "event queued");
                            feeder_queue.push(event);
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "watch stream error, will resume"),
                    None => break,
                }
            }
        });

        let _ = feeder.await;
        info!("dispatcher watch stopped, waiting for workers");
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Translate one watcher event into dispatcher events
fn map_watch_event<K>(event: watcher::Event<K>) -> Vec<Event>
where
    K: Resource,
{
    match event {
        watcher::Event::InitApply(obj) => vec![Event {
            kind: EventKind::Added,
            key: key_of(&obj),
        }],
        watcher::Event::Apply(obj) => vec![Event {
            kind: EventKind::Modified,
            key: key_of(&obj),
        }],
        watcher::Event::Delete(obj) => vec![Event {
            kind: EventKind::Deleted,
            key: key_of(&obj),
        }],
        watcher::Event::Init | watcher::Event::InitDone => Vec::new(),
    }
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey {
        namespace: obj.meta().namespace.clone(),
        name: obj.name_any(),
    }
}

/// Run the handler for one popped event and apply the retry policy
async fn process_event<K>(
    handler: &dyn EventHandler<K>,
    store: &Store<K>,
    queue: &Arc<WorkQueue>,
    retries: &Arc<Mutex<HashMap<ObjectKey, u32>>>,
    retry: &RetryConfig,
    event: Event,
) where
    K: Resource + Clone + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let key = event.key.clone();
    let object = lookup(store, &key);

    let result = handler.handle(event.clone(), object).await;
    match result {
        Ok(()) => {
            retries.lock().unwrap().remove(&key);
        }
        Err(e) => {
            let attempt = {
                let mut retries = retries.lock().unwrap();
                let attempt = retries.entry(key.clone()).or_insert(0);
                *attempt += 1;
                *attempt
            };
            if attempt > retry.max_attempts {
                error!(
                    key = %key,
                    attempts = attempt,
                    error = %e,
                    "handler failed too many times, dropping key"
                );
                retries.lock().unwrap().remove(&key);
            } else {
                let delay = retry.delay_for(attempt);
                warn!(
                    key = %key,
                    attempt = attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "handler failed, requeueing with backoff"
                );
                let queue = queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.push(event);
                });
            }
        }
    }
    queue.done(&key);
}

fn lookup<K>(store: &Store<K>, key: &ObjectKey) -> Option<Arc<K>>
where
    K: Resource + Clone + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let mut obj_ref = ObjectRef::<K>::new(&key.name);
    if let Some(ns) = &key.namespace {
        obj_ref = obj_ref.within(ns);
    }
    store.get(&obj_ref)
}
