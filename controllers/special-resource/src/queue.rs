//! Work queue feeding the single reconcile worker.
//!
//! Watch tasks and the path watcher enqueue [`ReconcileRequest`]s; one worker
//! drains them one at a time. A request that is already waiting is not queued
//! twice. Failed reconciles come back after a per-key Fibonacci backoff that
//! resets once the key reconciles cleanly.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;

/// Shortest requeue delay after a failed reconcile
pub const MIN_BACKOFF_SECONDS: u64 = 5;

/// Identity of a resource; `namespace` is `None` for cluster-scoped kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub name: String,
    pub namespace: Option<String>,
}

impl ResourceKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        Self {
            name: resource.name_any(),
            namespace: resource.namespace(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One unit of work for the reconcile worker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReconcileRequest {
    SpecialResource(ResourceKey),
    Module(ResourceKey),
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileRequest::SpecialResource(key) => write!(f, "SpecialResource {}", key),
            ReconcileRequest::Module(key) => write!(f, "SpecialResourceModule {}", key),
        }
    }
}

/// Handles one dequeued request
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &ReconcileRequest) -> Result<(), ControllerError>;
}

/// Cloneable producer side of the queue
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<ReconcileRequest>,
    pending: Arc<Mutex<HashSet<ReconcileRequest>>>,
}

/// Consumer side of the queue, owned by the worker
#[derive(Debug)]
pub struct QueueReceiver {
    receiver: mpsc::UnboundedReceiver<ReconcileRequest>,
    pending: Arc<Mutex<HashSet<ReconcileRequest>>>,
}

impl WorkQueue {
    pub fn new() -> (Self, QueueReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        (
            Self {
                sender,
                pending: pending.clone(),
            },
            QueueReceiver { receiver, pending },
        )
    }

    /// Queue a request. Returns `false` when the same request is already
    /// waiting or the worker has stopped.
    pub fn enqueue(&self, request: ReconcileRequest) -> bool {
        {
            let mut pending = match self.pending.lock() {
                Ok(pending) => pending,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !pending.insert(request.clone()) {
                debug!("{} already queued", request);
                return false;
            }
        }
        if self.sender.send(request).is_err() {
            warn!("Reconcile worker stopped, dropping request");
            return false;
        }
        true
    }

    pub fn enqueue_all(&self, requests: impl IntoIterator<Item = ReconcileRequest>) {
        for request in requests {
            self.enqueue(request);
        }
    }

    /// Queue a request after `delay`
    pub fn enqueue_after(&self, request: ReconcileRequest, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(request);
        });
    }
}

impl QueueReceiver {
    /// Next request; it leaves the pending set so events arriving while it
    /// is being reconciled queue it again.
    pub async fn next(&mut self) -> Option<ReconcileRequest> {
        let request = self.receiver.recv().await?;
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.remove(&request);
        Some(request)
    }
}

/// Drains the queue one request at a time
pub struct Worker {
    queue: WorkQueue,
    receiver: QueueReceiver,
    handler: Arc<dyn RequestHandler>,
    max_backoff_seconds: u64,
    backoff_states: HashMap<ReconcileRequest, FibonacciBackoff>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("max_backoff_seconds", &self.max_backoff_seconds)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        queue: WorkQueue,
        receiver: QueueReceiver,
        handler: Arc<dyn RequestHandler>,
        max_backoff_seconds: u64,
    ) -> Self {
        Self {
            queue,
            receiver,
            handler,
            max_backoff_seconds,
            backoff_states: HashMap::new(),
        }
    }

    /// Reconcile one request and schedule its retry on failure.
    /// Returns the requeue delay when one was scheduled.
    pub async fn process(&mut self, request: ReconcileRequest) -> Option<Duration> {
        match self.handler.handle(&request).await {
            Ok(()) => {
                self.backoff_states.remove(&request);
                None
            }
            Err(e) => {
                let max = self.max_backoff_seconds;
                let delay = self
                    .backoff_states
                    .entry(request.clone())
                    .or_insert_with(|| FibonacciBackoff::new(MIN_BACKOFF_SECONDS, max))
                    .next_backoff();
                error!(
                    "Reconciliation failed for {}: {} (retrying in {}s)",
                    request,
                    e,
                    delay.as_secs()
                );
                self.queue.enqueue_after(request, delay);
                Some(delay)
            }
        }
    }

    /// Run until every producer is gone
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Reconcile worker started");
        while let Some(request) = self.receiver.next().await {
            debug!("Processing {}", request);
            self.process(request).await;
        }
        Err(ControllerError::Watch("work queue closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyHandler {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for FlakyHandler {
        async fn handle(&self, _request: &ReconcileRequest) -> Result<(), ControllerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ControllerError::NoKernelVersion);
            }
            Ok(())
        }
    }

    fn sr(name: &str) -> ReconcileRequest {
        ReconcileRequest::SpecialResource(ResourceKey::cluster(name))
    }

    #[tokio::test]
    async fn test_pending_requests_are_deduplicated() {
        let (queue, mut receiver) = WorkQueue::new();

        assert!(queue.enqueue(sr("simple-kmod")));
        assert!(!queue.enqueue(sr("simple-kmod")));
        assert!(queue.enqueue(ReconcileRequest::Module(ResourceKey::cluster("simple-kmod"))));

        assert_eq!(receiver.next().await, Some(sr("simple-kmod")));
        // Dequeued requests may be queued again
        assert!(queue.enqueue(sr("simple-kmod")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requests_back_off_until_success() {
        let (queue, receiver) = WorkQueue::new();
        let handler = Arc::new(FlakyHandler {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        });
        let mut worker = Worker::new(queue, receiver, handler.clone(), 300);

        assert_eq!(worker.process(sr("gpu")).await, Some(Duration::from_secs(5)));
        assert_eq!(worker.process(sr("gpu")).await, Some(Duration::from_secs(5)));
        assert_eq!(worker.backoff_states.len(), 1);
        assert_eq!(worker.process(sr("gpu")).await, None);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(worker.backoff_states.is_empty());

        // Requeued after the delay
        let request = tokio::time::timeout(Duration::from_secs(10), worker.receiver.next()).await;
        assert_eq!(request.unwrap(), Some(sr("gpu")));
    }

    #[test]
    fn test_resource_key_display() {
        assert_eq!(ResourceKey::cluster("simple-kmod").to_string(), "simple-kmod");
        let key = ResourceKey {
            name: "driver".to_string(),
            namespace: Some("drivers".to_string()),
        };
        assert_eq!(key.to_string(), "drivers/driver");
        assert_eq!(ReconcileRequest::Module(key).to_string(), "SpecialResourceModule drivers/driver");
    }
}
