use super::*;

use crate::cluster::ClusterState;
use crate::journal::Marker;
use crate::thread::{QueueSignal, ThreadHandle};
use crossbeam::queue::ArrayQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, derive_more::Display)]
pub enum EventBody {
    #[display("state {state}")]
    Tick { state: ClusterState },
    #[display("{from} -> {to}: {reason}")]
    Transition {
        from: ClusterState,
        to: ClusterState,
        reason: String,
    },
    #[display("primary -> {new}")]
    PrimaryChanged { old: Option<Endpoint>, new: Endpoint },
    #[display("{endpoint} orphaned: {error}")]
    ReplicaOrphaned { endpoint: Endpoint, error: String },
    #[display("{endpoint} needs manual intervention: {reason}")]
    NeedsManualIntervention { endpoint: Endpoint, reason: String },
    #[display("crash record {name}")]
    CrashRecorded { name: String, marker: Option<Marker> },
    #[display("{code} opened: {message}")]
    StateOpened { code: String, message: String },
    #[display("{code} resolved")]
    StateResolved { code: String },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tick { .. } => "tick",
            Self::Transition { .. } => "transition",
            Self::PrimaryChanged { .. } => "primary_changed",
            Self::ReplicaOrphaned { .. } => "replica_orphaned",
            Self::NeedsManualIntervention { .. } => "needs_manual_intervention",
            Self::CrashRecorded { .. } => "crash_recorded",
            Self::StateOpened { .. } => "state_opened",
            Self::StateResolved { .. } => "state_resolved",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Event {
    pub cluster: String,
    /// Unix millis.
    pub timestamp: u64,
    pub body: EventBody,
}

impl Event {
    pub fn new(cluster: impl Into<String>, body: EventBody) -> Self {
        Self {
            cluster: cluster.into(),
            timestamp: unix_millis(),
            body,
        }
    }
}

#[async_trait::async_trait]
pub trait Observer: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn on_event(&self, e: &Event);
}

/// Bounded queue of one subscriber. When full the oldest event is dropped.
struct Queue {
    buf: ArrayQueue<Event>,
    dropped: AtomicU64,
    signal: QueueSignal,
}

impl Queue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buf: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            signal: QueueSignal::default(),
        })
    }

    fn push(&self, e: Event) -> bool {
        let overflow = self.buf.force_push(e).is_some();
        if overflow {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.signal.raise();
        overflow
    }
}

mod delivery {
    use super::*;

    pub struct Thread {
        pub observer: Arc<dyn Observer>,
        pub queue: Arc<Queue>,
    }

    impl Thread {
        async fn run_once(&self) {
            while let Some(e) = self.queue.buf.pop() {
                self.observer.on_event(&e).await;
            }
        }

        pub fn do_loop(self) -> ThreadHandle {
            let fut = async move {
                loop {
                    self.queue.signal.wait(Duration::from_millis(100)).await;
                    self.run_once().await;
                }
            };
            let hdl = tokio::spawn(fut).abort_handle();
            ThreadHandle(hdl)
        }
    }
}

/// Live feed of bus events. Unsubscribed when dropped.
pub struct Watch {
    queue: Arc<Queue>,
}

impl Watch {
    /// Wait up to `timeout` and return the queued events.
    pub async fn next_batch(&self, timeout: Duration) -> Vec<Event> {
        if self.queue.buf.is_empty() {
            self.queue.signal.wait(timeout).await;
        }
        let mut out = vec![];
        while let Some(e) = self.queue.buf.pop() {
            out.push(e);
        }
        out
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// Fan-out of cluster events.
///
/// `publish` never waits on a subscriber.
pub struct Bus {
    capacity: usize,
    queues: spin::RwLock<Vec<Weak<Queue>>>,
    threads: spin::Mutex<Vec<ThreadHandle>>,
    dropped: AtomicU64,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: spin::RwLock::new(vec![]),
            threads: spin::Mutex::new(vec![]),
            dropped: AtomicU64::new(0),
        }
    }

    /// Deliver every later event to `observer` on its own task.
    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        let queue = Queue::new(self.capacity);
        debug!("observer {} subscribed", observer.name());
        self.queues.write().push(Arc::downgrade(&queue));
        let hdl = delivery::Thread { observer, queue }.do_loop();
        self.threads.lock().push(hdl);
    }

    pub fn watch(&self) -> Watch {
        let queue = Queue::new(self.capacity);
        self.queues.write().push(Arc::downgrade(&queue));
        Watch { queue }
    }

    pub fn publish(&self, e: Event) {
        let mut gone = false;
        for q in self.queues.read().iter() {
            match q.upgrade() {
                Some(q) => {
                    if q.push(e.clone()) {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => gone = true,
            }
        }
        if gone {
            self.queues.write().retain(|q| q.strong_count() > 0);
        }
    }

    /// Events dropped across every subscriber.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Writes one structured line per event.
pub struct LogObserver;

#[async_trait::async_trait]
impl Observer for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_event(&self, e: &Event) {
        match &e.body {
            EventBody::Tick { .. } => {}
            EventBody::Transition { from, to, reason } => {
                info!(cluster = %e.cluster, %from, %to, %reason, "transition");
            }
            EventBody::ReplicaOrphaned { .. } | EventBody::NeedsManualIntervention { .. } => {
                warn!(cluster = %e.cluster, kind = e.body.kind(), "{}", e.body);
            }
            body => {
                info!(cluster = %e.cluster, kind = body.kind(), "{body}");
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub ticks: u64,
    pub transitions: u64,
    pub failovers: u64,
    pub switchovers: u64,
    pub orphans: u64,
}

/// Per-cluster counters.
#[derive(Default)]
pub struct MetricsObserver {
    counters: spin::Mutex<HashMap<String, Counters>>,
}

impl MetricsObserver {
    pub fn snapshot(&self, cluster: &str) -> Counters {
        self.counters
            .lock()
            .get(cluster)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Observer for MetricsObserver {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn on_event(&self, e: &Event) {
        let mut m = self.counters.lock();
        let c = m.entry(e.cluster.clone()).or_default();
        match &e.body {
            EventBody::Tick { .. } => c.ticks += 1,
            EventBody::Transition { to, .. } => {
                c.transitions += 1;
                match to {
                    ClusterState::Failover => c.failovers += 1,
                    ClusterState::Switchover => c.switchovers += 1,
                    _ => {}
                }
            }
            EventBody::ReplicaOrphaned { .. } => c.orphans += 1,
            _ => {}
        }
    }
}

/// Committed primary change, as sent to proxies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteChange {
    pub cluster: String,
    pub old: Option<Endpoint>,
    pub new: Endpoint,
    pub timestamp: u64,
}

/// Consumer of primary changes. Acknowledgement is never awaited.
pub trait RouteObserver: Send + Sync + 'static {
    fn route(&self, change: &RouteChange);
}

/// Keeps every route change in memory.
#[derive(Default)]
pub struct RecordingRouter {
    changes: spin::Mutex<Vec<RouteChange>>,
}

impl RecordingRouter {
    pub fn changes(&self) -> Vec<RouteChange> {
        self.changes.lock().clone()
    }
}

impl RouteObserver for RecordingRouter {
    fn route(&self, change: &RouteChange) {
        self.changes.lock().push(change.clone());
    }
}

/// Forwards `PrimaryChanged` to a `RouteObserver`.
pub struct Routes(pub Arc<dyn RouteObserver>);

#[async_trait::async_trait]
impl Observer for Routes {
    fn name(&self) -> &str {
        "routes"
    }

    async fn on_event(&self, e: &Event) {
        if let EventBody::PrimaryChanged { old, new } = &e.body {
            self.0.route(&RouteChange {
                cluster: e.cluster.clone(),
                old: old.clone(),
                new: new.clone(),
                timestamp: e.timestamp,
            });
        }
    }
}
