//! Dependency-driven executor for Trellis node graphs.
//!
//! The executor seeds a FIFO ready queue with the designated roots, spawns
//! worker tasks that invoke node callables, installs forwarded outputs into
//! children, and marks a child ready when its last outstanding parent
//! completes. A supervisor task grows the worker pool while the queue is
//! deeper than the pool, and a shared event channel streams chunks and
//! completions to the caller as they happen.
//!
//! The first error recorded by any worker sets an executor-wide stop signal:
//! in-flight callables finish, nothing further is dequeued, and the run
//! drains. Errors are collected per node and stay readable on the executor
//! after the run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::time;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use trellis_core::{Chunk, Node, NodeId, RunError};

/// Default ceiling for the dynamically sized worker pool.
pub const DEFAULT_WORKER_CAP: usize = 16;
/// Default cadence at which the supervisor samples queue depth.
pub const DEFAULT_SUPERVISOR_INTERVAL: Duration = Duration::from_millis(150);
/// Default poll bound for end-of-stream detection in [`Executor::yielding`].
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(200);

/// How long an idle worker sleeps before re-checking the queue when a
/// wake-up notification raced past it.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Errors raised when launching or querying an executor.
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    /// `leaves` requires at least one root.
    #[error("executor `{id}` has no roots")]
    EmptyRoots { id: String },
    /// Executors are single-use; a second launch is rejected.
    #[error("executor `{id}` already ran")]
    AlreadyRan { id: String },
}

/// Event emitted on the streaming channel.
#[derive(Debug, Clone)]
pub enum Event {
    /// One streamed value from a node.
    Chunk(Chunk),
    /// A node finished without error; its output is readable.
    Completed(Node),
}

/// Aggregate result of a blocking run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Nodes that completed without error, in completion order.
    pub completed: Vec<Node>,
    /// Every chunk emitted by streaming nodes, per-node order preserved.
    pub chunks: Vec<Chunk>,
}

/// Schedules a node graph across a dynamically sized worker pool.
pub struct Executor {
    id: String,
    description: Option<String>,
    roots: Vec<Node>,
    worker_cap: usize,
    supervisor_interval: Duration,
    started: AtomicBool,
    stop: CancellationToken,
    errors: Arc<Mutex<Vec<(NodeId, RunError)>>>,
}

impl Executor {
    /// Construct an executor over the given roots with default settings.
    pub fn new(id: impl Into<String>, roots: Vec<Node>) -> Self {
        Self::builder(id).roots(roots).build()
    }

    /// Start building an executor.
    pub fn builder(id: impl Into<String>) -> ExecutorBuilder {
        ExecutorBuilder {
            id: id.into(),
            description: None,
            roots: Vec::new(),
            worker_cap: DEFAULT_WORKER_CAP,
            supervisor_interval: DEFAULT_SUPERVISOR_INTERVAL,
        }
    }

    /// Executor identity label.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Optional human-readable description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The designated roots, in seed order.
    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    /// Per-node failures recorded so far, in observation order.
    pub fn errors(&self) -> Vec<(NodeId, RunError)> {
        self.errors.lock().expect("errors lock poisoned").clone()
    }

    /// Halt admission of further work. In-flight callables are not
    /// interrupted beyond their own timeouts.
    pub fn stop_tree(&self) {
        debug!(executor = %self.id, "stop requested");
        self.stop.cancel();
    }

    /// All nodes reachable from the roots that have no children.
    pub fn leaves(&self) -> Result<Vec<Node>, ExecutorError> {
        if self.roots.is_empty() {
            return Err(ExecutorError::EmptyRoots {
                id: self.id.clone(),
            });
        }
        let mut leaves = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<Node> = self.roots.clone();
        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            let children = node.children();
            if children.is_empty() {
                leaves.push(node);
            } else {
                stack.extend(children);
            }
        }
        Ok(leaves)
    }

    /// Launch the run and return a lazy interleaving of chunk and
    /// completion events.
    ///
    /// Events from one node arrive in production order; events from
    /// unrelated nodes interleave arbitrarily. `latency` bounds how long
    /// end-of-stream detection may lag once the pool has wound down. Must
    /// be called within a Tokio runtime.
    pub fn yielding(&self, latency: Duration) -> Result<EventStream, ExecutorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ExecutorError::AlreadyRan {
                id: self.id.clone(),
            });
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if self.roots.is_empty() {
            debug!(executor = %self.id, "no roots; run is empty");
        } else {
            self.launch(events_tx);
        }
        Ok(EventStream::new(events_rx, latency))
    }

    /// Run the graph to completion, discarding nothing: returns the
    /// completed nodes and every chunk. Failures are recorded in
    /// [`Executor::errors`].
    pub async fn run(&self) -> Result<RunSummary, ExecutorError> {
        let mut events = self.yielding(DEFAULT_LATENCY)?;
        let mut summary = RunSummary::default();
        while let Some(event) = events.next().await {
            match event {
                Event::Completed(node) => summary.completed.push(node),
                Event::Chunk(chunk) => summary.chunks.push(chunk),
            }
        }
        Ok(summary)
    }

    fn launch(&self, events: mpsc::UnboundedSender<Event>) {
        let reachable = prepare_reachable(&self.roots);
        debug!(
            executor = %self.id,
            nodes = reachable.len(),
            worker_cap = self.worker_cap,
            "launching graph run"
        );

        let scheduler = Arc::new(Scheduler {
            executor_id: Arc::from(self.id.as_str()),
            queue: Mutex::new(VecDeque::new()),
            scheduled: Mutex::new(HashSet::new()),
            wakeup: Notify::new(),
            pool_idle: Notify::new(),
            stop: self.stop.clone(),
            errors: Arc::clone(&self.errors),
            inflight: AtomicUsize::new(0),
            workers_alive: AtomicUsize::new(0),
            worker_cap: self.worker_cap,
            events,
        });

        for root in &self.roots {
            scheduler.enqueue(root.clone());
        }
        let initial = self.roots.len().clamp(1, self.worker_cap);
        for _ in 0..initial {
            spawn_worker(&scheduler);
        }
        tokio::spawn(supervisor_loop(
            Arc::clone(&scheduler),
            self.supervisor_interval,
        ));
    }
}

/// Builder for [`Executor`].
pub struct ExecutorBuilder {
    id: String,
    description: Option<String>,
    roots: Vec<Node>,
    worker_cap: usize,
    supervisor_interval: Duration,
}

impl ExecutorBuilder {
    /// Attach a human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append one root.
    pub fn root(mut self, node: Node) -> Self {
        self.roots.push(node);
        self
    }

    /// Append roots in seed order.
    pub fn roots(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.roots.extend(nodes);
        self
    }

    /// Override the worker-pool ceiling.
    pub fn worker_cap(mut self, cap: usize) -> Self {
        self.worker_cap = cap.max(1);
        self
    }

    /// Override the supervisor sampling cadence.
    pub fn supervisor_interval(mut self, interval: Duration) -> Self {
        self.supervisor_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Finalise the executor.
    pub fn build(self) -> Executor {
        Executor {
            id: self.id,
            description: self.description,
            roots: self.roots,
            worker_cap: self.worker_cap,
            supervisor_interval: self.supervisor_interval,
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Lazy stream of [`Event`]s produced by a launched run.
///
/// Terminates once every worker has exited and the channel drains. A poll
/// tick re-arms on `latency` so termination detection stays bounded even if
/// a producer wedges without closing the channel.
pub struct EventStream {
    inner: UnboundedReceiverStream<Event>,
    latency: Duration,
    tick: Pin<Box<time::Sleep>>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    fn new(receiver: mpsc::UnboundedReceiver<Event>, latency: Duration) -> Self {
        let latency = latency.max(Duration::from_millis(1));
        Self {
            inner: UnboundedReceiverStream::new(receiver),
            latency,
            tick: Box::pin(time::sleep(latency)),
        }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(item) => Poll::Ready(item),
            Poll::Pending => {
                if this.tick.as_mut().poll(cx).is_ready() {
                    let deadline = time::Instant::now() + this.latency;
                    this.tick.as_mut().reset(deadline);
                    // Arm the fresh tick so the waker stays registered.
                    let _ = this.tick.as_mut().poll(cx);
                }
                Poll::Pending
            }
        }
    }
}

struct Scheduler {
    executor_id: Arc<str>,
    queue: Mutex<VecDeque<Node>>,
    /// Nodes handed to the queue at least once; guards double scheduling.
    scheduled: Mutex<HashSet<Node>>,
    wakeup: Notify,
    pool_idle: Notify,
    stop: CancellationToken,
    errors: Arc<Mutex<Vec<(NodeId, RunError)>>>,
    inflight: AtomicUsize,
    workers_alive: AtomicUsize,
    worker_cap: usize,
    events: mpsc::UnboundedSender<Event>,
}

impl Scheduler {
    fn enqueue(&self, node: Node) {
        {
            let mut scheduled = self.scheduled.lock().expect("scheduled set poisoned");
            if !scheduled.insert(node.clone()) {
                return;
            }
        }
        let depth = {
            let mut queue = self.queue.lock().expect("ready queue poisoned");
            queue.push_back(node);
            queue.len()
        };
        self.publish_queue_depth(depth);
        self.wakeup.notify_waiters();
    }

    /// Pop the next ready node, marking it in flight under the queue lock so
    /// the drain predicate never observes a half-handed-over node.
    fn next_ready(&self) -> Option<Node> {
        let mut queue = self.queue.lock().expect("ready queue poisoned");
        let node = queue.pop_front()?;
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let depth = queue.len();
        drop(queue);
        self.publish_queue_depth(depth);
        Some(node)
    }

    fn queue_depth(&self) -> usize {
        self.queue.lock().expect("ready queue poisoned").len()
    }

    /// Nothing queued and nothing in flight: no worker can produce more work.
    fn drained(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) == 0 && self.queue_depth() == 0
    }

    fn record_error(&self, id: NodeId, error: RunError) {
        warn!(node = %id, %error, "node failed; stopping admission");
        metrics::counter!(
            "trellis.executor.node_errors_total",
            "executor" => self.executor_id.to_string(),
            "node" => id.to_string()
        )
        .increment(1);
        self.errors
            .lock()
            .expect("errors lock poisoned")
            .push((id, error));
        self.stop.cancel();
        self.wakeup.notify_waiters();
    }

    fn publish_queue_depth(&self, depth: usize) {
        metrics::gauge!(
            "trellis.executor.queue_depth",
            "executor" => self.executor_id.to_string()
        )
        .set(depth as f64);
    }

    fn publish_workers_alive(&self, alive: usize) {
        metrics::gauge!(
            "trellis.executor.workers_alive",
            "executor" => self.executor_id.to_string()
        )
        .set(alive as f64);
    }
}

fn spawn_worker(scheduler: &Arc<Scheduler>) {
    let alive = scheduler.workers_alive.fetch_add(1, Ordering::SeqCst) + 1;
    scheduler.publish_workers_alive(alive);
    let scheduler = Arc::clone(scheduler);
    tokio::spawn(worker_loop(scheduler));
}

async fn worker_loop(scheduler: Arc<Scheduler>) {
    loop {
        // Once the stop signal is observed nothing further is dequeued.
        if scheduler.stop.is_cancelled() {
            break;
        }
        let Some(node) = scheduler.next_ready() else {
            if scheduler.drained() {
                break;
            }
            tokio::select! {
                _ = scheduler.wakeup.notified() => {}
                _ = scheduler.stop.cancelled() => {}
                _ = time::sleep(IDLE_POLL) => {}
            }
            continue;
        };
        run_node(&scheduler, &node).await;
        scheduler.inflight.fetch_sub(1, Ordering::SeqCst);
        scheduler.wakeup.notify_waiters();
    }

    let remaining = scheduler.workers_alive.fetch_sub(1, Ordering::SeqCst) - 1;
    scheduler.publish_workers_alive(remaining);
    trace!(executor = %scheduler.executor_id, remaining, "worker exiting");
    if remaining == 0 {
        scheduler.pool_idle.notify_waiters();
    }
}

#[instrument(level = "trace", skip_all, fields(node = %node.id()))]
async fn run_node(scheduler: &Arc<Scheduler>, node: &Node) {
    trace!(level = node.metadata().level, "node dequeued");
    let started = Instant::now();

    let result = if node.is_streaming() {
        let events = scheduler.events.clone();
        let executor_label = scheduler.executor_id.to_string();
        let node_label = node.id().to_string();
        node.run_streaming(move |chunk| {
            metrics::counter!(
                "trellis.executor.chunks_total",
                "executor" => executor_label.clone(),
                "node" => node_label.clone()
            )
            .increment(1);
            let _ = events.send(Event::Chunk(chunk));
        })
        .await
    } else {
        node.run().await
    };

    metrics::histogram!(
        "trellis.executor.node_runtime_ms",
        "executor" => scheduler.executor_id.to_string(),
        "node" => node.id().to_string()
    )
    .record(started.elapsed().as_secs_f64() * 1_000.0);

    match result {
        Ok(()) => {
            // The node's after-run hook has fired; ripen the children.
            for child in node.children() {
                match node.complete_edge_to(&child).await {
                    Ok(0) => scheduler.enqueue(child),
                    Ok(_) => {}
                    Err(err) => scheduler.record_error(child.id().clone(), err),
                }
            }
            let _ = scheduler.events.send(Event::Completed(node.clone()));
        }
        Err(err) => scheduler.record_error(node.id().clone(), err),
    }
}

/// Grow the pool while the queue is deeper than the live worker count.
/// Idle workers are never pre-empted; they exit on their own once the queue
/// drains or the stop signal lands.
async fn supervisor_loop(scheduler: Arc<Scheduler>, interval: Duration) {
    debug!(
        executor = %scheduler.executor_id,
        interval_ms = interval.as_millis() as u64,
        "supervisor started"
    );
    loop {
        tokio::select! {
            _ = time::sleep(interval) => {}
            _ = scheduler.pool_idle.notified() => {}
        }
        let alive = scheduler.workers_alive.load(Ordering::SeqCst);
        if alive == 0 {
            break;
        }
        if scheduler.stop.is_cancelled() {
            continue;
        }
        let depth = scheduler.queue_depth();
        if depth > alive && alive < scheduler.worker_cap {
            let spawn = (depth - alive).min(scheduler.worker_cap - alive);
            debug!(
                executor = %scheduler.executor_id,
                queue_depth = depth,
                workers_alive = alive,
                spawning = spawn,
                "scaling worker pool"
            );
            for _ in 0..spawn {
                spawn_worker(&scheduler);
            }
        }
    }
    debug!(executor = %scheduler.executor_id, "supervisor exiting");
}

/// Walk the reachable subgraph, reset per-run bookkeeping, and compute each
/// node's outstanding-parent count and level (longest distance from any
/// root, relaxed in topological order).
fn prepare_reachable(roots: &[Node]) -> Vec<Node> {
    let mut reachable: Vec<Node> = Vec::new();
    let mut seen: HashSet<Node> = HashSet::new();
    let mut stack: Vec<Node> = roots.to_vec();
    while let Some(node) = stack.pop() {
        if !seen.insert(node.clone()) {
            continue;
        }
        stack.extend(node.children());
        reachable.push(node);
    }

    // Only parents reachable from the roots count towards readiness; roots
    // themselves are seeded regardless of incoming edges.
    let root_set: HashSet<Node> = roots.iter().cloned().collect();
    let mut pending: HashMap<Node, usize> = HashMap::new();
    for node in &reachable {
        let count = if root_set.contains(node) {
            0
        } else {
            node.parents()
                .iter()
                .filter(|parent| seen.contains(*parent))
                .count()
        };
        pending.insert(node.clone(), count);
    }

    let mut level: HashMap<Node, usize> =
        reachable.iter().map(|node| (node.clone(), 0)).collect();
    let mut indegree: HashMap<Node, usize> = pending.clone();
    let mut queue: VecDeque<Node> = reachable
        .iter()
        .filter(|node| indegree[*node] == 0)
        .cloned()
        .collect();
    while let Some(node) = queue.pop_front() {
        let base = level[&node];
        for child in node.children() {
            if !seen.contains(&child) {
                continue;
            }
            let entry = level.get_mut(&child).expect("reachable child has a level");
            *entry = (*entry).max(base + 1);
            let degree = indegree.get_mut(&child).expect("reachable child has a degree");
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                queue.push_back(child);
            }
        }
    }

    for node in &reachable {
        node.prepare_run(pending[node], level[node]);
    }
    reachable
}
