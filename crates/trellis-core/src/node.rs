//! Graph vertices: callables, bound arguments, edges, and safe mutation.
//!
//! A [`Node`] is a cheaply cloneable handle; identity is the handle itself,
//! while the caller-supplied id is a display label whose uniqueness is not
//! enforced. Each node carries two locks: a state mutex guarding edges and
//! bindings for short critical sections, and an execution mutex held for the
//! whole of a run. Mutations acquire the execution mutex without blocking,
//! so a running endpoint rejects the mutation instead of racing it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time;
use tracing::{debug, trace};

use crate::binding::{ArgMap, Binding};
use crate::callable::Callable;
use crate::chunk::Chunk;
use crate::error::{GraphError, RunError};
use crate::forward::{self, Forward, ForwardSlot};
use crate::hook::{ForwardHook, Hook};
use crate::schema::{self, ElementType};

/// Caller-supplied identity label for a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Construct a node id.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying label.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default per-execution wall-clock budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Execution metadata recorded while scheduling and running a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Wall-clock span of the last run, from before-run to after-run.
    pub runtime: Duration,
    /// Longest distance from any root, computed at launch.
    pub level: usize,
}

#[derive(Default)]
struct Hooks {
    on_connect: Option<Hook>,
    on_disconnect: Option<Hook>,
    before_run: Option<Hook>,
    after_run: Option<Hook>,
}

struct NodeState {
    bindings: BTreeMap<String, Binding>,
    parents: Vec<Node>,
    children: Vec<Node>,
    /// Forwarding rules registered by parents, keyed by parent identity.
    forwards: Vec<ForwardSlot>,
    /// Values installed by completed parents, overlaid onto bindings.
    forwarded: ArgMap,
    output: Option<Value>,
    metadata: NodeMetadata,
    /// Parents still outstanding in the current run.
    pending_parents: usize,
    is_running: bool,
}

struct NodeInner {
    id: NodeId,
    callable: Callable,
    timeout: Duration,
    element_type: Option<ElementType>,
    hooks: Hooks,
    state: Mutex<NodeState>,
    /// Held for the span of a run and for the span of any mutation.
    exec: tokio::sync::Mutex<()>,
}

/// Shared handle to a graph vertex.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start building a node around `callable`.
    pub fn builder(id: impl Into<String>, callable: Callable) -> NodeBuilder {
        NodeBuilder {
            id: NodeId::new(id),
            callable,
            bindings: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            element_type: None,
            hooks: Hooks::default(),
        }
    }

    /// The caller-supplied identity label.
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Stable identity key for this vertex; survives clones of the handle.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Whether two handles refer to the same vertex.
    pub fn same_node(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The last committed output, readable once the after-run hook has fired.
    pub fn output(&self) -> Option<Value> {
        self.state().output.clone()
    }

    /// Execution metadata recorded by the scheduler.
    pub fn metadata(&self) -> NodeMetadata {
        self.state().metadata.clone()
    }

    /// Snapshot of the parent set.
    pub fn parents(&self) -> Vec<Node> {
        self.state().parents.clone()
    }

    /// Snapshot of the child set.
    pub fn children(&self) -> Vec<Node> {
        self.state().children.clone()
    }

    /// Whether a run currently holds the execution lock.
    pub fn is_running(&self) -> bool {
        self.state().is_running
    }

    /// Whether the wrapped callable streams its output.
    pub fn is_streaming(&self) -> bool {
        self.inner.callable.is_streaming()
    }

    /// Per-execution wall-clock budget.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.inner.state.lock().expect("node state poisoned")
    }

    /// Add an edge from this node to `child`, registering the forwarding
    /// declaration on the child.
    ///
    /// Both endpoints' execution locks are acquired in identity order and
    /// without blocking; a running endpoint rejects the mutation. Validation
    /// failures leave the edge sets untouched.
    pub async fn connect(
        &self,
        child: &Node,
        forward: Forward,
        transform: Option<ForwardHook>,
    ) -> Result<(), GraphError> {
        if self.same_node(child) {
            return Err(GraphError::SelfLoop {
                id: self.id().clone(),
            });
        }
        let _guards = self.lock_pair(child)?;

        if child.reaches(self) {
            return Err(GraphError::Cycle {
                parent: self.id().clone(),
                child: child.id().clone(),
            });
        }

        let slot = {
            let child_state = child.state();
            // A reconnect replaces this parent's own rule, so it is ignored
            // when checking for collisions.
            let claimed: Vec<ForwardSlot> = child_state
                .forwards
                .iter()
                .filter(|slot| slot.parent != self.key())
                .cloned()
                .collect();
            let target = forward::resolve(
                child.id(),
                child.inner.callable.signature(),
                &child_state.bindings,
                &claimed,
                &forward,
            )?;
            target.map(|param| ForwardSlot {
                parent: self.key(),
                param,
                transform,
            })
        };

        {
            let mut state = self.state();
            if !state.children.iter().any(|node| node.same_node(child)) {
                state.children.push(child.clone());
            }
        }
        {
            let mut child_state = child.state();
            if !child_state.parents.iter().any(|node| node.same_node(self)) {
                child_state.parents.push(self.clone());
            }
            child_state.forwards.retain(|slot| slot.parent != self.key());
            if let Some(slot) = slot {
                child_state.forwards.push(slot);
            }
        }

        debug!(parent = %self.id(), child = %child.id(), "edge connected");

        self.fire_mutation_hook(self.inner.hooks.on_connect.as_ref())
            .await?;
        child
            .fire_mutation_hook(child.inner.hooks.on_connect.as_ref())
            .await
    }

    /// Remove the edge to `child` and its forwarding rule. A missing edge is
    /// a no-op.
    pub async fn disconnect(&self, child: &Node) -> Result<(), GraphError> {
        let _guards = self.lock_pair(child)?;
        if !self
            .state()
            .children
            .iter()
            .any(|node| node.same_node(child))
        {
            return Ok(());
        }
        self.unlink(child);
        debug!(parent = %self.id(), child = %child.id(), "edge disconnected");

        self.fire_mutation_hook(self.inner.hooks.on_disconnect.as_ref())
            .await?;
        child
            .fire_mutation_hook(child.inner.hooks.on_disconnect.as_ref())
            .await
    }

    /// Atomically replace this node's children with `new_children`.
    ///
    /// Equivalent to disconnecting every current child and connecting each
    /// new one (without forwarding), observed under a single acquisition of
    /// every involved execution lock so partial states are never exposed.
    pub async fn redirect(&self, new_children: &[Node]) -> Result<(), GraphError> {
        for child in new_children {
            if self.same_node(child) {
                return Err(GraphError::SelfLoop {
                    id: self.id().clone(),
                });
            }
        }

        // Hold this node's lock before snapshotting the child set, so a
        // racing connect or disconnect cannot slip between the snapshot and
        // the lock acquisitions below.
        let _self_guard =
            self.inner
                .exec
                .try_lock()
                .map_err(|_| GraphError::SafeExecution {
                    id: self.id().clone(),
                })?;

        let current = self.children();
        let mut involved: Vec<Node> = Vec::with_capacity(current.len() + new_children.len());
        involved.extend(current.iter().cloned());
        involved.extend(new_children.iter().cloned());
        involved.sort_by_key(Node::key);
        involved.dedup_by(|a, b| a.same_node(b));

        let mut guards = Vec::with_capacity(involved.len());
        for node in &involved {
            guards.push(node.inner.exec.try_lock().map_err(|_| {
                GraphError::SafeExecution {
                    id: node.id().clone(),
                }
            })?);
        }

        // Validate the whole batch before touching any edge.
        for child in new_children {
            if child.reaches(self) {
                return Err(GraphError::Cycle {
                    parent: self.id().clone(),
                    child: child.id().clone(),
                });
            }
        }

        let removed: Vec<Node> = current
            .iter()
            .filter(|node| !new_children.iter().any(|kept| kept.same_node(node)))
            .cloned()
            .collect();
        let added: Vec<Node> = new_children
            .iter()
            .filter(|node| !current.iter().any(|kept| kept.same_node(node)))
            .cloned()
            .collect();

        for child in &current {
            self.unlink(child);
        }
        for child in new_children {
            {
                let mut state = self.state();
                if !state.children.iter().any(|node| node.same_node(child)) {
                    state.children.push(child.clone());
                }
            }
            let mut child_state = child.state();
            if !child_state.parents.iter().any(|node| node.same_node(self)) {
                child_state.parents.push(self.clone());
            }
        }

        debug!(
            node = %self.id(),
            removed = removed.len(),
            added = added.len(),
            "children redirected"
        );

        for child in &removed {
            self.fire_mutation_hook(self.inner.hooks.on_disconnect.as_ref())
                .await?;
            child
                .fire_mutation_hook(child.inner.hooks.on_disconnect.as_ref())
                .await?;
        }
        for child in &added {
            self.fire_mutation_hook(self.inner.hooks.on_connect.as_ref())
                .await?;
            child
                .fire_mutation_hook(child.inner.hooks.on_connect.as_ref())
                .await?;
        }
        Ok(())
    }

    /// Execute a single-shot callable: fire before-run, resolve bindings,
    /// await the callable under the timeout, validate the returned value,
    /// fire after-run, then commit the output.
    pub async fn run(&self) -> Result<(), RunError> {
        let Some(handler) = self.inner.callable.as_single() else {
            return Err(RunError::NotSingleShot {
                id: self.id().clone(),
            });
        };
        let _exec = self.inner.exec.lock().await;
        self.set_running(true);
        let started = Instant::now();
        trace!(node = %self.id(), "run starting");

        let outcome: Result<Option<Value>, RunError> = async {
            self.fire_run_hook(self.inner.hooks.before_run.as_ref(), "before-run")
                .await?;
            if self.inner.timeout.is_zero() {
                return Err(RunError::Timeout {
                    id: self.id().clone(),
                    timeout: self.inner.timeout,
                });
            }
            let args = Value::Object(self.resolved_args());
            let value = match time::timeout(self.inner.timeout, handler.call(args)).await {
                Ok(Ok(value)) => value,
                Ok(Err(source)) => {
                    return Err(RunError::Callable {
                        id: self.id().clone(),
                        source,
                    });
                }
                Err(_) => {
                    return Err(RunError::Timeout {
                        id: self.id().clone(),
                        timeout: self.inner.timeout,
                    });
                }
            };
            schema::check(self.id(), self.inner.element_type.as_ref(), &value)?;
            Ok(Some(value))
        }
        .await;

        self.finish_run(outcome, started).await
    }

    /// Execute a streaming callable: every produced element is validated and
    /// handed to `emit` as a [`Chunk`]; the final element becomes the output.
    pub async fn run_streaming(&self, mut emit: impl FnMut(Chunk)) -> Result<(), RunError> {
        let Some(handler) = self.inner.callable.as_streaming() else {
            return Err(RunError::NotStreaming {
                id: self.id().clone(),
            });
        };
        let _exec = self.inner.exec.lock().await;
        self.set_running(true);
        let started = Instant::now();
        trace!(node = %self.id(), "streaming run starting");

        let outcome: Result<Option<Value>, RunError> = async {
            self.fire_run_hook(self.inner.hooks.before_run.as_ref(), "before-run")
                .await?;
            if self.inner.timeout.is_zero() {
                return Err(RunError::Timeout {
                    id: self.id().clone(),
                    timeout: self.inner.timeout,
                });
            }
            let args = Value::Object(self.resolved_args());
            let consumed = time::timeout(self.inner.timeout, async {
                let mut stream = handler.call(args).await.map_err(|source| {
                    RunError::Callable {
                        id: self.id().clone(),
                        source,
                    }
                })?;
                let mut last = None;
                while let Some(item) = stream.next().await {
                    let value = item.map_err(|source| RunError::Callable {
                        id: self.id().clone(),
                        source,
                    })?;
                    schema::check(self.id(), self.inner.element_type.as_ref(), &value)?;
                    emit(Chunk::new(self.id().clone(), value.clone()));
                    last = Some(value);
                }
                Ok(last)
            })
            .await;
            match consumed {
                Ok(result) => result,
                Err(_) => Err(RunError::Timeout {
                    id: self.id().clone(),
                    timeout: self.inner.timeout,
                }),
            }
        }
        .await;

        self.finish_run(outcome, started).await
    }

    /// Record this node's completion on the edge to `child`: install the
    /// forwarded value (transform applied) and decrement the child's
    /// outstanding-parent counter in one critical section, so a child that
    /// becomes ready sees every forwarded value. Returns the counter after
    /// the decrement.
    pub async fn complete_edge_to(&self, child: &Node) -> Result<usize, RunError> {
        let slot = child
            .state()
            .forwards
            .iter()
            .find(|slot| slot.parent == self.key())
            .cloned();

        let installed = match slot {
            Some(slot) => {
                let value = self.output().unwrap_or(Value::Null);
                let value = match &slot.transform {
                    Some(transform) => transform.apply(value).await.map_err(|source| {
                        RunError::Transform {
                            id: child.id().clone(),
                            source,
                        }
                    })?,
                    None => value,
                };
                Some((slot.param, value))
            }
            None => None,
        };

        let mut child_state = child.state();
        if let Some((param, value)) = installed {
            child_state.forwarded.insert(param, value);
        }
        child_state.pending_parents = child_state.pending_parents.saturating_sub(1);
        Ok(child_state.pending_parents)
    }

    /// Reset per-run bookkeeping ahead of a launch. Invoked by the scheduler
    /// for every node reachable from the roots.
    pub fn prepare_run(&self, pending_parents: usize, level: usize) {
        let mut state = self.state();
        state.pending_parents = pending_parents;
        state.metadata.level = level;
        state.forwarded.clear();
    }

    /// Parents still outstanding in the current run.
    pub fn pending_parents(&self) -> usize {
        self.state().pending_parents
    }

    /// Whether a path of edges leads from this node to `target`.
    fn reaches(&self, target: &Node) -> bool {
        let mut stack = vec![self.clone()];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node.key()) {
                continue;
            }
            if node.same_node(target) {
                return true;
            }
            stack.extend(node.children());
        }
        false
    }

    fn lock_pair<'a>(
        &'a self,
        other: &'a Node,
    ) -> Result<(tokio::sync::MutexGuard<'a, ()>, tokio::sync::MutexGuard<'a, ()>), GraphError>
    {
        // Fixed acquisition order keyed by identity, so overlapping
        // mutations cannot deadlock.
        let (first, second) = if self.key() <= other.key() {
            (self, other)
        } else {
            (other, self)
        };
        let first_guard = first
            .inner
            .exec
            .try_lock()
            .map_err(|_| GraphError::SafeExecution {
                id: first.id().clone(),
            })?;
        let second_guard = second
            .inner
            .exec
            .try_lock()
            .map_err(|_| GraphError::SafeExecution {
                id: second.id().clone(),
            })?;
        Ok((first_guard, second_guard))
    }

    fn unlink(&self, child: &Node) {
        {
            let mut state = self.state();
            state.children.retain(|node| !node.same_node(child));
        }
        let mut child_state = child.state();
        child_state.parents.retain(|node| !node.same_node(self));
        child_state.forwards.retain(|slot| slot.parent != self.key());
    }

    /// Defaults, then bindings (thunks resolved), then forwarded inputs.
    /// Disjointness of the last two stages is guaranteed at connect time.
    fn resolved_args(&self) -> ArgMap {
        let (bindings, forwarded) = {
            let state = self.state();
            (state.bindings.clone(), state.forwarded.clone())
        };
        let mut args = self.inner.callable.signature().defaults();
        for (name, binding) in &bindings {
            args.insert(name.clone(), binding.resolve());
        }
        for (name, value) in forwarded {
            args.insert(name, value);
        }
        args
    }

    async fn finish_run(
        &self,
        outcome: Result<Option<Value>, RunError>,
        started: Instant,
    ) -> Result<(), RunError> {
        let after = self
            .fire_run_hook(self.inner.hooks.after_run.as_ref(), "after-run")
            .await;
        if let (Ok(Some(value)), Ok(())) = (&outcome, &after) {
            self.state().output = Some(value.clone());
        }
        {
            let mut state = self.state();
            state.metadata.runtime = started.elapsed();
            state.is_running = false;
        }
        trace!(node = %self.id(), "run finished");
        match (outcome, after) {
            (Err(err), _) => Err(err),
            (_, Err(err)) => Err(err),
            _ => Ok(()),
        }
    }

    async fn fire_run_hook(
        &self,
        hook: Option<&Hook>,
        label: &'static str,
    ) -> Result<(), RunError> {
        match hook {
            Some(hook) => hook.fire().await.map_err(|source| RunError::Hook {
                id: self.id().clone(),
                hook: label,
                source,
            }),
            None => Ok(()),
        }
    }

    async fn fire_mutation_hook(&self, hook: Option<&Hook>) -> Result<(), GraphError> {
        match hook {
            Some(hook) => hook.fire().await.map_err(|source| GraphError::Hook {
                id: self.id().clone(),
                source,
            }),
            None => Ok(()),
        }
    }

    fn set_running(&self, running: bool) {
        self.state().is_running = running;
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("id", &self.inner.id).finish()
    }
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    id: NodeId,
    callable: Callable,
    bindings: BTreeMap<String, Binding>,
    timeout: Duration,
    element_type: Option<ElementType>,
    hooks: Hooks,
}

impl NodeBuilder {
    /// Bind a concrete argument value.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), Binding::value(value));
        self
    }

    /// Bind a lazily evaluated argument.
    pub fn bind_thunk<F>(mut self, name: impl Into<String>, thunk: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.bindings.insert(name.into(), Binding::thunk(thunk));
        self
    }

    /// Override the per-execution wall-clock budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declare the element type produced values are validated against.
    pub fn element_type(mut self, element_type: ElementType) -> Self {
        self.element_type = Some(element_type);
        self
    }

    /// Hook fired after this node gains an edge.
    pub fn on_connect(mut self, hook: Hook) -> Self {
        self.hooks.on_connect = Some(hook);
        self
    }

    /// Hook fired after this node loses an edge.
    pub fn on_disconnect(mut self, hook: Hook) -> Self {
        self.hooks.on_disconnect = Some(hook);
        self
    }

    /// Hook fired before the callable is invoked.
    pub fn on_before_run(mut self, hook: Hook) -> Self {
        self.hooks.before_run = Some(hook);
        self
    }

    /// Hook fired once the callable has settled.
    pub fn on_after_run(mut self, hook: Hook) -> Self {
        self.hooks.after_run = Some(hook);
        self
    }

    /// Finalise the node.
    pub fn build(self) -> Node {
        Node {
            inner: Arc::new(NodeInner {
                id: self.id,
                callable: self.callable,
                timeout: self.timeout,
                element_type: self.element_type,
                hooks: self.hooks,
                state: Mutex::new(NodeState {
                    bindings: self.bindings,
                    parents: Vec::new(),
                    children: Vec::new(),
                    forwards: Vec::new(),
                    forwarded: ArgMap::new(),
                    output: None,
                    metadata: NodeMetadata::default(),
                    pending_parents: 0,
                    is_running: false,
                }),
                exec: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use crate::callable::Signature;
    use crate::error::TaskError;

    use super::*;

    fn constant(id: &str, value: Value) -> Node {
        let callable = Callable::single_shot(Signature::empty(), move |_: Value| {
            let value = value.clone();
            async move { Ok(value) }
        });
        Node::builder(id, callable).build()
    }

    fn sink(id: &str, params: &[&str]) -> Node {
        let callable = Callable::single_shot(
            Signature::new(params.iter().copied()),
            |args: Value| async move { Ok(args) },
        );
        Node::builder(id, callable).build()
    }

    #[tokio::test]
    async fn connect_updates_both_edge_sets() {
        let parent = constant("parent", json!(1));
        let child = sink("child", &["x"]);

        parent.connect(&child, Forward::Nothing, None).await.unwrap();

        assert!(parent.children().iter().any(|n| n.same_node(&child)));
        assert!(child.parents().iter().any(|n| n.same_node(&parent)));
    }

    #[tokio::test]
    async fn self_connect_is_rejected() {
        let node = constant("loop", json!(1));
        let err = node.connect(&node, Forward::Nothing, None).await.unwrap_err();
        assert!(matches!(err, GraphError::SelfLoop { .. }));
    }

    #[tokio::test]
    async fn cycles_are_rejected_and_edges_unchanged() {
        let a = constant("a", json!(1));
        let b = constant("b", json!(2));
        let c = constant("c", json!(3));

        a.connect(&b, Forward::Nothing, None).await.unwrap();
        b.connect(&c, Forward::Nothing, None).await.unwrap();

        let err = c.connect(&a, Forward::Nothing, None).await.unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert!(c.children().is_empty());
        assert!(a.parents().is_empty());
    }

    #[tokio::test]
    async fn forwarding_override_leaves_parents_unchanged() {
        let parent = constant("parent", json!("v"));
        let callable = Callable::single_shot(Signature::new(["x"]), |args: Value| async move {
            Ok(args)
        });
        let child = Node::builder("child", callable)
            .bind("x", json!("preset"))
            .build();

        let err = parent
            .connect(&child, Forward::named("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::ForwardingOverride { .. }));
        assert!(child.parents().is_empty());
    }

    #[tokio::test]
    async fn auto_forward_requires_one_eligible_parameter() {
        let parent = constant("parent", json!("v"));
        let wide = sink("wide", &["a", "b"]);

        let err = parent.connect(&wide, Forward::Auto, None).await.unwrap_err();
        assert!(matches!(err, GraphError::AutoForward { eligible: 2, .. }));
        assert!(wide.parents().is_empty());

        let narrow = sink("narrow", &["x"]);
        parent.connect(&narrow, Forward::Auto, None).await.unwrap();
        assert!(narrow.parents().iter().any(|n| n.same_node(&parent)));
    }

    #[tokio::test]
    async fn second_parent_forwarding_to_same_param_is_rejected() {
        let first = constant("first", json!(1));
        let second = constant("second", json!(2));
        let child = sink("child", &["x", "y"]);

        first.connect(&child, Forward::named("x"), None).await.unwrap();
        let err = second
            .connect(&child, Forward::named("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::ForwardingOverride { .. }));
        assert_eq!(child.parents().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_then_connect_restores_the_edge() {
        let parent = constant("parent", json!(1));
        let child = sink("child", &["x"]);

        parent.connect(&child, Forward::named("x"), None).await.unwrap();
        parent.disconnect(&child).await.unwrap();
        assert!(parent.children().is_empty());
        assert!(child.parents().is_empty());

        parent.connect(&child, Forward::Nothing, None).await.unwrap();
        assert_eq!(parent.children().len(), 1);
    }

    #[tokio::test]
    async fn redirect_with_current_children_keeps_edge_set() {
        let parent = constant("parent", json!(1));
        let a = sink("a", &[]);
        let b = sink("b", &[]);
        parent.connect(&a, Forward::Nothing, None).await.unwrap();
        parent.connect(&b, Forward::Nothing, None).await.unwrap();

        parent.redirect(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(parent.children().len(), 2);
        assert_eq!(a.parents().len(), 1);
        assert_eq!(b.parents().len(), 1);
    }

    #[tokio::test]
    async fn redirect_swaps_children_atomically() {
        let parent = constant("parent", json!(1));
        let old = sink("old", &[]);
        let new = sink("new", &[]);
        parent.connect(&old, Forward::Nothing, None).await.unwrap();

        parent.redirect(std::slice::from_ref(&new)).await.unwrap();
        assert!(old.parents().is_empty());
        assert!(parent.children().iter().any(|n| n.same_node(&new)));
        assert_eq!(new.parents().len(), 1);
    }

    #[tokio::test]
    async fn run_resolves_defaults_bindings_and_forwards() {
        #[derive(Deserialize)]
        struct Args {
            base: i64,
            bound: i64,
            fed: i64,
        }
        let callable = Callable::single_shot(
            Signature::new(["base", "bound", "fed"]).with_default("base", json!(1)),
            |args: Args| async move { Ok(args.base + args.bound + args.fed) },
        );
        let parent = constant("parent", json!(100));
        let child = Node::builder("child", callable).bind("bound", json!(10)).build();

        parent
            .connect(&child, Forward::named("fed"), None)
            .await
            .unwrap();
        child.prepare_run(1, 1);
        parent.run().await.unwrap();
        let remaining = parent.complete_edge_to(&child).await.unwrap();
        assert_eq!(remaining, 0);

        child.run().await.unwrap();
        assert_eq!(child.output(), Some(json!(111)));
    }

    #[tokio::test]
    async fn forward_transform_replaces_the_value() {
        let parent = constant("parent", json!("x"));
        let child = sink("child", &["d"]);
        let transform = ForwardHook::new(|value: Value, _| async move {
            Ok(json!(format!("p_{}", value.as_str().unwrap_or_default())))
        });

        parent
            .connect(&child, Forward::named("d"), Some(transform))
            .await
            .unwrap();
        child.prepare_run(1, 1);
        parent.run().await.unwrap();
        parent.complete_edge_to(&child).await.unwrap();
        child.run().await.unwrap();

        assert_eq!(child.output(), Some(json!({"d": "p_x"})));
    }

    #[tokio::test]
    async fn failing_transform_surfaces_as_the_childs_error() {
        let parent = constant("parent", json!("x"));
        let child = sink("child", &["d"]);
        let transform =
            ForwardHook::new(|_, _| async move { Err(TaskError::new("transform refused")) });

        parent
            .connect(&child, Forward::named("d"), Some(transform))
            .await
            .unwrap();
        child.prepare_run(1, 1);
        parent.run().await.unwrap();
        let err = parent.complete_edge_to(&child).await.unwrap_err();
        assert!(matches!(err, RunError::Transform { .. }));
        assert_eq!(child.pending_parents(), 1);
    }

    #[tokio::test]
    async fn run_rejects_streaming_callables() {
        let callable = Callable::streaming(Signature::empty(), |_: Value| async move {
            Ok(futures::stream::iter(vec![Ok(json!(0))]))
        });
        let node = Node::builder("stream", callable).build();
        let err = node.run().await.unwrap_err();
        assert!(matches!(err, RunError::NotSingleShot { .. }));

        let single = constant("single", json!(1));
        let err = single.run_streaming(|_| {}).await.unwrap_err();
        assert!(matches!(err, RunError::NotStreaming { .. }));
    }

    #[tokio::test]
    async fn zero_timeout_fails_without_invoking_the_callable() {
        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        let callable = Callable::single_shot(Signature::empty(), move |_: Value| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(json!(1))
            }
        });
        let node = Node::builder("impatient", callable)
            .timeout(Duration::ZERO)
            .build();

        let err = node.run().await.unwrap_err();
        assert!(matches!(err, RunError::Timeout { .. }));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(node.output(), None);
    }

    #[tokio::test]
    async fn timeout_marks_the_run_errored() {
        let callable = Callable::single_shot(Signature::empty(), |_: Value| async move {
            time::sleep(Duration::from_millis(250)).await;
            Ok(json!(1))
        });
        let node = Node::builder("slow", callable)
            .timeout(Duration::from_millis(20))
            .build();

        let err = node.run().await.unwrap_err();
        assert!(matches!(err, RunError::Timeout { .. }));
        assert_eq!(node.output(), None);
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn type_mismatch_is_reported_per_declaration() {
        let callable = Callable::single_shot(Signature::empty(), |_: Value| async move {
            Ok(json!(5))
        });
        let node = Node::builder("typed", callable)
            .element_type(ElementType::String)
            .build();

        let err = node.run().await.unwrap_err();
        assert!(matches!(err, RunError::TypeMismatch { .. }));
        assert_eq!(node.output(), None);
    }

    #[tokio::test]
    async fn streaming_run_emits_chunks_and_commits_last_value() {
        let callable = Callable::streaming(Signature::empty(), |_: Value| async move {
            Ok(futures::stream::iter((0..4).map(|i| Ok(json!(i)))))
        });
        let node = Node::builder("emitter", callable).build();

        let mut chunks = Vec::new();
        node.run_streaming(|chunk| chunks.push(chunk)).await.unwrap();

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.source() == node.id()));
        let values: Vec<&Value> = chunks.iter().map(Chunk::value).collect();
        assert_eq!(values, vec![&json!(0), &json!(1), &json!(2), &json!(3)]);
        assert_eq!(node.output(), Some(json!(3)));
    }

    #[tokio::test]
    async fn mutation_fails_while_a_run_is_in_flight() {
        let callable = Callable::single_shot(Signature::empty(), |_: Value| async move {
            time::sleep(Duration::from_millis(200)).await;
            Ok(json!(1))
        });
        let busy = Node::builder("busy", callable).build();
        let other = constant("other", json!(2));

        let runner = {
            let busy = busy.clone();
            tokio::spawn(async move { busy.run().await })
        };
        time::sleep(Duration::from_millis(50)).await;

        let err = busy
            .connect(&other, Forward::Nothing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::SafeExecution { .. }));
        let err = other.connect(&busy, Forward::Nothing, None).await.unwrap_err();
        assert!(matches!(err, GraphError::SafeExecution { .. }));

        runner.await.unwrap().unwrap();
        assert_eq!(busy.output(), Some(json!(1)));
    }

    #[tokio::test]
    async fn hooks_fire_in_lifecycle_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let record = |label: &'static str, log: &Arc<std::sync::Mutex<Vec<String>>>| {
            let log = Arc::clone(log);
            Hook::new(move |_| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(label.to_string());
                    Ok(())
                }
            })
        };

        let callable = Callable::single_shot(Signature::empty(), |_: Value| async move {
            Ok(json!("done"))
        });
        let node = Node::builder("hooked", callable)
            .on_before_run(record("before", &log))
            .on_after_run(record("after", &log))
            .build();

        node.run().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn before_run_hook_failure_skips_the_callable() {
        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        let callable = Callable::single_shot(Signature::empty(), move |_: Value| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(json!(1))
            }
        });
        let node = Node::builder("guarded", callable)
            .on_before_run(Hook::new(|_| async move { Err(TaskError::new("denied")) }))
            .build();

        let err = node.run().await.unwrap_err();
        assert!(matches!(err, RunError::Hook { hook: "before-run", .. }));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }
}
