use std::time::Duration;

use thiserror::Error;

use crate::node::NodeId;
use crate::schema::ElementType;

/// Convenient result alias for user callables and hooks.
pub type TaskResult<T> = Result<T, TaskError>;

/// Canonical error type surfaced by user callables, hooks, and forward
/// transforms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Generic error message.
    #[error("{0}")]
    Message(String),
}

impl TaskError {
    /// Construct a task error from displayable content.
    pub fn new(message: impl Into<String>) -> Self {
        TaskError::Message(message.into())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Message(err.to_string())
    }
}

/// Errors raised synchronously by graph mutation. The graph is left in its
/// pre-mutation state when one of these is returned.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// Mutation attempted while an endpoint is executing or being mutated.
    #[error("node `{id}` is busy; mutation rejected")]
    SafeExecution { id: NodeId },
    /// A node cannot be connected to itself.
    #[error("node `{id}` cannot be connected to itself")]
    SelfLoop { id: NodeId },
    /// The requested edge would close a cycle.
    #[error("connecting `{parent}` -> `{child}` would close a cycle")]
    Cycle { parent: NodeId, child: NodeId },
    /// Named forward target absent from the child's signature.
    #[error("forward target `{param}` is not a parameter of node `{child}`")]
    ForwardingParameter { child: NodeId, param: String },
    /// Forward target already bound in the child, or claimed by another parent.
    #[error("forward target `{param}` on node `{child}` is already bound")]
    ForwardingOverride { child: NodeId, param: String },
    /// Auto forwarding found zero or several eligible parameters.
    #[error(
        "auto forwarding into node `{child}` needs exactly one eligible parameter, found {eligible}"
    )]
    AutoForward { child: NodeId, eligible: usize },
    /// An on-connect or on-disconnect hook failed.
    #[error("mutation hook on node `{id}` failed: {source}")]
    Hook {
        id: NodeId,
        #[source]
        source: TaskError,
    },
}

/// Errors produced while running a node. The executor tags each with the
/// failing node's id in its error list.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// The callable exceeded the node's wall-clock budget.
    #[error("node `{id}` timed out after {timeout:?}")]
    Timeout { id: NodeId, timeout: Duration },
    /// A produced value failed the declared element-type check.
    #[error("node `{id}` produced a {actual} value, expected {expected}")]
    TypeMismatch {
        id: NodeId,
        expected: ElementType,
        actual: &'static str,
    },
    /// `run` was invoked on a node wrapping a streaming callable.
    #[error("node `{id}` wraps a streaming callable; call `run_streaming`")]
    NotSingleShot { id: NodeId },
    /// `run_streaming` was invoked on a node wrapping a single-shot callable.
    #[error("node `{id}` wraps a single-shot callable; call `run`")]
    NotStreaming { id: NodeId },
    /// The user callable returned an error.
    #[error("node `{id}` failed: {source}")]
    Callable {
        id: NodeId,
        #[source]
        source: TaskError,
    },
    /// A before-run or after-run hook returned an error.
    #[error("{hook} hook on node `{id}` failed: {source}")]
    Hook {
        id: NodeId,
        hook: &'static str,
        #[source]
        source: TaskError,
    },
    /// A forward transform failed while installing a value into `id`.
    #[error("forward transform into node `{id}` failed: {source}")]
    Transform {
        id: NodeId,
        #[source]
        source: TaskError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_from_anyhow_keeps_message() {
        let err: TaskError = anyhow::anyhow!("backend unavailable").into();
        assert_eq!(err, TaskError::new("backend unavailable"));
    }

    #[test]
    fn graph_error_display_names_endpoints() {
        let err = GraphError::Cycle {
            parent: NodeId::new("a"),
            child: NodeId::new("b"),
        };
        assert_eq!(err.to_string(), "connecting `a` -> `b` would close a cycle");
    }

    #[test]
    fn run_error_display_includes_hook_label() {
        let err = RunError::Hook {
            id: NodeId::new("n"),
            hook: "before-run",
            source: TaskError::new("boom"),
        };
        assert_eq!(err.to_string(), "before-run hook on node `n` failed: boom");
    }
}
