//! Core node-graph model for Trellis.
//!
//! Users wrap asynchronous computations in [`Node`]s, wire them into a DAG
//! with declarative forwarding rules, and hand the roots to an executor.
//! This crate owns the vertex model: callables and their declared
//! signatures, bound arguments with lazy thunks, connect/disconnect/redirect
//! with cycle and forwarding validation, lifecycle hooks, element-type
//! checks, and the chunk envelope for streamed values.

mod binding;
mod callable;
mod chunk;
mod error;
mod forward;
mod hook;
mod node;
mod schema;

pub use binding::{ArgMap, Binding};
pub use callable::{Callable, Signature, ValueStream};
pub use chunk::Chunk;
pub use error::{GraphError, RunError, TaskError, TaskResult};
pub use forward::Forward;
pub use hook::{ForwardHook, Hook};
pub use node::{DEFAULT_TIMEOUT, Node, NodeBuilder, NodeId, NodeMetadata};
pub use schema::{ElementType, value_kind};
pub use serde_json;

/// Convenient prelude re-exporting the most commonly used items.
pub mod prelude {
    pub use crate::binding::{ArgMap, Binding};
    pub use crate::callable::{Callable, Signature};
    pub use crate::chunk::Chunk;
    pub use crate::error::{GraphError, RunError, TaskError, TaskResult};
    pub use crate::forward::Forward;
    pub use crate::hook::{ForwardHook, Hook};
    pub use crate::node::{Node, NodeId};
    pub use crate::schema::ElementType;
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::prelude::*;

    #[tokio::test]
    async fn a_small_graph_wires_and_runs_by_hand() {
        let source = Node::builder(
            "source",
            Callable::single_shot(Signature::empty(), |_: Value| async move { Ok(json!("x")) }),
        )
        .build();
        let doubler = Node::builder(
            "doubler",
            Callable::single_shot(Signature::new(["text"]), |args: Value| async move {
                let text = args["text"].as_str().unwrap_or_default();
                Ok(json!(format!("{text}{text}")))
            }),
        )
        .build();

        source
            .connect(&doubler, Forward::Auto, None)
            .await
            .expect("connect succeeds");

        source.run().await.expect("source runs");
        source
            .complete_edge_to(&doubler)
            .await
            .expect("forward installs");
        doubler.run().await.expect("doubler runs");

        assert_eq!(doubler.output(), Some(json!("xx")));
    }
}
