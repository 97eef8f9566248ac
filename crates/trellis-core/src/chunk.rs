use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::NodeId;

/// Immutable envelope pairing a producing node with one streamed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    source: NodeId,
    value: Value,
}

impl Chunk {
    pub(crate) fn new(source: NodeId, value: Value) -> Self {
        Self { source, value }
    }

    /// Identity of the node that produced this value.
    pub fn source(&self) -> &NodeId {
        &self.source
    }

    /// The streamed value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consume the envelope, keeping the value.
    pub fn into_value(self) -> Value {
        self.value
    }
}
