use std::collections::BTreeMap;

use crate::binding::Binding;
use crate::callable::Signature;
use crate::error::GraphError;
use crate::hook::ForwardHook;
use crate::node::NodeId;

/// Forwarding declaration for a parent -> child edge, fixed at connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Forward {
    /// The parent's output is not passed to the child.
    #[default]
    Nothing,
    /// Bind the parent's output to the named child parameter.
    Named(String),
    /// Bind the parent's output to the child's single eligible parameter.
    Auto,
}

impl Forward {
    /// Convenience constructor for the named mode.
    pub fn named(param: impl Into<String>) -> Self {
        Forward::Named(param.into())
    }
}

/// Run-time forwarding rule registered on the child for one incoming edge.
#[derive(Clone)]
pub(crate) struct ForwardSlot {
    /// Stable identity key of the parent endpoint.
    pub(crate) parent: usize,
    /// Child parameter receiving the parent's output.
    pub(crate) param: String,
    /// Optional transform applied before installation.
    pub(crate) transform: Option<ForwardHook>,
}

/// Resolve a declaration against the child's signature, bound arguments, and
/// the forwards already claimed by other parents. Returns the concrete
/// target parameter, or `None` when nothing is forwarded.
pub(crate) fn resolve(
    child: &NodeId,
    signature: &Signature,
    bound: &BTreeMap<String, Binding>,
    claimed: &[ForwardSlot],
    forward: &Forward,
) -> Result<Option<String>, GraphError> {
    match forward {
        Forward::Nothing => Ok(None),
        Forward::Named(param) => {
            if !signature.declares(param) && !signature.accepts_extra() {
                return Err(GraphError::ForwardingParameter {
                    child: child.clone(),
                    param: param.clone(),
                });
            }
            if bound.contains_key(param) || claimed.iter().any(|slot| slot.param == *param) {
                return Err(GraphError::ForwardingOverride {
                    child: child.clone(),
                    param: param.clone(),
                });
            }
            Ok(Some(param.clone()))
        }
        Forward::Auto => {
            let eligible: Vec<&str> = signature
                .params()
                .filter(|name| !bound.contains_key(*name))
                .filter(|name| !claimed.iter().any(|slot| slot.param == *name))
                .collect();
            match eligible.as_slice() {
                [single] => Ok(Some((*single).to_string())),
                other => Err(GraphError::AutoForward {
                    child: child.clone(),
                    eligible: other.len(),
                }),
            }
        }
    }
}
