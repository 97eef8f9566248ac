use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::binding::{ArgMap, Binding, resolve_table};
use crate::error::TaskResult;

type HookFn = Arc<dyn Fn(ArgMap) -> BoxFuture<'static, TaskResult<()>> + Send + Sync>;
type TransformFn = Arc<dyn Fn(Value, ArgMap) -> BoxFuture<'static, TaskResult<Value>> + Send + Sync>;

/// Lifecycle callback paired with a fixed binding table.
///
/// The bindings (thunks included) are resolved each time the hook fires and
/// handed to the function as its argument map.
#[derive(Clone)]
pub struct Hook {
    func: HookFn,
    bindings: BTreeMap<String, Binding>,
}

impl Hook {
    /// Wrap an async hook function.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(ArgMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        let func: HookFn = Arc::new(move |args| Box::pin(func(args)));
        Self {
            func,
            bindings: BTreeMap::new(),
        }
    }

    /// Attach a fixed binding resolved at fire time.
    pub fn bind(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }

    pub(crate) async fn fire(&self) -> TaskResult<()> {
        let args = resolve_table(&self.bindings);
        (self.func)(args).await
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(..)")
    }
}

/// Transform applied to a forwarded value before it reaches the child.
///
/// The function receives the parent's output as its first argument and the
/// resolved fixed bindings as its second; its return value replaces the
/// forwarded value.
#[derive(Clone)]
pub struct ForwardHook {
    func: TransformFn,
    bindings: BTreeMap<String, Binding>,
}

impl ForwardHook {
    /// Wrap an async transform function.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Value, ArgMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<Value>> + Send + 'static,
    {
        let func: TransformFn = Arc::new(move |value, args| Box::pin(func(value, args)));
        Self {
            func,
            bindings: BTreeMap::new(),
        }
    }

    /// Attach a fixed binding resolved at apply time.
    pub fn bind(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }

    pub(crate) async fn apply(&self, value: Value) -> TaskResult<Value> {
        let args = resolve_table(&self.bindings);
        (self.func)(value, args).await
    }
}

impl fmt::Debug for ForwardHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ForwardHook(..)")
    }
}
