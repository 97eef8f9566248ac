use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

/// Resolved argument map handed to callables and hooks.
pub type ArgMap = Map<String, Value>;

/// A bound argument: either a concrete value or a zero-argument thunk
/// evaluated immediately before the consuming callable or hook is invoked.
#[derive(Clone)]
pub enum Binding {
    Value(Value),
    Thunk(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl Binding {
    /// Bind a concrete value.
    pub fn value(value: impl Into<Value>) -> Self {
        Binding::Value(value.into())
    }

    /// Bind a lazily evaluated thunk.
    pub fn thunk<F>(f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Binding::Thunk(Arc::new(f))
    }

    /// Produce the concrete value, evaluating the thunk if necessary.
    pub fn resolve(&self) -> Value {
        match self {
            Binding::Value(value) => value.clone(),
            Binding::Thunk(thunk) => thunk(),
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Binding::Thunk(_) => f.write_str("Thunk(..)"),
        }
    }
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Binding::Value(value)
    }
}

/// Resolve a binding table into a concrete argument map.
pub(crate) fn resolve_table(bindings: &BTreeMap<String, Binding>) -> ArgMap {
    bindings
        .iter()
        .map(|(name, binding)| (name.clone(), binding.resolve()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn thunks_resolve_at_read_time() {
        let source = Arc::new(std::sync::Mutex::new(json!(1)));
        let reader = Arc::clone(&source);
        let binding = Binding::thunk(move || reader.lock().unwrap().clone());

        assert_eq!(binding.resolve(), json!(1));
        *source.lock().unwrap() = json!(2);
        assert_eq!(binding.resolve(), json!(2));
    }

    #[test]
    fn tables_resolve_values_and_thunks_together() {
        let mut table = BTreeMap::new();
        table.insert("fixed".to_string(), Binding::value(json!("a")));
        table.insert("lazy".to_string(), Binding::thunk(|| json!(41 + 1)));

        let args = resolve_table(&table);
        assert_eq!(args["fixed"], json!("a"));
        assert_eq!(args["lazy"], json!(42));
    }
}
