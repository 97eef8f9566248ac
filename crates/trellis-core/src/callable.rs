use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::binding::ArgMap;
use crate::error::{TaskError, TaskResult};

/// One named parameter of a declared signature.
#[derive(Debug, Clone)]
struct Param {
    name: String,
    default: Option<Value>,
}

/// Declared signature of a user callable.
///
/// Rust offers no runtime introspection, so the parameter names a callable
/// accepts are declared alongside it. Forward validation and binding
/// resolution both consult this table.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    params: Vec<Param>,
    variadic: bool,
}

impl Signature {
    /// Declare a signature from an ordered list of parameter names.
    pub fn new<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params
                .into_iter()
                .map(|name| Param {
                    name: name.into(),
                    default: None,
                })
                .collect(),
            variadic: false,
        }
    }

    /// A signature with no declared parameters.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Attach a default value to a parameter, declaring it if absent.
    pub fn with_default(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        match self.params.iter_mut().find(|param| param.name == name) {
            Some(param) => param.default = Some(value),
            None => self.params.push(Param {
                name,
                default: Some(value),
            }),
        }
        self
    }

    /// Mark the callable as tolerating argument keys beyond the declared
    /// parameters (a map sink).
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Whether undeclared argument keys are accepted.
    pub fn accepts_extra(&self) -> bool {
        self.variadic
    }

    /// Whether `name` is a declared parameter.
    pub fn declares(&self, name: &str) -> bool {
        self.params.iter().any(|param| param.name == name)
    }

    /// Iterate over the declared parameter names in order.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|param| param.name.as_str())
    }

    /// Argument map seeded from the declared defaults.
    pub(crate) fn defaults(&self) -> ArgMap {
        self.params
            .iter()
            .filter_map(|param| {
                param
                    .default
                    .clone()
                    .map(|value| (param.name.clone(), value))
            })
            .collect()
    }
}

/// Lazily produced sequence of values from a streaming callable.
pub type ValueStream = BoxStream<'static, TaskResult<Value>>;

#[async_trait]
pub(crate) trait SingleShot: Send + Sync {
    async fn call(&self, args: Value) -> TaskResult<Value>;
}

#[async_trait]
pub(crate) trait Streaming: Send + Sync {
    async fn call(&self, args: Value) -> TaskResult<ValueStream>;
}

struct FunctionAdapter<F, Fut, In, Out>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<Out>> + Send + 'static,
    In: DeserializeOwned + Send + Sync + 'static,
    Out: Serialize + Send + Sync + 'static,
{
    inner: F,
    _marker: PhantomData<(In, Out)>,
}

#[async_trait]
impl<F, Fut, In, Out> SingleShot for FunctionAdapter<F, Fut, In, Out>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<Out>> + Send + 'static,
    In: DeserializeOwned + Send + Sync + 'static,
    Out: Serialize + Send + Sync + 'static,
{
    async fn call(&self, args: Value) -> TaskResult<Value> {
        let input: In = serde_json::from_value(args)
            .map_err(|err| TaskError::new(format!("failed to deserialize arguments: {err}")))?;
        let output = (self.inner)(input).await?;
        serde_json::to_value(output)
            .map_err(|err| TaskError::new(format!("failed to serialize output: {err}")))
    }
}

struct StreamingAdapter<F, Fut, In, S, Item>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<S>> + Send + 'static,
    In: DeserializeOwned + Send + Sync + 'static,
    S: Stream<Item = TaskResult<Item>> + Send + 'static,
    Item: Serialize + Send + Sync + 'static,
{
    inner: F,
    _marker: PhantomData<(In, Item)>,
}

#[async_trait]
impl<F, Fut, In, S, Item> Streaming for StreamingAdapter<F, Fut, In, S, Item>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<S>> + Send + 'static,
    In: DeserializeOwned + Send + Sync + 'static,
    S: Stream<Item = TaskResult<Item>> + Send + 'static,
    Item: Serialize + Send + Sync + 'static,
{
    async fn call(&self, args: Value) -> TaskResult<ValueStream> {
        let input: In = serde_json::from_value(args)
            .map_err(|err| TaskError::new(format!("failed to deserialize arguments: {err}")))?;
        let stream = (self.inner)(input).await?;
        let mapped = stream.map(|item| {
            item.and_then(|value| {
                serde_json::to_value(value)
                    .map_err(|err| TaskError::new(format!("failed to serialize stream item: {err}")))
            })
        });
        Ok(mapped.boxed())
    }
}

/// A user computation attached to a node, either single-shot or streaming.
///
/// The typed constructors deserialize the resolved argument map into the
/// function's input type and serialize outputs back to JSON, so user code
/// works with plain structs.
#[derive(Clone)]
pub struct Callable {
    signature: Signature,
    kind: CallableKind,
}

#[derive(Clone)]
enum CallableKind {
    Single(Arc<dyn SingleShot>),
    Streaming(Arc<dyn Streaming>),
}

impl Callable {
    /// Wrap an async function producing one value.
    pub fn single_shot<F, Fut, In, Out>(signature: Signature, f: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<Out>> + Send + 'static,
        In: DeserializeOwned + Send + Sync + 'static,
        Out: Serialize + Send + Sync + 'static,
    {
        Self {
            signature,
            kind: CallableKind::Single(Arc::new(FunctionAdapter {
                inner: f,
                _marker: PhantomData,
            })),
        }
    }

    /// Wrap an async function producing a lazy finite sequence of values.
    pub fn streaming<F, Fut, In, S, Item>(signature: Signature, f: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<S>> + Send + 'static,
        In: DeserializeOwned + Send + Sync + 'static,
        S: Stream<Item = TaskResult<Item>> + Send + 'static,
        Item: Serialize + Send + Sync + 'static,
    {
        Self {
            signature,
            kind: CallableKind::Streaming(Arc::new(StreamingAdapter {
                inner: f,
                _marker: PhantomData,
            })),
        }
    }

    /// Declared signature of the wrapped function.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Whether the wrapped function streams its output.
    pub fn is_streaming(&self) -> bool {
        matches!(self.kind, CallableKind::Streaming(_))
    }

    pub(crate) fn as_single(&self) -> Option<Arc<dyn SingleShot>> {
        match &self.kind {
            CallableKind::Single(handler) => Some(Arc::clone(handler)),
            CallableKind::Streaming(_) => None,
        }
    }

    pub(crate) fn as_streaming(&self) -> Option<Arc<dyn Streaming>> {
        match &self.kind {
            CallableKind::Streaming(handler) => Some(Arc::clone(handler)),
            CallableKind::Single(_) => None,
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CallableKind::Single(_) => "single_shot",
            CallableKind::Streaming(_) => "streaming",
        };
        f.debug_struct("Callable").field("kind", &kind).finish()
    }
}
