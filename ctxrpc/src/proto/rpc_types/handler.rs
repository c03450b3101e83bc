//! Traits for defining server-side method tables.
use std::future::Future;

use futures::{future::BoxFuture, stream::BoxStream, FutureExt as _, Stream, StreamExt as _};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::proto::message::{CallId, Metadata, RemoteError};

pub type UnaryFuture = BoxFuture<'static, Result<Value, RemoteError>>;
pub type ProgressStream = BoxStream<'static, Result<Value, RemoteError>>;

/// What a method invocation hands back to the dispatcher: either one
/// eventual value or a stream of progress values.
pub enum MethodOutput {
    Unary(UnaryFuture),
    Streaming(ProgressStream),
}

impl MethodOutput {
    pub fn unary<F, T>(fut: F) -> Self
    where
        F: Future<Output = Result<T, RemoteError>> + Send + 'static,
        T: Serialize,
    {
        MethodOutput::Unary(
            fut.map(|ret| ret.and_then(|v| serde_json::to_value(v).map_err(RemoteError::from)))
                .boxed(),
        )
    }

    pub fn streaming<S, T>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, RemoteError>> + Send + 'static,
        T: Serialize,
    {
        MethodOutput::Streaming(
            stream
                .map(|item| item.and_then(|v| serde_json::to_value(v).map_err(RemoteError::from)))
                .boxed(),
        )
    }
}

impl std::fmt::Debug for MethodOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodOutput::Unary(_) => f.write_str("MethodOutput::Unary"),
            MethodOutput::Streaming(_) => f.write_str("MethodOutput::Streaming"),
        }
    }
}

/// Per-invocation context: the trailing metadata and abort signal every
/// method receives.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub id: CallId,
    pub metadata: Metadata,
    pub signal: CancellationToken,
}

impl CallContext {
    pub fn is_aborted(&self) -> bool {
        self.signal.is_cancelled()
    }
}

/// Positional arguments of a `start` message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Vec<Value>);

impl Payload {
    pub fn new(args: Vec<Value>) -> Self {
        Self(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode argument `index`. A missing argument decodes from `null`, so
    /// optional trailing parameters can be read as `Option<T>`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, RemoteError> {
        let v = self.0.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(v).map_err(|e| {
            RemoteError::invalid_arguments(format!("argument {}: {}", index, e))
        })
    }

    /// Decode the whole argument list, typically into a tuple.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RemoteError> {
        serde_json::from_value(Value::Array(self.0.clone())).map_err(RemoteError::invalid_arguments)
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Payload {
    fn from(args: Vec<Value>) -> Self {
        Self(args)
    }
}

/// A concrete service implementation the dispatcher can invoke by method
/// name. `None` means the method does not exist.
#[auto_impl::auto_impl(Box, Arc)]
pub trait Implementation: Send + Sync + 'static {
    fn dispatch(&self, method: &str, payload: Payload, ctx: CallContext) -> Option<MethodOutput>;

    fn method_names(&self) -> Vec<String> {
        vec![]
    }
}
