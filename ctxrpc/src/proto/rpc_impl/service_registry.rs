use std::{future::Future, sync::Arc};

use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;

use crate::proto::message::RemoteError;
use crate::proto::rpc_types::handler::{CallContext, Implementation, MethodOutput, Payload};

type MethodFn = dyn Fn(Payload, CallContext) -> MethodOutput + Send + Sync;

#[derive(Clone)]
struct MethodEntry {
    method: Arc<MethodFn>,
    streaming: bool,
}

/// Method table keyed by name. Implements [`Implementation`], so one
/// registry can back any number of servers.
#[derive(Default)]
pub struct ServiceRegistry {
    table: DashMap<String, MethodEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    pub fn replace_registry(&self, registry: &ServiceRegistry) {
        self.table.clear();
        for item in registry.table.iter() {
            let (k, v) = item.pair();
            self.table.insert(k.clone(), v.clone());
        }
    }

    /// Register a method that resolves to a single value.
    pub fn register_unary<F, Fut, T>(&self, name: &str, f: F)
    where
        F: Fn(Payload, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
        T: Serialize,
    {
        let entry = MethodEntry {
            method: Arc::new(move |payload, ctx| MethodOutput::unary(f(payload, ctx))),
            streaming: false,
        };
        if self.table.insert(name.to_owned(), entry).is_some() {
            tracing::debug!(name, "method replaced");
        }
    }

    /// Register a method that produces a sequence of progress values.
    pub fn register_streaming<F, S, T>(&self, name: &str, f: F)
    where
        F: Fn(Payload, CallContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, RemoteError>> + Send + 'static,
        T: Serialize,
    {
        let entry = MethodEntry {
            method: Arc::new(move |payload, ctx| MethodOutput::streaming(f(payload, ctx))),
            streaming: true,
        };
        if self.table.insert(name.to_owned(), entry).is_some() {
            tracing::debug!(name, "method replaced");
        }
    }

    pub fn unregister(&self, name: &str) -> Option<()> {
        self.table.remove(name).map(|_| ())
    }

    pub fn is_streaming(&self, name: &str) -> Option<bool> {
        self.table.get(name).map(|e| e.streaming)
    }
}

impl Implementation for ServiceRegistry {
    fn dispatch(&self, method: &str, payload: Payload, ctx: CallContext) -> Option<MethodOutput> {
        // release the shard lock before running user code
        let entry = self.table.get(method)?.clone();
        Some((entry.method)(payload, ctx))
    }

    fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.table.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::proto::message::new_call_id;

    use super::*;

    fn ctx() -> CallContext {
        CallContext {
            id: new_call_id(),
            metadata: Default::default(),
            signal: CancellationToken::new(),
        }
    }

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry.register_unary("add", |payload, _ctx| async move {
            let (a, b): (i64, i64) = payload.decode()?;
            Ok::<_, RemoteError>(a + b)
        });
        registry.register_streaming("range", |payload, _ctx| {
            let n: u32 = payload.arg(0).unwrap_or(0);
            futures::stream::iter((0..n).map(Ok::<_, RemoteError>))
        });
        registry
    }

    #[tokio::test]
    async fn dispatch_by_name() {
        let registry = registry();
        assert_eq!(registry.method_names(), vec!["add", "range"]);
        assert_eq!(registry.is_streaming("range"), Some(true));
        assert_eq!(registry.is_streaming("add"), Some(false));

        let Some(MethodOutput::Unary(fut)) =
            registry.dispatch("add", Payload::new(vec![json!(2), json!(3)]), ctx())
        else {
            panic!("add should be unary");
        };
        assert_eq!(fut.await.unwrap(), json!(5));

        let Some(MethodOutput::Streaming(stream)) =
            registry.dispatch("range", Payload::new(vec![json!(3)]), ctx())
        else {
            panic!("range should stream");
        };
        let items: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);

        assert!(registry.dispatch("missing", Payload::default(), ctx()).is_none());
    }

    #[tokio::test]
    async fn bad_arguments_surface_as_remote_error() {
        let registry = registry();
        let Some(MethodOutput::Unary(fut)) =
            registry.dispatch("add", Payload::new(vec![json!("x")]), ctx())
        else {
            panic!("add should be unary");
        };
        let err = fut.await.unwrap_err();
        assert_eq!(err.name.as_deref(), Some("InvalidArguments"));
    }

    #[test]
    fn unregister_and_replace() {
        let registry = registry();
        assert_eq!(registry.unregister("add"), Some(()));
        assert_eq!(registry.unregister("add"), None);
        assert_eq!(registry.method_names(), vec!["range"]);

        let other = ServiceRegistry::new();
        other.replace_registry(&registry);
        assert_eq!(other.method_names(), vec!["range"]);
    }
}
