use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::StreamExt as _;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    common::{config::RpcConfig, join_joinset_background, scoped_task::ScopedTask},
    proto::{
        message::{CallId, Message, MessageBody, Metadata, NoMetaMessage, RemoteError},
        rpc_types::{
            error::{Error, Result},
            handler::{CallContext, Implementation, MethodOutput, Payload},
        },
    },
    tunnel::{transportation::TunnelTransportation, Transportation, TunnelListener},
};

use super::service_registry::ServiceRegistry;

/// Name a method can put on a rejection to mark it as caused by the abort
/// signal; such rejections are not reported back.
pub const ABORT_ERROR_NAME: &str = "AbortError";

fn is_abort_error(e: &RemoteError) -> bool {
    e.name.as_deref() == Some(ABORT_ERROR_NAME)
}

struct ServerInner {
    transport: Box<dyn Transportation>,
    implementation: Arc<dyn Implementation>,
    active_requests: DashMap<CallId, CancellationToken>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    closed: CancellationToken,
    heartbeat: parking_lot::Mutex<Option<ScopedTask<()>>>,
    span: tracing::Span,
}

impl ServerInner {
    fn send(&self, message: NoMetaMessage) -> bool {
        if let Err(e) = self.transport.send(message) {
            tracing::debug!(?e, "failed to send message");
            return false;
        }
        true
    }

    fn handle_message(self: &Arc<Self>, message: Message) {
        let _g = self.span.enter();
        let Message { id, metadata, body } = message;
        match body {
            MessageBody::Start { method, payload } => {
                self.handle_start(id, metadata, method, payload)
            }
            MessageBody::Cancel => match self.active_requests.remove(&id) {
                Some((_, token)) => {
                    tracing::debug!(%id, "call cancelled by caller");
                    token.cancel();
                }
                None => tracing::debug!(%id, "cancel for unknown call, ignored"),
            },
            MessageBody::Heartbeat => tracing::trace!(%id, "heartbeat echo received"),
            MessageBody::Unknown => tracing::warn!(%id, "message of unknown type, dropped"),
            body => tracing::debug!(%id, ty = body.type_name(), "unexpected message for server"),
        }
    }

    fn handle_start(
        self: &Arc<Self>,
        id: CallId,
        metadata: Metadata,
        method: String,
        args: Vec<Value>,
    ) {
        if self.closed.is_cancelled() {
            tracing::debug!(%id, %method, "server closed, start ignored");
            return;
        }
        if self.active_requests.contains_key(&id) {
            tracing::warn!(%id, %method, "duplicate start for active call, ignored");
            return;
        }

        let token = CancellationToken::new();
        let ctx = CallContext {
            id,
            metadata,
            signal: token.clone(),
        };
        let Some(output) = self.implementation.dispatch(&method, Payload::new(args), ctx) else {
            tracing::warn!(%id, %method, "method not found");
            self.send(NoMetaMessage::new(
                id,
                MessageBody::End(Err(RemoteError::method_not_found(&method))),
            ));
            return;
        };

        tracing::debug!(%id, %method, ?output, "call started");
        self.active_requests.insert(id, token.clone());
        let inner = self.clone();
        let span = tracing::debug_span!("rpc_call", %id, %method);
        self.tasks.lock().unwrap().spawn(
            async move {
                inner.run_call(id, output, token).await;
            }
            .instrument(span),
        );
    }

    async fn run_call(&self, id: CallId, output: MethodOutput, token: CancellationToken) {
        crate::defer!(self.active_requests.remove(&id););
        match output {
            MethodOutput::Unary(fut) => {
                let ret = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    ret = fut => Some(ret),
                };
                self.active_requests.remove(&id);
                match ret {
                    Some(Ok(value)) => {
                        self.send(NoMetaMessage::new(id, MessageBody::End(Ok(value))));
                    }
                    Some(Err(e)) => self.finish_with_error(id, &token, e),
                    None => tracing::debug!("call aborted"),
                }
            }
            MethodOutput::Streaming(mut stream) => loop {
                let item = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::debug!("call aborted");
                        break;
                    }
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(payload)) => {
                        if token.is_cancelled() {
                            break;
                        }
                        if !self.send(NoMetaMessage::new(id, MessageBody::Progress { payload })) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        self.active_requests.remove(&id);
                        self.finish_with_error(id, &token, e);
                        break;
                    }
                    None => {
                        self.active_requests.remove(&id);
                        if !token.is_cancelled() {
                            self.send(NoMetaMessage::new(id, MessageBody::End(Ok(Value::Null))));
                        }
                        break;
                    }
                }
            },
        }
    }

    fn finish_with_error(&self, id: CallId, token: &CancellationToken, e: RemoteError) {
        if token.is_cancelled() || is_abort_error(&e) {
            tracing::debug!(%e, "call failed after abort, not reported");
            return;
        }
        tracing::error!(%e, "call failed");
        self.send(NoMetaMessage::new(id, MessageBody::End(Err(e))));
    }

    fn on_transport_closed(&self, reason: String) {
        let _g = self.span.enter();
        tracing::info!(%reason, active = self.active_requests.len(), "server transport closed");
        self.closed.cancel();
        for entry in self.active_requests.iter() {
            entry.value().cancel();
        }
        self.active_requests.clear();
        self.heartbeat.lock().take();
    }

    async fn run_heartbeat(inner: Weak<Self>, period: Duration) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            tracing::trace!("send heartbeat");
            if !inner.send(NoMetaMessage::heartbeat()) {
                return;
            }
        }
    }
}

/// Serves one [`Implementation`] over one transportation.
pub struct Server {
    inner: Arc<ServerInner>,
    heartbeat_interval: Duration,
}

impl Server {
    pub fn new(
        transport: Box<dyn Transportation>,
        implementation: Arc<dyn Implementation>,
        config: &RpcConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                transport,
                implementation,
                active_requests: DashMap::new(),
                tasks: Arc::new(Mutex::new(JoinSet::new())),
                closed: CancellationToken::new(),
                heartbeat: parking_lot::Mutex::new(None),
                span: tracing::info_span!("rpc_server", name = %config.name),
            }),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    /// Build and start serving in one go.
    pub fn create(
        transport: Box<dyn Transportation>,
        implementation: Arc<dyn Implementation>,
        config: &RpcConfig,
    ) -> Self {
        let server = Self::new(transport, implementation, config);
        server.run();
        server
    }

    pub fn run(&self) {
        let inner = &self.inner;
        join_joinset_background(inner.tasks.clone(), "rpc server".to_string());

        let weak = Arc::downgrade(inner);
        inner.transport.on_recv(Box::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(message);
            }
        }));

        let weak = Arc::downgrade(inner);
        inner.transport.on_close(Box::new(move |reason, _| {
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_closed(reason);
            }
        }));

        if !inner.closed.is_cancelled() {
            let task = tokio::spawn(
                ServerInner::run_heartbeat(Arc::downgrade(inner), self.heartbeat_interval)
                    .instrument(inner.span.clone()),
            );
            *inner.heartbeat.lock() = Some(task.into());
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active_requests.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the transportation has closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn close(&self) {
        self.inner.transport.dispose();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accepts tunnels from a [`TunnelListener`] and runs a [`Server`] over a
/// shared [`ServiceRegistry`] for each of them.
pub struct StandAloneServer<L> {
    registry: Arc<ServiceRegistry>,
    config: RpcConfig,
    listener: Option<L>,
    inflight_server: Arc<AtomicU32>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl<L: TunnelListener + 'static> StandAloneServer<L> {
    pub fn new(listener: L) -> Self {
        Self::with_config(listener, RpcConfig::default())
    }

    pub fn with_config(listener: L, config: RpcConfig) -> Self {
        StandAloneServer {
            registry: Arc::new(ServiceRegistry::new()),
            config,
            listener: Some(listener),
            inflight_server: Arc::new(AtomicU32::new(0)),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub async fn serve(&mut self) -> Result<()> {
        let Some(mut listener) = self.listener.take() else {
            return Err(Error::Execution(anyhow::anyhow!("server already serving")));
        };
        let tasks = self.tasks.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();

        join_joinset_background(tasks.clone(), "standalone server tasks".to_string());

        listener.listen().await?;
        tracing::info!(url = %listener.local_url(), "standalone server listening");

        let inflight_server = self.inflight_server.clone();
        let weak_tasks = Arc::downgrade(&tasks);
        self.tasks.lock().unwrap().spawn(async move {
            loop {
                let tunnel = match listener.accept().await {
                    Ok(tunnel) => tunnel,
                    Err(e) => {
                        tracing::error!(?e, "standalone server listener exit");
                        return;
                    }
                };
                let transport = match TunnelTransportation::new(tunnel) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(?e, "failed to set up transportation");
                        continue;
                    }
                };
                let Some(tasks) = weak_tasks.upgrade() else {
                    return;
                };

                let registry: Arc<dyn Implementation> = registry.clone();
                let config = config.clone();
                let inflight_server = inflight_server.clone();
                inflight_server.fetch_add(1, Ordering::Relaxed);
                tasks.lock().unwrap().spawn(async move {
                    let server = Server::create(Box::new(transport), registry, &config);
                    server.closed().await;
                    inflight_server.fetch_sub(1, Ordering::Relaxed);
                });
            }
        });

        Ok(())
    }

    pub fn inflight_server(&self) -> u32 {
        self.inflight_server.load(Ordering::Relaxed)
    }
}
