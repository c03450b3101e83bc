use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::Instrument;

use crate::common::{config::RpcConfig, scoped_task::ScopedTask};
use crate::proto::message::{CallId, Message, MessageBody, NoMetaMessage};
use crate::proto::rpc_types::error::{Error, Result};
use crate::tunnel::{TransportBuilder, Transportation};

use super::notifier::Notifier;

#[derive(Debug, Clone, PartialEq, derive_builder::Builder)]
pub struct StateControllerOptions {
    #[builder(setter(into), default = "\"rpc\".to_string()")]
    pub name: String,
    /// Dispose the connection when nothing is received for this long.
    #[builder(setter(strip_option), default = "None")]
    pub liveness_timeout: Option<Duration>,
}

impl Default for StateControllerOptions {
    fn default() -> Self {
        Self {
            name: "rpc".to_string(),
            liveness_timeout: None,
        }
    }
}

impl From<&RpcConfig> for StateControllerOptions {
    fn from(config: &RpcConfig) -> Self {
        Self {
            name: config.name.clone(),
            liveness_timeout: config.liveness_timeout(),
        }
    }
}

/// Inbound queue of one in-flight call.
#[derive(Debug, Default)]
pub(crate) struct Inbound {
    pub(crate) queue: Mutex<VecDeque<Message>>,
    pub(crate) notifier: Notifier,
}

pub(crate) struct State {
    transport: Box<dyn Transportation>,
    out_queue: Mutex<VecDeque<NoMetaMessage>>,
    out_notifier: Notifier,
    inc: DashMap<CallId, Arc<Inbound>>,
    disposed: AtomicBool,
    close_reason: Mutex<Option<(String, Option<String>)>>,
    last_recv: Mutex<Instant>,
    tasks: Mutex<Vec<ScopedTask<()>>>,
    span: tracing::Span,
}

impl State {
    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_error(&self) -> Error {
        match self.close_reason.lock().clone() {
            Some((reason, cause)) => Error::Closed { reason, cause },
            None => Error::closed("disposed"),
        }
    }

    /// Queue a message for the outbound pump.
    pub(crate) fn enqueue(&self, message: NoMetaMessage) -> Result<()> {
        if self.is_disposed() {
            return Err(self.closed_error());
        }
        self.out_queue.lock().push_back(message);
        self.out_notifier.notify();
        Ok(())
    }

    pub(crate) fn register(&self, id: CallId) -> Result<Arc<Inbound>> {
        if self.is_disposed() {
            return Err(self.closed_error());
        }
        let inbound = Arc::new(Inbound::default());
        self.inc.insert(id, inbound.clone());
        // dispose may have swept `inc` between the check and the insert
        if self.is_disposed() {
            self.inc.remove(&id);
            return Err(self.closed_error());
        }
        Ok(inbound)
    }

    pub(crate) fn unregister(&self, id: &CallId) {
        self.inc.remove(id);
    }

    fn route(&self, message: Message) {
        let _g = self.span.enter();
        *self.last_recv.lock() = Instant::now();

        if message.body == MessageBody::Unknown {
            tracing::warn!(id = %message.id, "message of unknown type, dropped");
            return;
        }

        let inbound = self.inc.get(&message.id).map(|e| e.value().clone());
        if let Some(inbound) = inbound {
            tracing::trace!(id = %message.id, ty = message.body.type_name(), "route to call");
            inbound.queue.lock().push_back(message);
            inbound.notifier.notify();
            return;
        }

        match &message.body {
            MessageBody::Heartbeat => {
                tracing::trace!(id = %message.id, "echo heartbeat");
                if let Err(e) = self.enqueue(message.strip_metadata()) {
                    tracing::debug!(?e, "drop heartbeat echo");
                }
            }
            MessageBody::Progress { .. } | MessageBody::End(_) => {
                tracing::debug!(
                    id = %message.id,
                    ty = message.body.type_name(),
                    "late message for finished call, dropped"
                );
            }
            MessageBody::Cancel => {
                tracing::debug!(id = %message.id, "cancel for unknown call, ignored");
            }
            MessageBody::Start { method, .. } => {
                tracing::warn!(id = %message.id, %method, "unexpected start message, dropped");
            }
            // dropped before the lookup
            MessageBody::Unknown => {}
        }
    }

    pub(crate) fn dispose(&self, reason: String, cause: Option<String>) {
        // the reason must be visible before anyone can observe `disposed`
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some((reason.clone(), cause.clone()));
            }
        }
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _g = self.span.enter();
            tracing::info!(%reason, ?cause, inflight = self.inc.len(), "dispose state controller");
        }

        for entry in self.inc.iter() {
            entry.value().notifier.throw(self.closed_error());
        }
        self.out_notifier.throw(self.closed_error());
        self.transport.dispose();
    }

    async fn run_pump(self: Arc<Self>) {
        loop {
            if let Err(e) = self.out_notifier.wait().await {
                tracing::debug!(?e, "outbound pump stopped");
                return;
            }
            loop {
                let Some(message) = self.out_queue.lock().pop_front() else {
                    break;
                };
                if let Err(e) = self.transport.send(message) {
                    tracing::error!(?e, "failed to send message, disposing");
                    self.dispose("transportation send failed".to_owned(), Some(e.to_string()));
                    return;
                }
            }
        }
    }

    async fn run_liveness_watchdog(state: Weak<Self>, timeout: Duration) {
        loop {
            let deadline = match state.upgrade() {
                Some(s) if !s.is_disposed() => *s.last_recv.lock() + timeout,
                _ => return,
            };
            tokio::time::sleep_until(deadline).await;

            let Some(s) = state.upgrade() else {
                return;
            };
            if s.last_recv.lock().elapsed() >= timeout {
                tracing::warn!(?timeout, "no message received in time, disposing");
                s.dispose("liveness timeout".to_owned(), None);
                return;
            }
        }
    }
}

/// Disposes the shared state once the last controller handle is gone.
struct DisposeGuard(Arc<State>);

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        self.0.dispose("state controller dropped".to_owned(), None);
    }
}

/// Owns one transportation: pumps outbound messages onto it and routes
/// inbound messages to the call they belong to.
#[derive(Clone)]
pub struct StateController {
    state: Arc<State>,
    _guard: Arc<DisposeGuard>,
}

impl StateController {
    pub async fn create<B, O>(
        builder: B,
        transport_options: O,
        options: StateControllerOptions,
    ) -> Result<Self>
    where
        B: TransportBuilder<O>,
    {
        let transport = builder.build(transport_options).await?;
        Ok(Self::with_transport(transport, options))
    }

    /// Take ownership of an already connected transportation. Must be called
    /// inside a tokio runtime.
    pub fn with_transport(
        transport: Box<dyn Transportation>,
        options: StateControllerOptions,
    ) -> Self {
        let span = tracing::info_span!("state_controller", name = %options.name);
        let state = Arc::new(State {
            transport,
            out_queue: Mutex::new(VecDeque::new()),
            out_notifier: Notifier::new(),
            inc: DashMap::new(),
            disposed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            last_recv: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
            span: span.clone(),
        });

        let weak = Arc::downgrade(&state);
        state.transport.on_recv(Box::new(move |message| {
            if let Some(state) = weak.upgrade() {
                state.route(message);
            }
        }));

        let weak = Arc::downgrade(&state);
        state.transport.on_close(Box::new(move |reason, error| {
            if let Some(state) = weak.upgrade() {
                state.dispose(
                    format!("transportation closed: {}", reason),
                    error.map(|e| e.to_string()),
                );
            }
        }));

        let mut tasks = vec![ScopedTask::from(tokio::spawn(
            state.clone().run_pump().instrument(span.clone()),
        ))];
        if let Some(timeout) = options.liveness_timeout {
            tasks.push(ScopedTask::from(tokio::spawn(
                State::run_liveness_watchdog(Arc::downgrade(&state), timeout)
                    .instrument(span.clone()),
            )));
        }
        *state.tasks.lock() = tasks;

        Self {
            _guard: Arc::new(DisposeGuard(state.clone())),
            state,
        }
    }

    pub(crate) fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Idempotent; in-flight calls observe `Error::Closed`.
    pub fn dispose(&self, reason: impl Into<String>) {
        self.state.dispose(reason.into(), None);
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_disposed()
    }

    pub fn close_reason(&self) -> Option<Error> {
        self.is_closed().then(|| self.state.closed_error())
    }

    pub fn inflight_count(&self) -> usize {
        self.state.inc.len()
    }
}

impl std::fmt::Debug for StateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateController")
            .field("inflight", &self.inflight_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use crate::common::tests::wait_for_condition;
    use crate::proto::message::{new_call_id, MessageBody};
    use crate::tunnel::{
        ring::create_ring_tunnel_pair, transportation::TunnelTransportation, MessageSink,
        MessageStream, TransportationError, Tunnel,
    };

    use super::*;

    /// A controller on one end and the raw halves of the other end.
    fn controller_with_raw_peer(
        options: StateControllerOptions,
    ) -> (
        StateController,
        std::pin::Pin<Box<dyn MessageStream>>,
        std::pin::Pin<Box<dyn MessageSink>>,
    ) {
        let (a, b) = create_ring_tunnel_pair();
        let transport = TunnelTransportation::new(a).unwrap();
        let sc = StateController::with_transport(Box::new(transport), options);
        let (stream, sink) = b.split().unwrap();
        (sc, stream, sink)
    }

    #[tokio::test]
    async fn create_with_builder() {
        let (a, _b) = create_ring_tunnel_pair();
        let sc = StateController::create(
            |tunnel: Box<dyn Tunnel>| async move {
                Ok::<_, TransportationError>(
                    Box::new(TunnelTransportation::new(tunnel)?) as Box<dyn Transportation>
                )
            },
            a,
            StateControllerOptionsBuilder::default()
                .name("builder")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
        assert!(!sc.is_closed());
        assert_eq!(sc.inflight_count(), 0);
    }

    #[tokio::test]
    async fn unknown_heartbeat_is_echoed() {
        let (_sc, mut stream, mut sink) = controller_with_raw_peer(Default::default());
        let hb = NoMetaMessage::heartbeat();
        futures::SinkExt::send(&mut sink, hb.clone()).await.unwrap();
        let echoed = stream.next().await.unwrap().unwrap();
        assert_eq!(echoed, hb);
    }

    #[tokio::test]
    async fn unknown_type_does_not_close_connection() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let (local, mut raw) = tokio::io::duplex(4096);
        let tunnel = crate::tunnel::framed::FramedTunnel::from_duplex(local, None);
        let sc = StateController::with_transport(
            Box::new(TunnelTransportation::new(tunnel).unwrap()),
            Default::default(),
        );
        // an in-flight call sharing the id must not see the message either
        let id = new_call_id();
        let inbound = sc.state().register(id).unwrap();

        let hb = NoMetaMessage::heartbeat();
        for body in [
            serde_json::to_vec(&serde_json::json!({ "id": id, "type": "shout" })).unwrap(),
            serde_json::to_vec(&hb).unwrap(),
        ] {
            raw.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
            raw.write_all(&body).await.unwrap();
        }

        let len = tokio::time::timeout(Duration::from_secs(1), raw.read_u32())
            .await
            .unwrap()
            .unwrap();
        let mut buf = vec![0u8; len as usize];
        raw.read_exact(&mut buf).await.unwrap();
        let echoed: NoMetaMessage = serde_json::from_slice(&buf).unwrap();
        assert_eq!(echoed, hb);

        assert!(!sc.is_closed());
        assert!(inbound.queue.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_register_reports_dispose_reason() {
        let (sc, _stream, _sink) = controller_with_raw_peer(Default::default());
        let state = sc.state().clone();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let state = state.clone();
            tasks.spawn(async move {
                loop {
                    match state.register(new_call_id()) {
                        Ok(_) => tokio::task::yield_now().await,
                        Err(e) => return e,
                    }
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        sc.dispose("shutting down");

        while let Some(ret) = tasks.join_next().await {
            match ret.unwrap() {
                Error::Closed { reason, .. } => assert_eq!(reason, "shutting down"),
                e => panic!("unexpected error {:?}", e),
            }
        }
    }

    #[tokio::test]
    async fn late_messages_are_dropped() {
        let (sc, mut stream, mut sink) = controller_with_raw_peer(Default::default());
        let id = new_call_id();
        futures::SinkExt::send(&mut sink, NoMetaMessage::new(id, MessageBody::End(Ok(1.into()))))
            .await
            .unwrap();
        futures::SinkExt::send(&mut sink, NoMetaMessage::new(id, MessageBody::Cancel))
            .await
            .unwrap();
        let hb = NoMetaMessage::heartbeat();
        futures::SinkExt::send(&mut sink, hb.clone()).await.unwrap();

        // only the heartbeat comes back, and the controller is still alive
        assert_eq!(stream.next().await.unwrap().unwrap(), hb);
        assert!(!sc.is_closed());
    }

    #[tokio::test]
    async fn dispose_wakes_registered_calls() {
        let (sc, _stream, _sink) = controller_with_raw_peer(Default::default());
        let inbound = sc.state().register(new_call_id()).unwrap();
        let waiter = tokio::spawn(async move { inbound.notifier.wait().await });
        tokio::task::yield_now().await;

        sc.dispose("test over");
        sc.dispose("twice");
        let ret = waiter.await.unwrap();
        match ret {
            Err(Error::Closed { reason, .. }) => assert_eq!(reason, "test over"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(sc.state().register(new_call_id()).is_err());
        assert!(sc.state().enqueue(NoMetaMessage::heartbeat()).is_err());
    }

    #[tokio::test]
    async fn peer_close_disposes_controller() {
        let (sc, stream, sink) = controller_with_raw_peer(Default::default());
        drop(sink);
        drop(stream);
        let watched = sc.clone();
        wait_for_condition(
            || {
                let watched = watched.clone();
                async move { watched.is_closed() }
            },
            std::time::Duration::from_secs(3),
        )
        .await;
        assert!(sc.close_reason().unwrap().is_closed());
    }

    #[tokio::test]
    async fn outbound_pump_keeps_fifo_order() {
        let (sc, mut stream, _sink) = controller_with_raw_peer(Default::default());
        let sent: Vec<_> = (0..50).map(|_| NoMetaMessage::heartbeat()).collect();
        for msg in sent.iter() {
            sc.state().enqueue(msg.clone()).unwrap();
        }
        for msg in sent.iter() {
            assert_eq!(&stream.next().await.unwrap().unwrap(), msg);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_timeout_disposes_silent_connection() {
        let options = StateControllerOptionsBuilder::default()
            .liveness_timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let (sc, _stream, mut sink) = controller_with_raw_peer(options);

        // traffic keeps it alive
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            futures::SinkExt::send(&mut sink, NoMetaMessage::heartbeat())
                .await
                .unwrap();
            tokio::task::yield_now().await;
            assert!(!sc.is_closed());
        }

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        match sc.close_reason() {
            Some(Error::Closed { reason, .. }) => assert_eq!(reason, "liveness timeout"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropping_last_handle_disposes() {
        let (a, _b) = create_ring_tunnel_pair();
        let transport = TunnelTransportation::new(a).unwrap();
        let sc = StateController::with_transport(Box::new(transport), Default::default());
        let state = sc.state().clone();
        let clone = sc.clone();
        drop(sc);
        assert!(!state.is_disposed());
        drop(clone);
        assert!(state.is_disposed());
    }
}
