use std::{
    future::IntoFuture,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    FutureExt as _, Stream, StreamExt as _,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::config::RpcConfig;
use crate::proto::message::{new_call_id, MessageBody, NoMetaMessage};
use crate::proto::rpc_types::error::{Error, Result};
use crate::tunnel::{connect_transportation, TunnelConnector};

use super::{
    call::InternalCall,
    state::{State, StateController},
};

/// Caller-side proxy. Any method name can be invoked; whether it exists is
/// only known once the remote answers.
#[derive(Clone, Debug)]
pub struct Client {
    state: StateController,
}

impl Client {
    pub fn new(state: StateController) -> Self {
        Self { state }
    }

    /// Prepare a call of `method` with positional `args`. Nothing is sent
    /// until the returned value is awaited or streamed.
    pub fn call<T>(&self, method: impl Into<String>, args: Vec<Value>) -> PendingCall<T> {
        self.pending(method.into(), Ok(args))
    }

    /// Like [`Client::call`], with the arguments given as a tuple, e.g.
    /// `(name, 3)`; `()` means no arguments. A serialization failure is
    /// reported when the call is awaited.
    pub fn call_with<T, A: Serialize>(&self, method: impl Into<String>, args: A) -> PendingCall<T> {
        let args = match serde_json::to_value(&args) {
            Ok(Value::Array(args)) => Ok(args),
            Ok(Value::Null) => Ok(vec![]),
            Ok(other) => Ok(vec![other]),
            Err(e) => Err(Error::from(e)),
        };
        self.pending(method.into(), args)
    }

    fn pending<T>(&self, method: String, args: Result<Vec<Value>>) -> PendingCall<T> {
        PendingCall {
            state: self.state.state().clone(),
            method,
            args,
            signal: None,
            _marker: PhantomData,
        }
    }

    pub fn state(&self) -> &StateController {
        &self.state
    }

    pub fn inflight_count(&self) -> usize {
        self.state.inflight_count()
    }

    pub fn close(&self) {
        self.state.dispose("client closed");
    }
}

/// A call that has not been started yet.
///
/// Awaiting it runs the call in unary mode: progress is ignored and the
/// `end` value is the result. [`PendingCall::into_stream`] runs it in
/// streaming mode instead.
#[must_use = "a call does nothing unless awaited or streamed"]
pub struct PendingCall<T> {
    state: Arc<State>,
    method: String,
    args: Result<Vec<Value>>,
    signal: Option<CancellationToken>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for PendingCall<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("signal", &self.signal)
            .finish()
    }
}

impl<T> PendingCall<T> {
    /// Abort the call when `signal` is cancelled.
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    async fn start(self) -> Result<InternalCall> {
        let Self {
            state,
            method,
            args,
            signal,
            ..
        } = self;
        let args = args?;
        // the id is only drawn once the call actually starts
        let producer = stream::once(async move { NoMetaMessage::start(new_call_id(), method, args) })
            .boxed();
        InternalCall::start(state, producer, signal).await
    }
}

impl<T: DeserializeOwned + Send + 'static> PendingCall<T> {
    pub fn into_stream(self) -> CallStream<T> {
        CallStream::new(self)
    }
}

impl<T: DeserializeOwned + Send + 'static> IntoFuture for PendingCall<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        let span = tracing::debug_span!("unary_call", method = %self.method);
        async move {
            let mut call = self.start().await?;
            while let Some(message) = call.next().await {
                match message?.body {
                    MessageBody::End(Ok(value)) => return Ok(serde_json::from_value(value)?),
                    MessageBody::End(Err(e)) => return Err(Error::Remote(e)),
                    MessageBody::Cancel => return Err(Error::Cancelled),
                    MessageBody::Progress { .. } | MessageBody::Heartbeat | MessageBody::Unknown => {}
                    MessageBody::Start { .. } => {
                        tracing::warn!(id = %call.id(), "unexpected start message for call");
                    }
                }
            }
            Err(Error::closed("call finished without end"))
        }
        .instrument(span)
        .boxed()
    }
}

enum StreamState<T> {
    Pending(PendingCall<T>),
    Running(InternalCall),
    Done,
}

/// Progress values of a streaming call.
///
/// Ends cleanly on a successful `end`; a remote error, an abort or a closed
/// connection is yielded once as the last item. Dropping the stream before
/// it ends cancels the call.
#[must_use = "streams do nothing unless polled"]
pub struct CallStream<T> {
    inner: BoxStream<'static, Result<T>>,
}

impl<T: DeserializeOwned + Send + 'static> CallStream<T> {
    fn new(pending: PendingCall<T>) -> Self {
        let inner = stream::unfold(StreamState::Pending(pending), |st| async move {
            let mut call = match st {
                StreamState::Pending(pending) => match pending.start().await {
                    Ok(call) => call,
                    Err(e) => return Some((Err(e), StreamState::Done)),
                },
                StreamState::Running(call) => call,
                StreamState::Done => return None,
            };

            loop {
                let message = match call.next().await? {
                    Ok(message) => message,
                    Err(e) => return Some((Err(e), StreamState::Done)),
                };
                match message.body {
                    MessageBody::Progress { payload } => {
                        return Some(match serde_json::from_value::<T>(payload) {
                            Ok(v) => (Ok(v), StreamState::Running(call)),
                            Err(e) => (Err(Error::from(e)), StreamState::Done),
                        });
                    }
                    MessageBody::End(Ok(_)) => return None,
                    MessageBody::End(Err(e)) => {
                        return Some((Err(Error::Remote(e)), StreamState::Done))
                    }
                    MessageBody::Cancel => return Some((Err(Error::Cancelled), StreamState::Done)),
                    MessageBody::Heartbeat | MessageBody::Unknown => {}
                    MessageBody::Start { .. } => {
                        tracing::warn!(id = %call.id(), "unexpected start message for call");
                    }
                }
            }
        })
        .fuse()
        .boxed();
        Self { inner }
    }

    /// Stop consuming; the remote is told to cancel if the call is still
    /// running.
    pub fn cancel(self) {
        drop(self.inner);
    }
}

impl<T> Stream for CallStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Declare a typed client for a remote service.
///
/// ```ignore
/// ctxrpc::rpc_client! {
///     pub struct TabsClient {
///         fn ping() -> String;
///         fn get_tab(id: u32) -> Tab = "getTab";
///         fn watch(filter: String) -> TabEvent;
///     }
/// }
/// ```
///
/// Every method returns a [`PendingCall`]: await it for the final value or
/// call `into_stream()` to read progress. The wire name defaults to the
/// Rust name and can be overridden with `= "name"`.
#[macro_export]
macro_rules! rpc_client {
    (@wire $method:ident) => { stringify!($method) };
    (@wire $method:ident $wire:literal) => { $wire };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fn_meta:meta])*
                fn $method:ident($($arg:ident: $arg_ty:ty),* $(,)?) -> $ret:ty $(= $wire:literal)?;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        $vis struct $name {
            client: $crate::proto::rpc_impl::client::Client,
        }

        impl $name {
            pub fn new(client: $crate::proto::rpc_impl::client::Client) -> Self {
                Self { client }
            }

            pub fn client(&self) -> &$crate::proto::rpc_impl::client::Client {
                &self.client
            }

            $(
                $(#[$fn_meta])*
                pub fn $method(&self, $($arg: $arg_ty),*)
                    -> $crate::proto::rpc_impl::client::PendingCall<$ret>
                {
                    self.client.call_with(
                        $crate::rpc_client!(@wire $method $($wire)?),
                        ($($arg,)*),
                    )
                }
            )*
        }
    };
}

/// Client that (re)connects through a [`TunnelConnector`] on demand.
pub struct StandAloneClient<C: TunnelConnector> {
    connector: C,
    config: RpcConfig,
    state: Option<StateController>,
}

impl<C: TunnelConnector> StandAloneClient<C> {
    pub fn new(connector: C) -> Self {
        Self::with_config(connector, RpcConfig::default())
    }

    pub fn with_config(connector: C, config: RpcConfig) -> Self {
        Self {
            connector,
            config,
            state: None,
        }
    }

    async fn connect(&mut self) -> Result<StateController> {
        let transport = connect_transportation(&mut self.connector).await?;
        Ok(StateController::with_transport(
            transport,
            (&self.config).into(),
        ))
    }

    /// A client on the current connection, reconnecting first if it was
    /// never made or has closed.
    pub async fn client(&mut self) -> Result<Client> {
        let reuse = self.state.as_ref().is_some_and(|s| !s.is_closed());
        if !reuse {
            tracing::info!(url = %self.connector.remote_url(), "connect rpc client");
            self.state = Some(self.connect().await?);
        }
        match &self.state {
            Some(state) => Ok(Client::new(state.clone())),
            None => Err(Error::closed("not connected")),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.is_closed())
    }
}
