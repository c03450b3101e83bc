//! Transport boundary.
//!
//! The RPC core only ever talks to a [`Transportation`]: send one message,
//! get told about received messages and about the channel closing, dispose.
//! Concrete channels are expressed as [`Tunnel`]s (a message stream plus a
//! message sink) and adapted by [`transportation::TunnelTransportation`].

use std::{fmt::Debug, future::Future, pin::Pin};

use async_trait::async_trait;
use futures::{future::BoxFuture, Sink, Stream};

use crate::proto::message::{Message, NoMetaMessage};

pub mod common;
pub mod framed;
pub mod mpsc;
pub mod ring;
pub mod tcp;
pub mod transportation;

#[derive(thiserror::Error, Debug)]
pub enum TransportationError {
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("codec error: {0}")]
    CodecError(#[from] serde_json::Error),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),
    #[error("invalid addr: {0}")]
    InvalidAddr(String),

    #[error("internal error {0}")]
    InternalError(String),

    #[error("anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),

    #[error("shutdown")]
    Shutdown,
}

pub type StreamItem = Result<NoMetaMessage, TransportationError>;
pub type SinkItem = NoMetaMessage;

pub trait MessageStream: Stream<Item = StreamItem> + Send {}
impl<T> MessageStream for T where T: Stream<Item = StreamItem> + Send {}
pub trait MessageSink: Sink<SinkItem, Error = TransportationError> + Send {}
impl<T> MessageSink for T where T: Sink<SinkItem, Error = TransportationError> + Send {}

/// Describes the channel a tunnel runs over; stamped onto received messages
/// as their metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelInfo {
    pub tunnel_type: String,
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
}

pub type SplitTunnel = (Pin<Box<dyn MessageStream>>, Pin<Box<dyn MessageSink>>);

#[auto_impl::auto_impl(Box, Arc)]
pub trait Tunnel: Send + Sync {
    /// Hand out the two halves. Can only succeed once per tunnel.
    fn split(&self) -> Result<SplitTunnel, TransportationError>;
    fn info(&self) -> Option<TunnelInfo>;
}

impl Debug for dyn Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("info", &self.info())
            .finish()
    }
}

#[async_trait]
#[auto_impl::auto_impl(Box)]
pub trait TunnelListener: Send {
    async fn listen(&mut self) -> Result<(), TransportationError>;
    async fn accept(&mut self) -> Result<Box<dyn Tunnel>, TransportationError>;
    fn local_url(&self) -> url::Url;
}

#[async_trait]
#[auto_impl::auto_impl(Box, &mut)]
pub trait TunnelConnector: Send {
    async fn connect(&mut self) -> Result<Box<dyn Tunnel>, TransportationError>;
    fn remote_url(&self) -> url::Url;
}

impl Debug for dyn TunnelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnector")
            .field("remote_url", &self.remote_url())
            .finish()
    }
}

pub type RecvCallback = Box<dyn Fn(Message) + Send + Sync>;
pub type CloseCallback = Box<dyn FnOnce(String, Option<TransportationError>) + Send>;

/// The minimal contract every channel between two contexts satisfies.
pub trait Transportation: Send + Sync {
    /// Queue one message for delivery. Fails once the channel is dead.
    fn send(&self, message: NoMetaMessage) -> Result<(), TransportationError>;
    /// Install the single "message received" handler.
    fn on_recv(&self, cb: RecvCallback);
    /// Install the single "closed" handler. Fires at most once.
    fn on_close(&self, cb: CloseCallback);
    /// Idempotent, user-initiated close.
    fn dispose(&self);
}

/// Produces a connected `Transportation` from transport-specific options.
pub trait TransportBuilder<O>: Send {
    fn build(self, options: O) -> BoxFuture<'static, Result<Box<dyn Transportation>, TransportationError>>;
}

impl<O, F, Fut> TransportBuilder<O> for F
where
    F: FnOnce(O) -> Fut + Send,
    Fut: Future<Output = Result<Box<dyn Transportation>, TransportationError>> + Send + 'static,
{
    fn build(self, options: O) -> BoxFuture<'static, Result<Box<dyn Transportation>, TransportationError>> {
        Box::pin(self(options))
    }
}

/// Connect with `connector` and wrap the resulting tunnel.
pub async fn connect_transportation<C: TunnelConnector>(
    connector: &mut C,
) -> Result<Box<dyn Transportation>, TransportationError> {
    let tunnel = connector.connect().await?;
    Ok(Box::new(transportation::TunnelTransportation::new(tunnel)?))
}

pub(crate) fn check_scheme(url: &url::Url, scheme: &str) -> Result<(), TransportationError> {
    if url.scheme() != scheme {
        return Err(TransportationError::InvalidProtocol(url.scheme().to_string()));
    }
    Ok(())
}
