//! In-memory paired tunnels, the in-process analogue of an iframe
//! `MessageChannel`: two ends, each delivering to the other in order.

use std::{
    collections::HashMap,
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{Sink, Stream};
use once_cell::sync::Lazy;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::{
    check_scheme, common::TunnelWrapper, SinkItem, StreamItem, TransportationError, Tunnel,
    TunnelConnector, TunnelInfo, TunnelListener,
};

pub struct RingStream {
    id: Uuid,
    rx: UnboundedReceiver<SinkItem>,
}

impl Stream for RingStream {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|item| item.map(Ok))
    }
}

impl Debug for RingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingStream")
            .field("id", &self.id)
            .field("len", &self.rx.len())
            .finish()
    }
}

pub struct RingSink {
    id: Uuid,
    tx: Option<UnboundedSender<SinkItem>>,
}

impl Sink<SinkItem> for RingSink {
    type Error = TransportationError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &self.tx {
            Some(tx) if !tx.is_closed() => Poll::Ready(Ok(())),
            _ => Poll::Ready(Err(TransportationError::Shutdown)),
        }
    }

    fn start_send(self: Pin<&mut Self>, item: SinkItem) -> Result<(), Self::Error> {
        let Some(tx) = &self.tx else {
            return Err(TransportationError::Shutdown);
        };
        tx.send(item).map_err(|_| TransportationError::Shutdown)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().tx.take();
        Poll::Ready(Ok(()))
    }
}

impl Debug for RingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingSink")
            .field("id", &self.id)
            .field("closed", &self.tx.is_none())
            .finish()
    }
}

fn ring_url(id: &Uuid) -> String {
    format!("ring://{}", id)
}

fn ring_end(
    local: Uuid,
    remote: Uuid,
    rx: UnboundedReceiver<SinkItem>,
    tx: UnboundedSender<SinkItem>,
) -> Box<dyn Tunnel> {
    Box::new(TunnelWrapper::new(
        RingStream { id: local, rx },
        RingSink {
            id: remote,
            tx: Some(tx),
        },
        Some(TunnelInfo {
            tunnel_type: "ring".to_owned(),
            local_addr: Some(ring_url(&local)),
            remote_addr: Some(ring_url(&remote)),
        }),
    ))
}

fn create_ring_tunnel_pair_with_id(
    server_id: Uuid,
    client_id: Uuid,
) -> (Box<dyn Tunnel>, Box<dyn Tunnel>) {
    let (to_server, server_rx) = unbounded_channel();
    let (to_client, client_rx) = unbounded_channel();
    (
        ring_end(server_id, client_id, server_rx, to_client),
        ring_end(client_id, server_id, client_rx, to_server),
    )
}

/// Returns `(server_end, client_end)`.
pub fn create_ring_tunnel_pair() -> (Box<dyn Tunnel>, Box<dyn Tunnel>) {
    create_ring_tunnel_pair_with_id(Uuid::new_v4(), Uuid::new_v4())
}

static CONNECTION_MAP: Lazy<parking_lot::Mutex<HashMap<Uuid, UnboundedSender<Box<dyn Tunnel>>>>> =
    Lazy::new(|| parking_lot::Mutex::new(HashMap::new()));

fn get_addr(url: &url::Url) -> Result<Uuid, TransportationError> {
    check_scheme(url, "ring")?;
    url.host_str()
        .and_then(|h| Uuid::parse_str(h).ok())
        .ok_or_else(|| TransportationError::InvalidAddr(url.to_string()))
}

#[derive(Debug)]
pub struct RingTunnelListener {
    listener_addr: url::Url,
    conn_sender: UnboundedSender<Box<dyn Tunnel>>,
    conn_receiver: UnboundedReceiver<Box<dyn Tunnel>>,
}

impl RingTunnelListener {
    pub fn new(key: url::Url) -> Self {
        let (conn_sender, conn_receiver) = unbounded_channel();
        RingTunnelListener {
            listener_addr: key,
            conn_sender,
            conn_receiver,
        }
    }
}

impl Drop for RingTunnelListener {
    fn drop(&mut self) {
        if let Ok(addr) = get_addr(&self.listener_addr) {
            CONNECTION_MAP.lock().remove(&addr);
        }
    }
}

#[async_trait]
impl TunnelListener for RingTunnelListener {
    async fn listen(&mut self) -> Result<(), TransportationError> {
        tracing::info!("listen new conn of key: {}", self.listener_addr);
        CONNECTION_MAP
            .lock()
            .insert(get_addr(&self.listener_addr)?, self.conn_sender.clone());
        Ok(())
    }

    async fn accept(&mut self) -> Result<Box<dyn Tunnel>, TransportationError> {
        match self.conn_receiver.recv().await {
            Some(tunnel) => {
                tracing::info!("accept new conn of key: {}", self.listener_addr);
                Ok(tunnel)
            }
            None => Err(TransportationError::InternalError(
                "conn receiver stopped".to_owned(),
            )),
        }
    }

    fn local_url(&self) -> url::Url {
        self.listener_addr.clone()
    }
}

pub struct RingTunnelConnector {
    remote_addr: url::Url,
}

impl RingTunnelConnector {
    pub fn new(remote_addr: url::Url) -> Self {
        RingTunnelConnector { remote_addr }
    }
}

#[async_trait]
impl TunnelConnector for RingTunnelConnector {
    async fn connect(&mut self) -> Result<Box<dyn Tunnel>, TransportationError> {
        let remote_addr = get_addr(&self.remote_addr)?;
        let entry = CONNECTION_MAP
            .lock()
            .get(&remote_addr)
            .cloned()
            .ok_or_else(|| TransportationError::InvalidAddr(self.remote_addr.to_string()))?;
        tracing::info!(remote = %self.remote_addr, "connecting");
        let (server, client) = create_ring_tunnel_pair_with_id(remote_addr, Uuid::new_v4());
        entry.send(server).map_err(|_| {
            TransportationError::InternalError("send conn to listener failed".to_owned())
        })?;
        Ok(client)
    }

    fn remote_url(&self) -> url::Url {
        self.remote_addr.clone()
    }
}
