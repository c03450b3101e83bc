use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use futures::StreamExt as _;
use parking_lot::Mutex;

use crate::common::scoped_task::ScopedTask;
use crate::proto::message::{Metadata, NoMetaMessage};

use super::{
    mpsc::{MpscTunnel, MpscTunnelSender},
    CloseCallback, MessageStream, RecvCallback, Transportation, TransportationError, Tunnel,
    TunnelInfo,
};

enum CloseState {
    Open(Option<CloseCallback>),
    Closed(Option<(String, Option<TransportationError>)>),
}

struct Inner {
    metadata: Metadata,
    closed: AtomicBool,
    close_state: Mutex<CloseState>,
    stream: Mutex<Option<Pin<Box<dyn MessageStream>>>>,
    reader: Mutex<Option<ScopedTask<()>>>,
    mpsc: Mutex<Option<MpscTunnel>>,
}

impl Inner {
    /// Marks the transport closed and fires the close callback exactly once,
    /// outside of any lock.
    fn close(&self, reason: String, error: Option<TransportationError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(%reason, ?error, "transportation closed");

        let cb = {
            let mut state = self.close_state.lock();
            match std::mem::replace(&mut *state, CloseState::Closed(None)) {
                CloseState::Open(Some(cb)) => Some((cb, reason, error)),
                CloseState::Open(None) => {
                    *state = CloseState::Closed(Some((reason, error)));
                    None
                }
                CloseState::Closed(prev) => {
                    *state = CloseState::Closed(prev);
                    None
                }
            }
        };

        // dropping the sink ends the peer's stream
        self.mpsc.lock().take();

        if let Some((cb, reason, error)) = cb {
            cb(reason, error);
        }
    }
}

/// Adapts a [`Tunnel`] to the callback-style [`Transportation`] contract.
pub struct TunnelTransportation {
    sender: MpscTunnelSender,
    inner: Arc<Inner>,
}

fn metadata_from_info(info: Option<TunnelInfo>) -> Metadata {
    let Some(info) = info else {
        return Metadata::default();
    };
    Metadata {
        tunnel_type: Some(info.tunnel_type),
        sender: info.remote_addr,
        ..Default::default()
    }
}

impl TunnelTransportation {
    pub fn new(tunnel: Box<dyn Tunnel>) -> Result<Self, TransportationError> {
        let (stream, sink) = tunnel.split()?;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let mpsc = MpscTunnel::new(sink, move |e| {
                if let Some(inner) = weak.upgrade() {
                    inner.close("send failed".to_owned(), Some(e));
                }
            });
            Inner {
                metadata: metadata_from_info(tunnel.info()),
                closed: AtomicBool::new(false),
                close_state: Mutex::new(CloseState::Open(None)),
                stream: Mutex::new(Some(stream)),
                reader: Mutex::new(None),
                mpsc: Mutex::new(Some(mpsc)),
            }
        });

        let sender = inner
            .mpsc
            .lock()
            .as_ref()
            .map(|m| m.get_sink())
            .ok_or(TransportationError::Shutdown)?;

        Ok(Self { sender, inner })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Transportation for TunnelTransportation {
    fn send(&self, message: NoMetaMessage) -> Result<(), TransportationError> {
        if self.is_closed() {
            return Err(TransportationError::Shutdown);
        }
        tracing::trace!(id = %message.id, ty = message.body.type_name(), "send message");
        self.sender.send(message)
    }

    fn on_recv(&self, cb: RecvCallback) {
        let Some(mut stream) = self.inner.stream.lock().take() else {
            tracing::warn!("recv handler already installed, ignoring");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let metadata = self.inner.metadata.clone();
        let task = tokio::spawn(async move {
            let (reason, error) = loop {
                match stream.next().await {
                    Some(Ok(message)) => {
                        tracing::trace!(id = %message.id, ty = message.body.type_name(), "recv message");
                        cb(message.with_metadata(metadata.clone()));
                    }
                    Some(Err(e)) => {
                        tracing::error!(?e, "failed to receive message");
                        break ("recv failed".to_owned(), Some(e));
                    }
                    None => break ("closed by peer".to_owned(), None),
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.close(reason, error);
            }
        });
        *self.inner.reader.lock() = Some(task.into());
    }

    fn on_close(&self, cb: CloseCallback) {
        let fire = {
            let mut state = self.inner.close_state.lock();
            match &mut *state {
                CloseState::Open(slot) => {
                    if slot.is_some() {
                        tracing::warn!("close handler already installed, replacing");
                    }
                    *slot = Some(cb);
                    None
                }
                CloseState::Closed(stored) => stored.take().map(|(reason, error)| (cb, reason, error)),
            }
        };
        if let Some((cb, reason, error)) = fire {
            cb(reason, error);
        }
    }

    fn dispose(&self) {
        self.inner.close("disposed".to_owned(), None);
        self.inner.reader.lock().take();
    }
}

impl Drop for TunnelTransportation {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc::unbounded_channel;

    use crate::common::tests::wait_for_condition;
    use crate::proto::message::{new_call_id, MessageBody};
    use crate::tunnel::ring::create_ring_tunnel_pair;

    use super::*;

    fn pair() -> (TunnelTransportation, TunnelTransportation) {
        let (a, b) = create_ring_tunnel_pair();
        (
            TunnelTransportation::new(a).unwrap(),
            TunnelTransportation::new(b).unwrap(),
        )
    }

    #[tokio::test]
    async fn messages_carry_tunnel_metadata() {
        let (a, b) = pair();
        a.send(NoMetaMessage::new(new_call_id(), MessageBody::Cancel))
            .unwrap();

        // handler installed after the message was sent, nothing is lost
        let (tx, mut rx) = unbounded_channel();
        b.on_recv(Box::new(move |m| {
            let _ = tx.send(m);
        }));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.body, MessageBody::Cancel);
        assert_eq!(got.metadata.tunnel_type.as_deref(), Some("ring"));
        assert!(got.metadata.sender.as_deref().unwrap().starts_with("ring://"));
    }

    #[tokio::test]
    async fn peer_dispose_fires_close_once() {
        let (a, b) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        b.on_close(Box::new(move |reason, _| {
            assert_eq!(reason, "closed by peer");
            f.fetch_add(1, Ordering::SeqCst);
        }));
        b.on_recv(Box::new(|_| {}));

        a.dispose();
        a.dispose();
        assert!(a.send(NoMetaMessage::heartbeat()).is_err());

        wait_for_condition(
            || {
                let fired = fired.clone();
                async move { fired.load(Ordering::SeqCst) == 1 }
            },
            std::time::Duration::from_secs(3),
        )
        .await;
        assert!(b.is_closed());
        assert!(b.send(NoMetaMessage::heartbeat()).is_err());
    }

    #[tokio::test]
    async fn late_close_handler_fires_immediately() {
        let (a, _b) = pair();
        a.dispose();

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        a.on_close(Box::new(move |reason, error| {
            assert_eq!(reason, "disposed");
            assert!(error.is_none());
            f.store(true, Ordering::SeqCst);
        }));
        assert!(fired.load(Ordering::SeqCst));
    }
}
