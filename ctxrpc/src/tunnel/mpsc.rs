// wrap a tunnel sink behind an unbounded queue so senders never await

use std::pin::Pin;

use futures::SinkExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::common::scoped_task::ScopedTask;

use super::{MessageSink, SinkItem, TransportationError};

#[derive(Clone, Debug)]
pub struct MpscTunnelSender(UnboundedSender<SinkItem>);

impl MpscTunnelSender {
    pub fn send(&self, item: SinkItem) -> Result<(), TransportationError> {
        self.0.send(item).map_err(|_| TransportationError::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

pub struct MpscTunnel {
    tx: UnboundedSender<SinkItem>,
    task: ScopedTask<()>,
}

impl MpscTunnel {
    /// Spawn the forwarding task. `on_error` is called once if the sink fails.
    pub fn new<F>(mut sink: Pin<Box<dyn MessageSink>>, on_error: F) -> Self
    where
        F: FnOnce(TransportationError) + Send + 'static,
    {
        let (tx, mut rx) = unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match Self::forward_one_round(&mut rx, &mut sink).await {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = sink.close().await;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(?e, "forward error");
                        on_error(e);
                        break;
                    }
                }
            }
        });

        Self {
            tx,
            task: task.into(),
        }
    }

    /// Returns `Ok(false)` once every sender is gone.
    async fn forward_one_round(
        rx: &mut UnboundedReceiver<SinkItem>,
        sink: &mut Pin<Box<dyn MessageSink>>,
    ) -> Result<bool, TransportationError> {
        let Some(item) = rx.recv().await else {
            return Ok(false);
        };
        sink.feed(item).await?;
        while let Ok(item) = rx.try_recv() {
            sink.feed(item).await?;
        }
        sink.flush().await?;
        Ok(true)
    }

    pub fn get_sink(&self) -> MpscTunnelSender {
        MpscTunnelSender(self.tx.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
