use std::sync::Arc;

use parking_lot::Mutex;

use super::{MessageSink, MessageStream, SplitTunnel, Tunnel, TransportationError, TunnelInfo};

/// Glue a reader and a writer into a `Tunnel`.
pub struct TunnelWrapper<R, W> {
    reader: Arc<Mutex<Option<R>>>,
    writer: Arc<Mutex<Option<W>>>,
    info: Option<TunnelInfo>,
}

impl<R, W> TunnelWrapper<R, W> {
    pub fn new(reader: R, writer: W, info: Option<TunnelInfo>) -> Self {
        TunnelWrapper {
            reader: Arc::new(Mutex::new(Some(reader))),
            writer: Arc::new(Mutex::new(Some(writer))),
            info,
        }
    }
}

impl<R, W> Tunnel for TunnelWrapper<R, W>
where
    R: MessageStream + 'static,
    W: MessageSink + 'static,
{
    fn split(&self) -> Result<SplitTunnel, TransportationError> {
        let reader = self.reader.lock().take();
        let writer = self.writer.lock().take();
        match (reader, writer) {
            (Some(reader), Some(writer)) => Ok((Box::pin(reader), Box::pin(writer))),
            _ => Err(TransportationError::InternalError(
                "tunnel already split".to_owned(),
            )),
        }
    }

    fn info(&self) -> Option<TunnelInfo> {
        self.info.clone()
    }
}
