use std::{collections::VecDeque, sync::Arc};

use futures::{stream::BoxStream, StreamExt as _};
use tokio_util::sync::CancellationToken;

use crate::proto::message::{CallId, Message, MessageBody, NoMetaMessage};
use crate::proto::rpc_types::error::{Error, Result};

use super::state::{Inbound, State};

pub type OutboundProducer = BoxStream<'static, NoMetaMessage>;

async fn next_outbound(producer: &mut Option<OutboundProducer>) -> Option<NoMetaMessage> {
    match producer {
        Some(p) => p.next().await,
        None => futures::future::pending().await,
    }
}

async fn aborted(signal: Option<CancellationToken>) {
    match signal {
        Some(s) => s.cancelled().await,
        None => futures::future::pending().await,
    }
}

/// One in-flight call on a [`State`]: forwards the outbound producer and
/// yields the inbound messages addressed to the call id.
///
/// The sequence finishes after the first `end` (or a remote `cancel`).
/// Dropping it before that sends a `cancel` to the peer.
pub(crate) struct InternalCall {
    id: CallId,
    state: Arc<State>,
    inbound: Arc<Inbound>,
    producer: Option<OutboundProducer>,
    signal: Option<CancellationToken>,
    pending: VecDeque<Message>,
    finished: bool,
    done: bool,
}

impl InternalCall {
    /// Pull the `start` message from `producer`, register the call and queue
    /// the message. An already aborted `signal` fails before anything is sent.
    pub(crate) async fn start(
        state: Arc<State>,
        mut producer: OutboundProducer,
        signal: Option<CancellationToken>,
    ) -> Result<Self> {
        if signal.as_ref().is_some_and(|s| s.is_cancelled()) {
            return Err(Error::Aborted);
        }

        let first = producer
            .next()
            .await
            .ok_or_else(|| Error::MalformedMessage("call produced no start message".to_owned()))?;
        if !matches!(first.body, MessageBody::Start { .. }) {
            return Err(Error::MalformedMessage(format!(
                "call must begin with start, got {}",
                first.body.type_name()
            )));
        }

        let id = first.id;
        let inbound = state.register(id)?;
        let call = Self {
            id,
            state,
            inbound,
            producer: Some(producer),
            signal,
            pending: VecDeque::new(),
            finished: false,
            done: false,
        };
        call.state.enqueue(first)?;
        Ok(call)
    }

    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    fn finish(&mut self) {
        self.finished = true;
        self.done = true;
        self.pending.clear();
        self.producer = None;
        self.state.unregister(&self.id);
    }

    pub(crate) async fn next(&mut self) -> Option<Result<Message>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                if matches!(message.body, MessageBody::End(_) | MessageBody::Cancel) {
                    self.finish();
                }
                return Some(Ok(message));
            }
            if self.done {
                return None;
            }

            let signal = self.signal.clone();
            tokio::select! {
                biased;
                _ = aborted(signal) => {
                    tracing::debug!(id = %self.id, "call aborted by signal");
                    self.done = true;
                    return Some(Err(Error::Aborted));
                }
                ret = self.inbound.notifier.wait() => match ret {
                    Ok(()) => {
                        let mut queue = self.inbound.queue.lock();
                        self.pending.extend(queue.drain(..));
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                item = next_outbound(&mut self.producer) => match item {
                    Some(message) => {
                        if let Err(e) = self.state.enqueue(message) {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                    None => self.producer = None,
                },
            }
        }
    }
}

impl Drop for InternalCall {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(id = %self.id, "call left before end, sending cancel");
            if let Err(e) = self
                .state
                .enqueue(NoMetaMessage::new(self.id, MessageBody::Cancel))
            {
                tracing::trace!(?e, "cancel not sent");
            }
        }
        self.state.unregister(&self.id);
    }
}
