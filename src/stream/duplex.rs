//! Bidirectional stream: an ordered send queue and reply listeners over
//! one call.

use std::future::Future;
use std::sync::Arc;

use super::incoming::deliver;
use super::queue::SendQueue;
use super::{Listeners, OutboundMessage, StreamCore, StreamState};
use crate::cancellation::CancellationToken;
use crate::error::SessionError;
use crate::transport::Transport;

/// Sends `Req` messages and receives `Resp` messages on one duplex call.
///
/// Queueing follows the rules of
/// [`OutgoingStream`](super::OutgoingStream); replies reach listeners the
/// way they do on an [`IncomingStream`](super::IncomingStream).
/// [`close`](Self::close) ends only the request side: replies keep flowing
/// until the server ends the call.
pub struct DuplexStream<Req: OutboundMessage, Resp> {
    core: Arc<StreamCore>,
    queue: SendQueue<Req>,
    listeners: Arc<Listeners<Resp>>,
}

impl<Req, Resp> DuplexStream<Req, Resp>
where
    Req: OutboundMessage,
    Resp: prost::Message + Default + 'static,
{
    /// A duplex stream on `method` whose scope is a child of `parent`.
    pub fn new(
        method: impl Into<String>,
        transport: Arc<dyn Transport>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            core: StreamCore::new(method.into(), transport, parent),
            queue: SendQueue::new(),
            listeners: Arc::new(Listeners::new()),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Register a callback for every reply.
    pub fn on_message(&self, listener: impl Fn(&Resp) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    /// Append `message` to the send queue. Same failure rules as
    /// [`OutgoingStream::queue_message`](super::OutgoingStream::queue_message).
    pub fn queue_message(&self, message: Req) -> Result<(), SessionError> {
        self.queue.push(&self.core, message)
    }

    /// Issue the call and return the future that drives both directions.
    ///
    /// Resolves `Ok(())` once the server ends the reply stream or the
    /// stream is cancelled.
    pub fn start(
        &self,
    ) -> Result<
        impl Future<Output = Result<(), SessionError>> + Send + 'static,
        SessionError,
    > {
        self.core.begin()?;
        let requests = self.queue.requests(&self.core)?;
        let core = Arc::clone(&self.core);
        let listeners = Arc::clone(&self.listeners);

        Ok(async move {
            let token = core.token();
            let exchange = async {
                let replies = core.transport.duplex(&core.method, requests).await?;
                deliver(replies, &listeners).await
            };
            let result = tokio::select! {
                biased;
                () = token.cancelled() => Ok(()),
                exchanged = exchange => match exchanged {
                    Err(SessionError::Transport(_)) if token.is_triggered() => Ok(()),
                    other => other,
                },
            };
            if !token.is_triggered() {
                let _ = core.close();
            }
            result
        })
    }

    /// End the request side once queued messages are sent. Idempotent.
    pub fn close(&self) {
        if self.core.close() {
            log::debug!("stream {} half-closed", self.core.method);
        }
        self.queue.close();
    }

    /// Abort both directions. Idempotent.
    pub fn cancel(&self) {
        self.core.cancel();
    }
}

impl<Req: OutboundMessage, Resp> std::fmt::Debug for DuplexStream<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}
