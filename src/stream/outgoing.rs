//! Client-streaming sender with an ordered in-memory queue.

use std::future::Future;
use std::sync::Arc;

use super::queue::SendQueue;
use super::{OutboundMessage, StreamCore, StreamState};
use crate::cancellation::CancellationToken;
use crate::error::SessionError;
use crate::transport::Transport;

/// Queues messages and delivers them, in submission order, over one
/// client-streaming call.
///
/// Queueing is synchronous and only reports acceptance. Delivery happens
/// in the future returned by [`start_sending`](Self::start_sending), which
/// completes after [`close`](Self::close) once every accepted message has
/// been handed to the transport, or as soon as the stream is cancelled.
pub struct OutgoingStream<T: OutboundMessage> {
    core: Arc<StreamCore>,
    queue: SendQueue<T>,
}

impl<T: OutboundMessage> OutgoingStream<T> {
    /// A stream on `method` whose scope is a child of `parent`.
    pub fn new(
        method: impl Into<String>,
        transport: Arc<dyn Transport>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            core: StreamCore::new(method.into(), transport, parent),
            queue: SendQueue::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// The gRPC method this stream calls.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.core.method
    }

    /// Token observing this stream's cancellation scope.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.token()
    }

    /// Append `message` to the send queue.
    ///
    /// Fails with `InvalidOperation` before the stream is started or after
    /// it was closed, `InvalidState` once it was cancelled, and
    /// `ArgumentInvalid` if the message fails validation.
    pub fn queue_message(&self, message: T) -> Result<(), SessionError> {
        self.queue.push(&self.core, message)
    }

    /// Issue the call and return the future that drains the queue into it.
    ///
    /// The future resolves `Ok(())` when the queue was drained after
    /// [`close`](Self::close) and the server replied, or when the stream
    /// was cancelled. A second call fails with `InvalidState`.
    pub fn start_sending(
        &self,
    ) -> Result<
        impl Future<Output = Result<(), SessionError>> + Send + 'static,
        SessionError,
    > {
        self.core.begin()?;
        let requests = self.queue.requests(&self.core)?;
        let core = Arc::clone(&self.core);

        Ok(async move {
            let token = core.token();
            let result = tokio::select! {
                biased;
                () = token.cancelled() => Ok(()),
                reply = core.transport.client_streaming(&core.method, requests) => {
                    match reply {
                        Ok(_) => Ok(()),
                        Err(_) if token.is_triggered() => Ok(()),
                        Err(e) => Err(SessionError::from(e)),
                    }
                }
            };
            if token.is_triggered() {
                log::debug!("stream {} cancelled", core.method);
            } else {
                let _ = core.close();
            }
            result
        })
    }

    /// Stop accepting messages. Messages already queued are still sent,
    /// then the call's request side ends. Idempotent.
    pub fn close(&self) {
        if self.core.close() {
            log::debug!("stream {} closing", self.core.method);
        }
        self.queue.close();
    }

    /// Stop the send loop at its next suspension point. Idempotent.
    pub fn cancel(&self) {
        self.core.cancel();
    }
}

impl<T: OutboundMessage> std::fmt::Debug for OutgoingStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingStream")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}
