//! Server-streaming receiver fanning messages out to listeners.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;

use super::{Listeners, StreamCore, StreamState};
use crate::cancellation::CancellationToken;
use crate::error::SessionError;
use crate::transport::{ByteStream, Transport};

/// One server-streaming call whose replies are decoded and handed to every
/// registered listener, in registration order, in wire arrival order.
pub struct IncomingStream<T> {
    core: Arc<StreamCore>,
    request: Bytes,
    listeners: Arc<Listeners<T>>,
}

impl<T> IncomingStream<T>
where
    T: prost::Message + Default + 'static,
{
    /// A stream on `method` that will send `request` when started.
    pub fn new(
        method: impl Into<String>,
        transport: Arc<dyn Transport>,
        parent: &CancellationToken,
        request: &impl prost::Message,
    ) -> Self {
        Self {
            core: StreamCore::new(method.into(), transport, parent),
            request: Bytes::from(request.encode_to_vec()),
            listeners: Arc::new(Listeners::new()),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Token observing this stream's cancellation scope.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.token()
    }

    /// Register a callback for every received message. Listeners added
    /// after the stream started see only later messages.
    pub fn on_message(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    /// Issue the call and return the future that pumps replies to the
    /// listeners.
    ///
    /// The future resolves `Ok(())` when the server ends the stream or the
    /// stream is cancelled or closed, and fails on transport or decode
    /// errors. A second call fails with `InvalidState`.
    pub fn start_receiving(
        &self,
    ) -> Result<
        impl Future<Output = Result<(), SessionError>> + Send + 'static,
        SessionError,
    > {
        self.core.begin()?;
        let core = Arc::clone(&self.core);
        let listeners = Arc::clone(&self.listeners);
        let request = self.request.clone();

        Ok(async move {
            let token = core.token();
            let result = tokio::select! {
                biased;
                () = token.cancelled() => Ok(()),
                pumped = pump(&core, request, &listeners) => match pumped {
                    Err(SessionError::Transport(_)) if token.is_triggered() => Ok(()),
                    other => other,
                },
            };
            if !token.is_triggered() {
                let _ = core.close();
            }
            log::debug!("stream {} finished", core.method);
            result
        })
    }

    /// Stop receiving. The pump exits at its next suspension point and the
    /// stream reports `Closed`. Idempotent.
    pub fn close(&self) {
        if self.core.close() {
            self.core.abort();
        }
    }

    /// Abort the call. Idempotent.
    pub fn cancel(&self) {
        self.core.cancel();
    }
}

async fn pump<T>(
    core: &StreamCore,
    request: Bytes,
    listeners: &Listeners<T>,
) -> Result<(), SessionError>
where
    T: prost::Message + Default,
{
    let replies = core.transport.server_streaming(&core.method, request).await?;
    deliver(replies, listeners).await
}

/// Decode every reply and hand it to `listeners` in arrival order.
pub(super) async fn deliver<T>(
    mut replies: ByteStream,
    listeners: &Listeners<T>,
) -> Result<(), SessionError>
where
    T: prost::Message + Default,
{
    while let Some(reply) = replies.next().await {
        let message = T::decode(reply?)?;
        listeners.notify(&message);
    }
    Ok(())
}

impl<T> std::fmt::Debug for IncomingStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}
