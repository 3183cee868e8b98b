//! One channel to a simulation server plus the root cancellation scope of
//! everything opened over it.

use std::sync::Arc;

use bytes::Bytes;

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::error::SessionError;
use crate::options::ConnectionOptions;
use crate::stream::{DuplexStream, IncomingStream, OutboundMessage, OutgoingStream};
use crate::transport::grpc::GrpcTransport;
use crate::transport::Transport;

/// A transport channel and its root cancellation scope.
///
/// Every stream created through the connection derives its scope from the
/// connection's, so [`close`](Self::close) cascades to all of them before
/// the channel is released.
#[derive(Debug)]
pub struct Connection {
    target: String,
    transport: Arc<dyn Transport>,
    scope: CancellationSource,
    closed: tokio::sync::OnceCell<()>,
}

impl Connection {
    /// Create a lazily-connected gRPC connection to `host:port`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        host: &str,
        port: u16,
        options: &ConnectionOptions,
    ) -> Result<Self, SessionError> {
        let transport = GrpcTransport::connect_lazy(host, port, options)?;
        let target = transport.target().to_owned();
        log::info!("connection to {target} opened");
        Ok(Self::with_target(target, Arc::new(transport)))
    }

    /// [`open`](Self::open) using the endpoint in `options`.
    pub fn connect(options: &ConnectionOptions) -> Result<Self, SessionError> {
        Self::open(&options.host, options.port, options)
    }

    /// Wrap an existing transport, such as a loopback server's.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self::with_target("in-process".to_owned(), transport)
    }

    fn with_target(target: String, transport: Arc<dyn Transport>) -> Self {
        Self {
            target,
            transport,
            scope: CancellationSource::new(),
            closed: tokio::sync::OnceCell::new(),
        }
    }

    /// Human-readable endpoint, e.g. `http://localhost:38801`.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Whether [`close`](Self::close) has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.scope.is_disposed()
    }

    /// Token of the connection's root scope.
    ///
    /// Fails with `InvalidState` once the connection is closed.
    pub fn cancellation_token(&self) -> Result<CancellationToken, SessionError> {
        if self.is_closed() {
            return Err(SessionError::InvalidState(format!(
                "connection to {} is closed",
                self.target
            )));
        }
        Ok(self.scope.token())
    }

    /// Cancel every stream opened over this connection, then release the
    /// channel. Idempotent; concurrent callers all return once the single
    /// teardown has finished.
    pub async fn close(&self) {
        let _ = self
            .closed
            .get_or_init(|| async {
                log::debug!("closing connection to {}", self.target);
                self.scope.dispose();
                self.transport.close().await;
                log::info!("connection to {} closed", self.target);
            })
            .await;
    }

    /// New client-streaming stream on `method`.
    pub fn outgoing_stream<T: OutboundMessage>(
        &self,
        method: &str,
    ) -> Result<OutgoingStream<T>, SessionError> {
        let token = self.cancellation_token()?;
        Ok(OutgoingStream::new(method, self.transport(), &token))
    }

    /// New server-streaming stream on `method` that sends `request`.
    pub fn incoming_stream<T>(
        &self,
        method: &str,
        request: &impl prost::Message,
    ) -> Result<IncomingStream<T>, SessionError>
    where
        T: prost::Message + Default + 'static,
    {
        let token = self.cancellation_token()?;
        Ok(IncomingStream::new(method, self.transport(), &token, request))
    }

    /// New bidirectional stream on `method`.
    pub fn duplex_stream<Req, Resp>(
        &self,
        method: &str,
    ) -> Result<DuplexStream<Req, Resp>, SessionError>
    where
        Req: OutboundMessage,
        Resp: prost::Message + Default + 'static,
    {
        let token = self.cancellation_token()?;
        Ok(DuplexStream::new(method, self.transport(), &token))
    }

    /// One request, one reply. Resolves with `InvalidState` if the
    /// connection is closed while the call is in flight.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
    ) -> Result<Resp, SessionError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let token = self.cancellation_token()?;
        let payload = Bytes::from(request.encode_to_vec());
        tokio::select! {
            biased;
            () = token.cancelled() => Err(SessionError::InvalidState(format!(
                "connection to {} closed during {method}",
                self.target
            ))),
            reply = self.transport.unary(method, payload) => {
                Ok(Resp::decode(reply?)?)
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}
