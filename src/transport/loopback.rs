//! In-process server answering [`Transport`] calls without a network.
//!
//! Handlers are registered per method path with typed `prost` messages; the
//! loopback encodes and decodes exactly as a real channel would, so session
//! code runs unchanged against it. Unregistered methods answer
//! `Unimplemented`.
//!
//! ```
//! use molsync::protocol::{CommandMessage, CommandReply};
//! use molsync::transport::loopback::LoopbackServer;
//! use molsync::transport::TransportError;
//!
//! let server = LoopbackServer::new();
//! server.on_unary("/demo.Command/Run", |_request: CommandMessage| async {
//!     Ok::<_, TransportError>(CommandReply::default())
//! });
//! let transport = server.transport();
//! # drop(transport);
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use rustc_hash::FxHashMap;

use super::{ByteStream, OutboundStream, Transport, TransportError};

type UnaryHandler = Arc<
    dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, TransportError>>
        + Send
        + Sync,
>;
type ServerStreamingHandler =
    Arc<dyn Fn(Bytes) -> Result<ByteStream, TransportError> + Send + Sync>;
type ClientStreamingHandler = Arc<
    dyn Fn(OutboundStream) -> BoxFuture<'static, Result<Bytes, TransportError>>
        + Send
        + Sync,
>;
type DuplexHandler = Arc<dyn Fn(OutboundStream) -> ByteStream + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Unary(UnaryHandler),
    ServerStreaming(ServerStreamingHandler),
    ClientStreaming(ClientStreamingHandler),
    Duplex(DuplexHandler),
}

/// Method table shared by every [`LoopbackTransport`] it hands out.
#[derive(Default)]
pub struct LoopbackServer {
    handlers: Mutex<FxHashMap<String, Handler>>,
    calls: Mutex<FxHashMap<String, usize>>,
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods: Vec<String> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("LoopbackServer")
            .field("methods", &methods)
            .finish()
    }
}

fn decode<M: prost::Message + Default>(
    bytes: Bytes,
) -> Result<M, TransportError> {
    M::decode(bytes).map_err(|e| {
        TransportError::Status(tonic::Status::invalid_argument(e.to_string()))
    })
}

fn encode<M: prost::Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

/// Decode an outbound byte stream into typed requests, dropping (and
/// logging) anything that fails to decode.
fn typed_requests<M>(requests: OutboundStream) -> BoxStream<'static, M>
where
    M: prost::Message + Default + 'static,
{
    requests
        .filter_map(|bytes| async move {
            match M::decode(bytes) {
                Ok(message) => Some(message),
                Err(e) => {
                    log::warn!("loopback dropped undecodable request: {e}");
                    None
                }
            }
        })
        .boxed()
}

impl LoopbackServer {
    /// Empty method table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport whose calls are answered by this server.
    #[must_use]
    pub fn transport(self: &Arc<Self>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            server: Arc::clone(self),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        })
    }

    fn register(&self, method: &str, handler: Handler) {
        drop(
            self.handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(method.to_owned(), handler),
        );
    }

    /// Answer `method` with a single reply.
    pub fn on_unary<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, TransportError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            method,
            Handler::Unary(Arc::new(move |bytes: Bytes| {
                let handler = Arc::clone(&handler);
                async move {
                    let request = decode::<Req>(bytes)?;
                    let reply = (*handler)(request).await?;
                    Ok::<_, TransportError>(encode(&reply))
                }
                .boxed()
            })),
        );
    }

    /// Answer `method` with the stream `handler` returns. The call ends
    /// when that stream ends.
    pub fn on_server_streaming<Req, Resp, F, S>(&self, method: &str, handler: F)
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Resp> + Send + 'static,
    {
        self.register(
            method,
            Handler::ServerStreaming(Arc::new(
                move |bytes: Bytes| -> Result<ByteStream, TransportError> {
                    let request = decode::<Req>(bytes)?;
                    Ok(handler(request)
                        .map(|reply| Ok::<_, TransportError>(encode(&reply)))
                        .boxed())
                },
            )),
        );
    }

    /// Consume the request stream of `method` and reply once.
    pub fn on_client_streaming<Req, Resp, F, Fut>(
        &self,
        method: &str,
        handler: F,
    ) where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(BoxStream<'static, Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, TransportError>> + Send + 'static,
    {
        self.register(
            method,
            Handler::ClientStreaming(Arc::new(move |requests: OutboundStream| {
                let reply = handler(typed_requests::<Req>(requests));
                async move { Ok::<_, TransportError>(encode(&reply.await?)) }
                    .boxed()
            })),
        );
    }

    /// Map the request stream of `method` to a reply stream.
    pub fn on_duplex<Req, Resp, F, S>(&self, method: &str, handler: F)
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(BoxStream<'static, Req>) -> S + Send + Sync + 'static,
        S: Stream<Item = Resp> + Send + 'static,
    {
        self.register(
            method,
            Handler::Duplex(Arc::new(move |requests: OutboundStream| {
                handler(typed_requests::<Req>(requests))
                    .map(|reply| Ok::<_, TransportError>(encode(&reply)))
                    .boxed()
            })),
        );
    }

    /// Number of calls received on `method` so far.
    #[must_use]
    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    fn dispatch(&self, method: &str) -> Result<Handler, TransportError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.to_owned())
            .or_insert(0) += 1;
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
            .ok_or_else(|| {
                TransportError::Status(tonic::Status::unimplemented(format!(
                    "no loopback handler for {method}"
                )))
            })
    }
}

/// Client side of a [`LoopbackServer`].
#[derive(Debug)]
pub struct LoopbackTransport {
    server: Arc<LoopbackServer>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl LoopbackTransport {
    /// How many times [`Transport::close`] actually released the transport.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    fn handler(&self, method: &str) -> Result<Handler, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.server.dispatch(method)
    }
}

fn wrong_shape(method: &str) -> TransportError {
    TransportError::Status(tonic::Status::unimplemented(format!(
        "{method} is registered with a different call shape"
    )))
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn unary(
        &self,
        method: &str,
        request: Bytes,
    ) -> Result<Bytes, TransportError> {
        match self.handler(method)? {
            Handler::Unary(handler) => handler(request).await,
            _ => Err(wrong_shape(method)),
        }
    }

    async fn server_streaming(
        &self,
        method: &str,
        request: Bytes,
    ) -> Result<ByteStream, TransportError> {
        match self.handler(method)? {
            Handler::ServerStreaming(handler) => handler(request),
            _ => Err(wrong_shape(method)),
        }
    }

    async fn client_streaming(
        &self,
        method: &str,
        requests: OutboundStream,
    ) -> Result<Bytes, TransportError> {
        match self.handler(method)? {
            Handler::ClientStreaming(handler) => handler(requests).await,
            _ => Err(wrong_shape(method)),
        }
    }

    async fn duplex(
        &self,
        method: &str,
        requests: OutboundStream,
    ) -> Result<ByteStream, TransportError> {
        match self.handler(method)? {
            Handler::Duplex(handler) => Ok(handler(requests)),
            _ => Err(wrong_shape(method)),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.close_count.fetch_add(1, Ordering::AcqRel);
        }
    }
}
