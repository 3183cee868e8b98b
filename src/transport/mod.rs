//! The RPC boundary the session layer is built on.
//!
//! [`Transport`] exposes the four gRPC call shapes over already-encoded
//! payloads, so streams and sessions never depend on a particular channel
//! implementation. [`grpc::GrpcTransport`] speaks HTTP/2 gRPC through
//! `tonic`; [`loopback::LoopbackServer`] answers calls in-process and is
//! what the test suite and demos run against.

pub mod grpc;
pub mod loopback;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Inbound message stream returned by streaming calls.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Outbound message stream handed to client-streaming and duplex calls.
/// The call's request side ends when this stream ends.
pub type OutboundStream = BoxStream<'static, Bytes>;

/// Call invocation over one channel. `method` is a full gRPC path such as
/// `/package.Service/Method`.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Single request, single reply.
    async fn unary(
        &self,
        method: &str,
        request: Bytes,
    ) -> Result<Bytes, TransportError>;

    /// Single request, stream of replies.
    async fn server_streaming(
        &self,
        method: &str,
        request: Bytes,
    ) -> Result<ByteStream, TransportError>;

    /// Stream of requests, single reply. Resolves once the server replies,
    /// which for a well-behaved server is after `requests` has ended.
    async fn client_streaming(
        &self,
        method: &str,
        requests: OutboundStream,
    ) -> Result<Bytes, TransportError>;

    /// Stream of requests and stream of replies over one call.
    async fn duplex(
        &self,
        method: &str,
        requests: OutboundStream,
    ) -> Result<ByteStream, TransportError>;

    /// Release the channel. Later calls fail with
    /// [`TransportError::Closed`].
    async fn close(&self);
}

/// Failures raised by a [`Transport`].
#[derive(Debug)]
pub enum TransportError {
    /// The remote end (or the RPC layer) answered with a gRPC status.
    Status(tonic::Status),
    /// The channel could not be created or connected.
    Connect(tonic::transport::Error),
    /// The method path is not a valid URI path.
    InvalidMethod(String),
    /// The transport was closed before or during the call.
    Closed,
}

impl TransportError {
    /// Whether the server reported the method as not implemented.
    #[must_use]
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Status(s) if s.code() == tonic::Code::Unimplemented)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(
                f,
                "rpc failed with {:?}: {}",
                status.code(),
                status.message()
            ),
            Self::Connect(e) => write!(f, "channel error: {e}"),
            Self::InvalidMethod(method) => {
                write!(f, "invalid method path: {method}")
            }
            Self::Closed => write!(f, "transport is closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Status(e) => Some(e),
            Self::Connect(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        Self::Status(status)
    }
}

impl From<tonic::transport::Error> for TransportError {
    fn from(e: tonic::transport::Error) -> Self {
        Self::Connect(e)
    }
}
