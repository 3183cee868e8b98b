//! gRPC transport over a `tonic` channel.
//!
//! Payloads cross this layer already encoded, so calls use a pass-through
//! codec instead of generated service stubs: any method path can be invoked
//! with any `prost` message the caller encoded.

use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use futures::StreamExt;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

use super::{ByteStream, OutboundStream, Transport, TransportError};
use crate::options::ConnectionOptions;

/// A lazily-connected gRPC channel to one `host:port`.
#[derive(Debug)]
pub struct GrpcTransport {
    target: String,
    channel: Mutex<Option<Channel>>,
}

impl GrpcTransport {
    /// Build the channel without connecting; the first call connects.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect_lazy(
        host: &str,
        port: u16,
        options: &ConnectionOptions,
    ) -> Result<Self, TransportError> {
        let target = format!("http://{host}:{port}");
        let mut endpoint = Endpoint::from_shared(target.clone())?
            .connect_timeout(Duration::from_millis(options.connect_timeout_ms))
            .tcp_nodelay(true);
        if options.keep_alive_interval_ms > 0 {
            endpoint = endpoint
                .http2_keep_alive_interval(Duration::from_millis(
                    options.keep_alive_interval_ms,
                ))
                .keep_alive_while_idle(true);
        }
        log::debug!("gRPC channel to {target} created (lazy)");
        Ok(Self {
            target,
            channel: Mutex::new(Some(endpoint.connect_lazy())),
        })
    }

    /// The `http://host:port` URI this transport targets.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    async fn client(&self) -> Result<Grpc<Channel>, TransportError> {
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)?;
        let mut grpc = Grpc::new(channel);
        grpc.ready().await?;
        Ok(grpc)
    }
}

fn parse_path(method: &str) -> Result<PathAndQuery, TransportError> {
    PathAndQuery::from_str(method)
        .map_err(|_| TransportError::InvalidMethod(method.to_owned()))
}

fn into_byte_stream(inbound: tonic::Streaming<Bytes>) -> ByteStream {
    inbound
        .map(|item| item.map_err(TransportError::Status))
        .boxed()
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn unary(
        &self,
        method: &str,
        request: Bytes,
    ) -> Result<Bytes, TransportError> {
        let path = parse_path(method)?;
        let mut grpc = self.client().await?;
        let reply = grpc.unary(Request::new(request), path, RawCodec).await?;
        Ok(reply.into_inner())
    }

    async fn server_streaming(
        &self,
        method: &str,
        request: Bytes,
    ) -> Result<ByteStream, TransportError> {
        let path = parse_path(method)?;
        let mut grpc = self.client().await?;
        let reply = grpc
            .server_streaming(Request::new(request), path, RawCodec)
            .await?;
        Ok(into_byte_stream(reply.into_inner()))
    }

    async fn client_streaming(
        &self,
        method: &str,
        requests: OutboundStream,
    ) -> Result<Bytes, TransportError> {
        let path = parse_path(method)?;
        let mut grpc = self.client().await?;
        let reply = grpc
            .client_streaming(Request::new(requests), path, RawCodec)
            .await?;
        Ok(reply.into_inner())
    }

    async fn duplex(
        &self,
        method: &str,
        requests: OutboundStream,
    ) -> Result<ByteStream, TransportError> {
        let path = parse_path(method)?;
        let mut grpc = self.client().await?;
        let reply = grpc
            .streaming(Request::new(requests), path, RawCodec)
            .await?;
        Ok(into_byte_stream(reply.into_inner()))
    }

    async fn close(&self) {
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if channel.is_some() {
            log::debug!("gRPC channel to {} released", self.target);
        }
    }
}

/// Codec that moves already-encoded message bodies through unchanged.
#[derive(Debug, Clone, Copy, Default)]
struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = Self;
    type Decoder = Self;

    fn encoder(&mut self) -> Self::Encoder {
        Self
    }

    fn decoder(&mut self) -> Self::Decoder {
        Self
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_paths_must_be_absolute() {
        assert!(parse_path("/pkg.Service/Method").is_ok());
        assert!(matches!(
            parse_path("not a path"),
            Err(TransportError::InvalidMethod(_))
        ));
    }

    #[tokio::test]
    async fn closed_transport_rejects_calls() {
        let transport = GrpcTransport::connect_lazy(
            "127.0.0.1",
            1,
            &ConnectionOptions::default(),
        )
        .unwrap();
        assert_eq!(transport.target(), "http://127.0.0.1:1");

        transport.close().await;
        let result = transport.unary("/pkg.Service/Method", Bytes::new()).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
