//! Ordered outbound queue shared by the client-streaming and duplex calls.

use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{OutboundMessage, StreamCore};
use crate::error::SessionError;
use crate::transport::OutboundStream;

/// Messages accepted by a stream but not yet handed to its call.
///
/// The receiving half is taken exactly once, when the call starts; dropping
/// the sending half ends the call's request side after the backlog.
pub(super) struct SendQueue<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T: OutboundMessage> SendQueue<T> {
    pub(super) fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Enqueue `message` if `core` is accepting and the message is valid.
    pub(super) fn push(
        &self,
        core: &StreamCore,
        message: T,
    ) -> Result<(), SessionError> {
        core.check_accepting()?;
        message.validate().map_err(SessionError::ArgumentInvalid)?;
        let closed = || {
            SessionError::InvalidOperation(format!(
                "stream {} is closed",
                core.method
            ))
        };
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        sender
            .as_ref()
            .ok_or_else(closed)?
            .send(message)
            .map_err(|_| closed())
    }

    /// The encoded request stream for the call. It ends when the queue is
    /// closed and drained, or when `core` is cancelled.
    pub(super) fn requests(
        &self,
        core: &StreamCore,
    ) -> Result<OutboundStream, SessionError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                SessionError::InvalidState(format!(
                    "stream {} was already started",
                    core.method
                ))
            })?;
        Ok(UnboundedReceiverStream::new(receiver)
            .map(|message: T| Bytes::from(message.encode_to_vec()))
            .take_until(core.token().cancelled_owned())
            .boxed())
    }

    /// Stop accepting; the backlog is still delivered.
    pub(super) fn close(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
    }
}
