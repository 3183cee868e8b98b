//! Typed streams over a [`Transport`](crate::transport::Transport) call.
//!
//! Every stream follows the same one-way lifecycle:
//!
//! ```text
//! Created ──start──▶ Started ──close──▶ Closed
//!    │                  │
//!    └──────cancel──────┴──▶ Cancelled
//! ```
//!
//! Each stream owns a cancellation scope derived from the token it was
//! created with, so cancelling a connection cancels every stream opened on
//! it. Starting a stream returns a `'static` future that performs the call;
//! the caller decides whether to await or spawn it. Cancellation ends that
//! future with `Ok(())`.

pub mod collection;
mod duplex;
mod incoming;
mod outgoing;
mod queue;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use collection::OutgoingStreamCollection;
pub use duplex::DuplexStream;
pub use incoming::IncomingStream;
pub use outgoing::OutgoingStream;

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::error::SessionError;
use crate::protocol::CommandMessage;
use crate::transport::Transport;

/// Lifecycle position of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Built, call not issued yet.
    Created,
    /// Call in flight.
    Started,
    /// Ended normally; no further messages are accepted.
    Closed,
    /// Aborted through its cancellation scope.
    Cancelled,
}

/// A message that can be queued on an outbound stream.
pub trait OutboundMessage: prost::Message + Default + 'static {
    /// Reject malformed payloads before they are queued.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl OutboundMessage for CommandMessage {
    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("command name is empty".into());
        }
        Ok(())
    }
}

/// Callback invoked for every received message.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registration-ordered listener list. Notification runs on a snapshot so
/// a listener may register further listeners without deadlocking.
pub(crate) struct Listeners<T> {
    inner: Mutex<Vec<Listener<T>>>,
}

impl<T> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, listener: Listener<T>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn notify(&self, message: &T) {
        let snapshot = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &snapshot {
            listener(message);
        }
    }
}

/// State shared between a stream handle and the future driving its call.
pub(crate) struct StreamCore {
    pub(crate) method: String,
    pub(crate) transport: Arc<dyn Transport>,
    scope: CancellationSource,
    state: Mutex<StreamState>,
}

impl StreamCore {
    pub(crate) fn new(
        method: String,
        transport: Arc<dyn Transport>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            method,
            transport,
            scope: parent.child(),
            state: Mutex::new(StreamState::Created),
        })
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.scope.token()
    }

    /// Lock the state, folding in cancellation of an ancestor scope.
    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.scope.token().is_triggered()
            && matches!(*state, StreamState::Created | StreamState::Started)
        {
            *state = StreamState::Cancelled;
        }
        state
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.lock_state()
    }

    /// `Created → Started`.
    pub(crate) fn begin(&self) -> Result<(), SessionError> {
        let mut state = self.lock_state();
        match *state {
            StreamState::Created => {
                *state = StreamState::Started;
                log::debug!("stream {} started", self.method);
                Ok(())
            }
            StreamState::Started => Err(SessionError::InvalidState(format!(
                "stream {} was already started",
                self.method
            ))),
            StreamState::Closed => Err(SessionError::InvalidState(format!(
                "stream {} is closed",
                self.method
            ))),
            StreamState::Cancelled => Err(SessionError::InvalidState(format!(
                "stream {} was cancelled",
                self.method
            ))),
        }
    }

    /// Gate for queueing an outbound message.
    pub(crate) fn check_accepting(&self) -> Result<(), SessionError> {
        match self.state() {
            StreamState::Started => Ok(()),
            StreamState::Created => Err(SessionError::InvalidOperation(format!(
                "stream {} has not been started",
                self.method
            ))),
            StreamState::Closed => Err(SessionError::InvalidOperation(format!(
                "stream {} is closed",
                self.method
            ))),
            StreamState::Cancelled => Err(SessionError::InvalidState(format!(
                "stream {} was cancelled",
                self.method
            ))),
        }
    }

    /// `Created | Started → Closed`. Returns whether this call made the
    /// transition.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.lock_state();
        if matches!(*state, StreamState::Created | StreamState::Started) {
            *state = StreamState::Closed;
            true
        } else {
            false
        }
    }

    /// `Created | Started → Cancelled`, then cancel the scope.
    pub(crate) fn cancel(&self) {
        {
            let mut state =
                self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, StreamState::Created | StreamState::Started) {
                *state = StreamState::Cancelled;
            }
        }
        self.scope.cancel();
    }

    /// Stop the call without changing the recorded state.
    pub(crate) fn abort(&self) {
        self.scope.cancel();
    }
}

impl fmt::Debug for StreamCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCore")
            .field("method", &self.method)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
