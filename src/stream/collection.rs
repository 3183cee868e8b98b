//! Keyed registry of outgoing streams, at most one live stream per key.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;

use super::{OutboundMessage, OutgoingStream};
use crate::error::SessionError;

/// How long an ended stream may take to drain before it is cancelled.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Builds the stream for a key. Called with the registry lock held, so it
/// must not block.
pub type StreamFactory<T> =
    Box<dyn Fn(&str) -> Result<OutgoingStream<T>, SessionError> + Send + Sync>;

struct Entry<T: OutboundMessage> {
    stream: Arc<OutgoingStream<T>>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl<T: OutboundMessage> Entry<T> {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Outgoing streams addressed by string key.
///
/// Registry operations are serialized by one lock. Each stream's send task
/// runs independently, so a failure on one key never affects another; a
/// key whose task has ended counts as absent and is replaced by the next
/// [`start_stream`](Self::start_stream).
///
/// Ending a stream closes its queue and waits up to the drain timeout for
/// the call to finish; a call still running after that is cancelled.
pub struct OutgoingStreamCollection<T: OutboundMessage> {
    factory: StreamFactory<T>,
    drain_timeout: Duration,
    streams: Mutex<FxHashMap<String, Entry<T>>>,
    ending: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: OutboundMessage> OutgoingStreamCollection<T> {
    /// Empty collection creating streams with `factory`.
    pub fn new(
        factory: impl Fn(&str) -> Result<OutgoingStream<T>, SessionError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            streams: Mutex::new(FxHashMap::default()),
            ending: Mutex::new(Vec::new()),
        }
    }

    /// Replace the drain timeout.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Entry<T>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a live stream exists for `key`.
    #[must_use]
    pub fn has_stream(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(Entry::is_live)
    }

    /// Keys with a live stream.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Ensure a started stream exists for `key`. Idempotent: concurrent
    /// callers with the same key create exactly one stream.
    ///
    /// Must be called from within a Tokio runtime; the send task is
    /// spawned onto it.
    pub fn start_stream(&self, key: &str) -> Result<(), SessionError> {
        let mut streams = self.lock();
        if streams.get(key).is_some_and(Entry::is_live) {
            return Ok(());
        }

        let stream = Arc::new((self.factory)(key)?);
        let sending = stream.start_sending()?;
        let label = key.to_owned();
        let task = tokio::spawn(async move {
            let result = sending.await;
            if let Err(e) = &result {
                log::warn!("outgoing stream '{label}' failed: {e}");
            }
            result
        });
        log::debug!("outgoing stream '{key}' started");
        drop(streams.insert(key.to_owned(), Entry { stream, task }));
        Ok(())
    }

    /// Queue `message` on the stream for `key`.
    ///
    /// Fails with `InvalidOperation` when no stream exists for the key.
    pub fn queue_message(&self, key: &str, message: T) -> Result<(), SessionError> {
        let stream = self
            .lock()
            .get(key)
            .map(|entry| Arc::clone(&entry.stream))
            .ok_or_else(|| {
                SessionError::InvalidOperation(format!(
                    "no outgoing stream for key '{key}'"
                ))
            })?;
        stream.queue_message(message)
    }

    /// Close the stream for `key`, wait until its queue has been sent, and
    /// remove it. No-op when the key is absent.
    pub async fn end_stream(&self, key: &str) -> Result<(), SessionError> {
        let Some(entry) = self.lock().remove(key) else {
            return Ok(());
        };
        let result = finish(key, entry, self.drain_timeout).await;
        log::debug!("outgoing stream '{key}' ended");
        result
    }

    /// Close and remove the stream for `key` without waiting for it. The
    /// drain runs on a background task that [`dispose`](Self::dispose)
    /// waits for. Returns whether a stream existed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn close_stream(&self, key: &str) -> bool {
        let Some(entry) = self.lock().remove(key) else {
            return false;
        };
        entry.stream.close();
        let label = key.to_owned();
        let timeout = self.drain_timeout;
        let draining = tokio::spawn(async move {
            match finish(&label, entry, timeout).await {
                Ok(()) => log::debug!("outgoing stream '{label}' ended"),
                Err(e) => log::debug!("outgoing stream '{label}' ended with error: {e}"),
            }
        });
        let mut ending = self.ending.lock().unwrap_or_else(PoisonError::into_inner);
        ending.retain(|task| !task.is_finished());
        ending.push(draining);
        true
    }

    /// End every stream and wait for all of them, including streams closed
    /// by [`close_stream`](Self::close_stream). Bounded by the drain
    /// timeout.
    pub async fn dispose(&self) {
        let entries: Vec<(String, Entry<T>)> = self.lock().drain().collect();
        let ending: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.ending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let timeout = self.drain_timeout;
        let results = futures::future::join_all(
            entries
                .into_iter()
                .map(|(key, entry)| async move { finish(&key, entry, timeout).await }),
        )
        .await;
        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            log::debug!("{failed} outgoing stream(s) ended with errors on dispose");
        }
        for task in ending {
            if let Err(e) = task.await {
                log::warn!("outgoing stream drain task aborted: {e}");
            }
        }
    }
}

/// Close `entry`, give its call `timeout` to drain, then cancel it.
async fn finish<T: OutboundMessage>(
    key: &str,
    entry: Entry<T>,
    timeout: Duration,
) -> Result<(), SessionError> {
    let Entry { stream, mut task } = entry;
    stream.close();
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            log::warn!(
                "outgoing stream '{key}' did not drain within {timeout:?}, cancelling"
            );
            stream.cancel();
            flatten(task.await)
        }
    }
}

fn flatten(
    joined: Result<Result<(), SessionError>, tokio::task::JoinError>,
) -> Result<(), SessionError> {
    joined.unwrap_or_else(|e| {
        Err(SessionError::InvalidState(format!("stream task aborted: {e}")))
    })
}

impl<T: OutboundMessage> fmt::Debug for OutgoingStreamCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingStreamCollection")
            .field("keys", &self.keys())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream::BoxStream;
    use futures::StreamExt;

    use super::*;
    use crate::cancellation::CancellationSource;
    use crate::protocol::{CommandMessage, CommandReply};
    use crate::transport::loopback::LoopbackServer;
    use crate::transport::{Transport, TransportError};

    const METHOD: &str = "/test.Sink/Collect";

    fn command(name: &str) -> CommandMessage {
        CommandMessage {
            name: name.into(),
            arguments: None,
        }
    }

    fn collection(
        server: &Arc<LoopbackServer>,
        scope: &CancellationSource,
    ) -> OutgoingStreamCollection<CommandMessage> {
        let transport: Arc<dyn Transport> = server.transport();
        let token = scope.token();
        OutgoingStreamCollection::new(move |_key| {
            Ok(OutgoingStream::new(METHOD, Arc::clone(&transport), &token))
        })
    }

    fn recording_server() -> (Arc<LoopbackServer>, Arc<Mutex<Vec<String>>>) {
        let server = LoopbackServer::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        server.on_client_streaming(
            METHOD,
            move |requests: BoxStream<'static, CommandMessage>| {
                let sink = Arc::clone(&sink);
                async move {
                    let names: Vec<String> =
                        requests.map(|message| message.name).collect().await;
                    sink.lock().unwrap().extend(names);
                    Ok::<_, TransportError>(CommandReply::default())
                }
            },
        );
        (server, received)
    }

    /// Records every message but never answers once the requests end.
    fn silent_server() -> (Arc<LoopbackServer>, Arc<Mutex<Vec<String>>>) {
        let server = LoopbackServer::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        server.on_client_streaming(
            METHOD,
            move |mut requests: BoxStream<'static, CommandMessage>| {
                let sink = Arc::clone(&sink);
                async move {
                    while let Some(message) = requests.next().await {
                        sink.lock().unwrap().push(message.name);
                    }
                    futures::future::pending::<Result<CommandReply, TransportError>>()
                        .await
                }
            },
        );
        (server, received)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_create_one_stream() {
        let (server, _) = recording_server();
        let scope = CancellationSource::new();
        let streams = Arc::new(collection(&server, &scope));

        let starts: Vec<_> = (0..8)
            .map(|_| {
                let streams = Arc::clone(&streams);
                tokio::spawn(async move { streams.start_stream("k") })
            })
            .collect();
        for start in starts {
            start.await.unwrap().unwrap();
        }
        assert!(streams.has_stream("k"));
        assert_eq!(streams.keys(), ["k"]);

        streams.end_stream("k").await.unwrap();
        assert_eq!(server.call_count(METHOD), 1);
        assert!(!streams.has_stream("k"));
    }

    #[tokio::test]
    async fn end_stream_drains_queue() {
        let (server, received) = recording_server();
        let scope = CancellationSource::new();
        let streams = collection(&server, &scope);

        streams.start_stream("k").unwrap();
        streams.queue_message("k", command("m1")).unwrap();
        streams.queue_message("k", command("m2")).unwrap();
        streams.end_stream("k").await.unwrap();

        assert_eq!(*received.lock().unwrap(), ["m1", "m2"]);
        streams.end_stream("k").await.unwrap();
    }

    #[tokio::test]
    async fn queue_without_stream_is_rejected() {
        let (server, _) = recording_server();
        let scope = CancellationSource::new();
        let streams = collection(&server, &scope);

        assert!(matches!(
            streams.queue_message("missing", command("m")),
            Err(SessionError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn failed_key_does_not_affect_others() {
        let (server, received) = recording_server();
        let transport: Arc<dyn Transport> = server.transport();
        let scope = CancellationSource::new();
        let token = scope.token();
        let streams = OutgoingStreamCollection::new(move |key: &str| {
            let method = if key == "bad" { "/test.Sink/Missing" } else { METHOD };
            Ok(OutgoingStream::new(method, Arc::clone(&transport), &token))
        });

        streams.start_stream("bad").unwrap();
        streams.start_stream("good").unwrap();
        streams.queue_message("good", command("ok")).unwrap();

        assert!(streams.end_stream("bad").await.is_err());
        streams.end_stream("good").await.unwrap();
        assert_eq!(*received.lock().unwrap(), ["ok"]);
    }

    #[tokio::test]
    async fn dispose_ends_everything() {
        let (server, received) = recording_server();
        let scope = CancellationSource::new();
        let streams = collection(&server, &scope);
        for key in ["a", "b", "c"] {
            streams.start_stream(key).unwrap();
            streams.queue_message(key, command(key)).unwrap();
        }

        streams.dispose().await;

        assert!(streams.keys().is_empty());
        let mut names = received.lock().unwrap().clone();
        names.sort();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn unanswered_streams_are_cancelled_after_drain_timeout() {
        let (server, received) = silent_server();
        let scope = CancellationSource::new();
        let streams = collection(&server, &scope)
            .with_drain_timeout(Duration::from_millis(50));

        streams.start_stream("k").unwrap();
        streams.queue_message("k", command("m")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), streams.end_stream("k"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*received.lock().unwrap(), ["m"]);

        for key in ["a", "b"] {
            streams.start_stream(key).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), streams.dispose())
            .await
            .unwrap();
        assert!(streams.keys().is_empty());
    }

    #[tokio::test]
    async fn close_stream_does_not_wait_for_the_server() {
        let (server, received) = silent_server();
        let scope = CancellationSource::new();
        let streams = collection(&server, &scope)
            .with_drain_timeout(Duration::from_millis(200));
        for key in ["a", "b"] {
            streams.start_stream(key).unwrap();
        }
        streams.queue_message("a", command("m1")).unwrap();

        assert!(streams.close_stream("a"));
        assert!(!streams.has_stream("a"));
        assert!(!streams.close_stream("a"));
        streams.queue_message("b", command("m2")).unwrap();

        tokio::time::timeout(Duration::from_secs(2), streams.dispose())
            .await
            .unwrap();
        let mut names = received.lock().unwrap().clone();
        names.sort();
        assert_eq!(names, ["m1", "m2"]);
    }
}
