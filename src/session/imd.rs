//! Keyed interaction publishing with last-write-wins coalescing.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Interaction;
use crate::cancellation::{CancellationSource, CancellationToken};
use crate::connection::Connection;
use crate::error::SessionError;
use crate::options::InteractionOptions;
use crate::protocol::ParticleInteraction;
use crate::stream::{OutboundMessage, OutgoingStream, OutgoingStreamCollection};

type Streams = OutgoingStreamCollection<ParticleInteraction>;

/// State shared with the flush task.
struct Shared {
    options: InteractionOptions,
    player_id: String,
    /// Latest desired value per key since the last flush; `None` means
    /// the interaction should end.
    pending: Mutex<FxHashMap<String, Option<Interaction>>>,
    streams: Mutex<Option<Arc<Streams>>>,
    /// Held for the whole of a flush so drained values are applied in the
    /// order they were drained.
    flushing: tokio::sync::Mutex<()>,
}

impl Shared {
    fn streams(&self) -> Option<Arc<Streams>> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn flush(&self) {
        let _flushing = self.flushing.lock().await;
        let Some(streams) = self.streams() else {
            return;
        };
        let pending: Vec<(String, Option<Interaction>)> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (key, value) in pending {
            match value {
                Some(interaction) => self.publish(&streams, &key, &interaction),
                None => {
                    if streams.close_stream(&key) {
                        log::debug!("interaction '{key}' ending");
                    }
                }
            }
        }
    }

    fn publish(&self, streams: &Streams, key: &str, interaction: &Interaction) {
        let message = interaction.to_wire(key, &self.player_id);
        if let Err(reason) = message.validate() {
            log::warn!("dropping invalid interaction '{key}': {reason}");
            return;
        }
        let queued = streams
            .start_stream(key)
            .and_then(|()| streams.queue_message(key, message));
        if let Err(e) = queued {
            log::warn!("dropping update for interaction '{key}': {e}");
        }
    }
}

async fn flush_loop(shared: Arc<Shared>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.options.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => shared.flush().await,
        }
    }
    log::debug!("interaction flush loop stopped");
}

struct ImdClient {
    connection: Arc<Connection>,
    streams: Arc<Streams>,
    /// Parent of every interaction stream and of the flush loop.
    scope: CancellationSource,
    flush_scope: CancellationSource,
    flush_task: JoinHandle<()>,
}

/// Publishes interactions keyed by client-chosen ids.
///
/// [`set_interaction`](Self::set_interaction) only records the latest
/// desired value; a flush (periodic while a client is open, or explicit via
/// [`flush_interactions`](Self::flush_interactions)) turns each pending key
/// into at most one send. Each key has its own client stream; ending an
/// interaction closes its stream without waiting for the server.
///
/// Dropping the session cancels the flush loop and every interaction
/// stream it opened.
pub struct ImdSession {
    shared: Arc<Shared>,
    client: tokio::sync::Mutex<Option<ImdClient>>,
}

impl ImdSession {
    /// Session with a random player id.
    #[must_use]
    pub fn new(options: InteractionOptions) -> Self {
        Self::with_player_id(options, format!("player-{:016x}", rand::random::<u64>()))
    }

    /// Session owned by `player_id`.
    #[must_use]
    pub fn with_player_id(options: InteractionOptions, player_id: String) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                player_id,
                pending: Mutex::new(FxHashMap::default()),
                streams: Mutex::new(None),
                flushing: tokio::sync::Mutex::new(()),
            }),
            client: tokio::sync::Mutex::new(None),
        }
    }

    /// Id sent with every interaction.
    #[must_use]
    pub fn player_id(&self) -> &str {
        &self.shared.player_id
    }

    /// Record the desired state of `key`, replacing any unflushed value.
    /// `None` ends the interaction at the next flush.
    pub fn set_interaction(&self, key: &str, interaction: Option<Interaction>) {
        drop(
            self.shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.to_owned(), interaction),
        );
    }

    /// End `key` at the next flush.
    pub fn unset_interaction(&self, key: &str) {
        self.set_interaction(key, None);
    }

    /// Number of keys waiting for the next flush.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether `key` currently has a live stream.
    #[must_use]
    pub fn has_stream(&self, key: &str) -> bool {
        self.shared
            .streams()
            .is_some_and(|streams| streams.has_stream(key))
    }

    /// Push every pending key: ended keys close their stream, others are
    /// queued on theirs (started on demand). Invalid interactions and
    /// failures are logged and dropped. Does nothing without a client.
    ///
    /// Flushes never overlap; a call made during the periodic flush runs
    /// after it.
    pub async fn flush_interactions(&self) {
        self.shared.flush().await;
    }

    /// Close any prior client, then publish over `connection` and start
    /// the periodic flush.
    pub async fn open_client(
        &self,
        connection: Arc<Connection>,
    ) -> Result<(), SessionError> {
        let mut client = self.client.lock().await;
        if let Some(previous) = client.take() {
            self.teardown(previous).await;
        }

        let scope = connection.cancellation_token()?.child();
        let flush_scope = scope.child();
        let method = self.shared.options.publish_method.clone();
        let transport = connection.transport();
        let streams_token = scope.token();
        let streams = Arc::new(
            OutgoingStreamCollection::new(move |_key: &str| {
                Ok(OutgoingStream::new(
                    method.as_str(),
                    Arc::clone(&transport),
                    &streams_token,
                ))
            })
            .with_drain_timeout(self.shared.options.end_timeout()),
        );
        *self
            .shared
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&streams));

        let flush_task =
            tokio::spawn(flush_loop(Arc::clone(&self.shared), flush_scope.token()));
        log::info!(
            "interaction client {} opened on {}",
            self.shared.player_id,
            connection.target()
        );
        *client = Some(ImdClient {
            connection,
            streams,
            scope,
            flush_scope,
            flush_task,
        });
        Ok(())
    }

    /// Stop flushing and end every interaction stream. Streams the server
    /// does not finish within the end timeout are cancelled. Idempotent.
    pub async fn close_client(&self) {
        let mut client = self.client.lock().await;
        if let Some(previous) = client.take() {
            self.teardown(previous).await;
        }
    }

    async fn teardown(&self, client: ImdClient) {
        client.flush_scope.cancel();
        if let Err(e) = client.flush_task.await {
            log::warn!("interaction flush task aborted: {e}");
        }
        drop(
            self.shared
                .streams
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        client.streams.dispose().await;
        client.scope.cancel();
        log::info!(
            "interaction client {} on {} closed",
            self.shared.player_id,
            client.connection.target()
        );
    }
}

impl Default for ImdSession {
    fn default() -> Self {
        Self::new(InteractionOptions::default())
    }
}

impl Drop for ImdSession {
    fn drop(&mut self) {
        if let Some(client) = self.client.get_mut().take() {
            client.scope.cancel();
        }
    }
}

impl std::fmt::Debug for ImdSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImdSession")
            .field("player_id", &self.shared.player_id)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream::BoxStream;
    use futures::StreamExt;
    use glam::Vec3;

    use super::*;
    use crate::protocol::{paths, InteractionEndReply};
    use crate::transport::loopback::LoopbackServer;
    use crate::transport::TransportError;

    type Received = Arc<Mutex<Vec<ParticleInteraction>>>;

    fn imd_server() -> (Arc<LoopbackServer>, Received) {
        stalling_server(None)
    }

    /// Records every update. Streams that carried `stall_key` are never
    /// answered once their requests end.
    fn stalling_server(
        stall_key: Option<&'static str>,
    ) -> (Arc<LoopbackServer>, Received) {
        let server = LoopbackServer::new();
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        server.on_client_streaming(
            paths::PUBLISH_INTERACTION,
            move |mut requests: BoxStream<'static, ParticleInteraction>| {
                let sink = Arc::clone(&sink);
                async move {
                    let mut stall = false;
                    while let Some(update) = requests.next().await {
                        stall |= stall_key == Some(update.interaction_id.as_str());
                        sink.lock().unwrap().push(update);
                    }
                    if stall {
                        futures::future::pending::<()>().await;
                    }
                    Ok::<_, TransportError>(InteractionEndReply {})
                }
            },
        );
        (server, received)
    }

    fn received_key(received: &Received, key: &str) -> bool {
        received
            .lock()
            .unwrap()
            .iter()
            .any(|update| update.interaction_id == key)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Flushes only when the test asks for it.
    fn manual_options() -> InteractionOptions {
        InteractionOptions {
            flush_interval_ms: 60_000,
            ..InteractionOptions::default()
        }
    }

    async fn open(
        server: &Arc<LoopbackServer>,
        options: InteractionOptions,
    ) -> ImdSession {
        let session = ImdSession::with_player_id(options, "player-test".into());
        let connection = Arc::new(Connection::with_transport(server.transport()));
        session.open_client(connection).await.unwrap();
        session
    }

    #[tokio::test]
    async fn last_write_wins_between_flushes() {
        let (server, received) = imd_server();
        let session = open(&server, manual_options()).await;

        session.set_interaction("a", Some(Interaction::new(Vec3::X, vec![0])));
        session.set_interaction("a", Some(Interaction::new(Vec3::Y, vec![0])));
        assert_eq!(session.pending_count(), 1);
        session.flush_interactions().await;
        session.unset_interaction("a");
        session.flush_interactions().await;
        session.close_client().await;

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].interaction_id, "a");
        assert_eq!(received[0].player_id, "player-test");
        assert_eq!(received[0].position, [0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn unset_ends_stream() {
        let (server, _) = imd_server();
        let session = open(&server, manual_options()).await;

        session.set_interaction("a", Some(Interaction::new(Vec3::ZERO, vec![3])));
        session.flush_interactions().await;
        assert!(session.has_stream("a"));

        session.unset_interaction("a");
        session.flush_interactions().await;
        assert!(!session.has_stream("a"));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn keys_stream_independently() {
        let (server, received) = imd_server();
        let session = open(&server, manual_options()).await;

        session.set_interaction("left", Some(Interaction::new(Vec3::X, vec![1])));
        session.set_interaction("right", Some(Interaction::new(Vec3::Y, vec![2])));
        session.flush_interactions().await;
        session.unset_interaction("left");
        session.flush_interactions().await;

        assert!(!session.has_stream("left"));
        assert!(session.has_stream("right"));

        session.close_client().await;
        assert_eq!(server.call_count(paths::PUBLISH_INTERACTION), 2);
        let mut keys: Vec<String> = received
            .lock()
            .unwrap()
            .iter()
            .map(|update| update.interaction_id.clone())
            .collect();
        keys.sort();
        assert_eq!(keys, ["left", "right"]);
    }

    #[tokio::test]
    async fn invalid_interaction_is_dropped() {
        let (server, _) = imd_server();
        let session = open(&server, manual_options()).await;

        session.set_interaction("empty", Some(Interaction::new(Vec3::ZERO, Vec::new())));
        session.flush_interactions().await;

        assert_eq!(session.pending_count(), 0);
        assert!(!session.has_stream("empty"));
        session.close_client().await;
        assert_eq!(server.call_count(paths::PUBLISH_INTERACTION), 0);
    }

    #[tokio::test]
    async fn periodic_flush_sends_pending_updates() {
        let (server, received) = imd_server();
        let session = open(&server, InteractionOptions::default()).await;

        session.set_interaction("a", Some(Interaction::new(Vec3::ONE, vec![0])));
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.pending_count() > 0 || !session.has_stream("a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        session.close_client().await;
        session.close_client().await;
        assert_eq!(received.lock().unwrap().len(), 1);
        assert!(!session.has_stream("a"));
    }

    #[tokio::test]
    async fn flush_without_client_keeps_pending() {
        let session = ImdSession::default();
        session.set_interaction("a", Some(Interaction::new(Vec3::ZERO, vec![0])));

        session.flush_interactions().await;

        assert_eq!(session.pending_count(), 1);
        assert!(session.player_id().starts_with("player-"));
    }

    #[tokio::test]
    async fn ending_a_stalled_key_does_not_delay_other_keys() {
        let (server, received) = stalling_server(Some("slow"));
        let options = InteractionOptions {
            flush_interval_ms: 10,
            end_timeout_ms: 1000,
            ..InteractionOptions::default()
        };
        let session = open(&server, options).await;

        session.set_interaction("slow", Some(Interaction::new(Vec3::X, vec![0])));
        wait_until(|| received_key(&received, "slow")).await;
        session.unset_interaction("slow");
        tokio::time::sleep(Duration::from_millis(30)).await;
        session.set_interaction("fast", Some(Interaction::new(Vec3::Y, vec![1])));

        tokio::time::timeout(Duration::from_millis(300), async {
            while !received_key(&received, "fast") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        session.close_client().await;
    }

    #[tokio::test]
    async fn close_client_returns_when_server_never_answers() {
        let (server, received) = stalling_server(Some("a"));
        let options = InteractionOptions {
            end_timeout_ms: 50,
            ..manual_options()
        };
        let session = open(&server, options).await;
        session.set_interaction("a", Some(Interaction::new(Vec3::ONE, vec![2])));
        session.flush_interactions().await;
        wait_until(|| received_key(&received, "a")).await;

        tokio::time::timeout(Duration::from_secs(2), session.close_client())
            .await
            .unwrap();
        assert!(!session.has_stream("a"));
    }

    #[tokio::test]
    async fn dropping_the_session_cancels_its_streams() {
        let (server, _) = imd_server();
        let session = open(&server, manual_options()).await;
        session.set_interaction("a", Some(Interaction::new(Vec3::ZERO, vec![0])));
        session.flush_interactions().await;
        let token = session.client.lock().await.as_ref().unwrap().scope.token();
        let streams = session.shared.streams().unwrap();
        assert!(streams.has_stream("a"));

        drop(session);

        assert!(token.is_triggered());
        wait_until(|| !streams.has_stream("a")).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flushes_keep_the_latest_value() {
        let (server, _) = imd_server();
        let session = Arc::new(open(&server, manual_options()).await);

        for round in 0..20 {
            let key = format!("k{round}");
            session.set_interaction(&key, Some(Interaction::new(Vec3::X, vec![0])));
            let background = {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.flush_interactions().await })
            };
            session.unset_interaction(&key);
            session.flush_interactions().await;
            background.await.unwrap();
            session.flush_interactions().await;

            assert!(!session.has_stream(&key), "{key} outlived its unset");
        }
        session.close_client().await;
    }
}
