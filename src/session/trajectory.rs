//! Frame subscription and playback control for one trajectory server.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use super::CommandClient;
use crate::connection::Connection;
use crate::error::SessionError;
use crate::frame::{Frame, FrameChanges, FrameReader, FrameState};
use crate::host::ConnectionObserver;
use crate::options::{CommandOptions, TrajectoryOptions};
use crate::protocol::{GetFrameRequest, GetFrameResponse};
use crate::stream::{IncomingStream, Listeners};

/// Published after every delta that changed something.
#[derive(Debug, Clone)]
pub struct FrameUpdate {
    /// The merged frame after the delta.
    pub frame: Arc<Frame>,
    /// Fields the delta changed.
    pub changes: FrameChanges,
    /// Local frame version.
    pub version: u64,
    /// Server frame index.
    pub frame_index: Option<u32>,
}

struct TrajectoryClient {
    connection: Arc<Connection>,
    stream: IncomingStream<GetFrameResponse>,
    task: JoinHandle<Result<(), SessionError>>,
}

/// Keeps the latest frame of a trajectory server and controls its
/// playback.
///
/// Listeners registered with [`on_frame_changed`](Self::on_frame_changed)
/// run on the receive task, in registration order, once per delta that
/// changed at least one field.
///
/// Dropping the session cancels its frame subscription.
pub struct TrajectorySession {
    options: TrajectoryOptions,
    command_options: CommandOptions,
    state: Arc<Mutex<FrameState>>,
    listeners: Arc<Listeners<FrameUpdate>>,
    observers: Mutex<Vec<Arc<dyn ConnectionObserver>>>,
    commands: Mutex<Option<CommandClient>>,
    client: tokio::sync::Mutex<Option<TrajectoryClient>>,
}

impl TrajectorySession {
    /// Session without a client.
    #[must_use]
    pub fn new(options: TrajectoryOptions, command_options: CommandOptions) -> Self {
        Self {
            options,
            command_options,
            state: Arc::new(Mutex::new(FrameState::new())),
            listeners: Arc::new(Listeners::new()),
            observers: Mutex::new(Vec::new()),
            commands: Mutex::new(None),
            client: tokio::sync::Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FrameState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback for merged frame updates.
    pub fn on_frame_changed(
        &self,
        listener: impl Fn(&FrameUpdate) + Send + Sync + 'static,
    ) {
        self.listeners.push(Arc::new(listener));
    }

    /// Register a connect/disconnect observer.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn notify_observers(&self, event: impl Fn(&dyn ConnectionObserver)) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            event(observer.as_ref());
        }
    }

    /// Close any prior client, then subscribe to frame deltas over
    /// `connection`. The frame history starts over.
    pub async fn open_client(
        &self,
        connection: Arc<Connection>,
    ) -> Result<(), SessionError> {
        let mut client = self.client.lock().await;
        if let Some(previous) = client.take() {
            self.teardown(previous).await;
        }

        let request = GetFrameRequest {
            data: None,
            frame_interval: self.options.frame_interval,
        };
        let stream: IncomingStream<GetFrameResponse> =
            connection.incoming_stream(&self.options.subscribe_method, &request)?;

        self.state().reset();
        let state = Arc::clone(&self.state);
        let listeners = Arc::clone(&self.listeners);
        stream.on_message(move |response: &GetFrameResponse| {
            let update = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                match state.apply_response(response.clone()) {
                    Ok(changes) => FrameUpdate {
                        frame: state.frame(),
                        changes,
                        version: state.version(),
                        frame_index: state.frame_index(),
                    },
                    Err(e) => {
                        log::warn!(
                            "skipping frame delta {}: {e}",
                            response.frame_index
                        );
                        return;
                    }
                }
            };
            if update.changes.has_anything_changed() {
                listeners.notify(&update);
            }
        });

        let receiving = stream.start_receiving()?;
        let target = connection.target().to_owned();
        let task = tokio::spawn(async move {
            let result = receiving.await;
            match &result {
                Ok(()) => log::debug!("frame stream from {target} ended"),
                Err(e) => log::warn!("frame stream from {target} failed: {e}"),
            }
            result
        });

        *self.commands.lock().unwrap_or_else(PoisonError::into_inner) = Some(
            CommandClient::new(Arc::clone(&connection), self.command_options.clone()),
        );
        log::info!("trajectory client opened on {}", connection.target());
        self.notify_observers(|observer| observer.connected(connection.target()));
        *client = Some(TrajectoryClient {
            connection,
            stream,
            task,
        });
        Ok(())
    }

    /// Stop the frame subscription. Idempotent; concurrent callers return
    /// once the subscription is down. The connection itself stays open.
    pub async fn close_client(&self) {
        let mut client = self.client.lock().await;
        if let Some(previous) = client.take() {
            self.teardown(previous).await;
        }
    }

    async fn teardown(&self, client: TrajectoryClient) {
        drop(self.commands.lock().unwrap_or_else(PoisonError::into_inner).take());
        client.stream.close();
        if let Err(e) = client.task.await {
            log::warn!("frame receive task aborted: {e}");
        }
        log::info!("trajectory client on {} closed", client.connection.target());
        self.notify_observers(|observer| {
            observer.disconnected(client.connection.target());
        });
    }

    /// Whether a client is open.
    pub async fn has_client(&self) -> bool {
        self.client.lock().await.is_some()
    }

    fn command_client(&self) -> Option<CommandClient> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn detached(&self, name: &str) {
        match self.command_client() {
            Some(commands) => drop(commands.run_detached(name)),
            None => log::debug!("no trajectory client, ignoring {name}"),
        }
    }

    /// Resume playback. No-op without a client.
    pub fn play(&self) {
        self.detached(&self.command_options.play);
    }

    /// Pause playback. No-op without a client.
    pub fn pause(&self) {
        self.detached(&self.command_options.pause);
    }

    /// Reset the simulation. No-op without a client.
    pub fn reset(&self) {
        self.detached(&self.command_options.reset);
    }

    /// Advance one step. No-op without a client.
    pub fn step(&self) {
        self.detached(&self.command_options.step);
    }

    /// Run a command and wait for its result.
    pub async fn run_command(
        &self,
        name: &str,
        arguments: Option<prost_types::Struct>,
    ) -> Result<prost_types::Struct, SessionError> {
        let commands = self.command_client().ok_or_else(|| {
            SessionError::InvalidOperation("no trajectory client is open".into())
        })?;
        commands.run_command(name, arguments).await
    }

    /// The merged frame.
    #[must_use]
    pub fn current_frame(&self) -> Arc<Frame> {
        self.state().frame()
    }

    /// Server frame index of the last merged delta.
    #[must_use]
    pub fn current_frame_index(&self) -> Option<u32> {
        self.state().frame_index()
    }

    /// Number of deltas merged so far.
    #[must_use]
    pub fn frame_version(&self) -> u64 {
        self.state().version()
    }

    /// Changes merged since the last call.
    pub fn take_changes(&self) -> FrameChanges {
        self.state().take_changes()
    }

    /// Lock-free handle onto the latest frame for a render thread.
    pub fn frame_reader(&self) -> FrameReader {
        self.state().reader()
    }
}

impl Default for TrajectorySession {
    fn default() -> Self {
        Self::new(TrajectoryOptions::default(), CommandOptions::default())
    }
}

impl Drop for TrajectorySession {
    fn drop(&mut self) {
        if let Some(client) = self.client.get_mut().take() {
            client.stream.cancel();
        }
    }
}

impl std::fmt::Debug for TrajectorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectorySession")
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::StreamExt;
    use glam::Vec3;

    use super::*;
    use crate::frame::{encode_frame, FrameField};
    use crate::protocol::{
        paths, value_array, CommandMessage, CommandReply, FrameData,
        StringArray, ValueArray,
    };
    use crate::transport::loopback::LoopbackServer;
    use crate::transport::TransportError;

    fn positions() -> Vec<Vec3> {
        vec![
            Vec3::new(-1.0, 1.0, 0.0),
            Vec3::ZERO,
            Vec3::new(1.0, -1.0, 0.0),
        ]
    }

    /// Serves `responses`, then keeps the stream open.
    fn frame_server(responses: Vec<GetFrameResponse>) -> Arc<LoopbackServer> {
        let server = LoopbackServer::new();
        server.on_server_streaming(
            paths::SUBSCRIBE_LATEST_FRAMES,
            move |_request: GetFrameRequest| {
                futures::stream::iter(responses.clone())
                    .chain(futures::stream::pending())
            },
        );
        server
    }

    async fn wait_for_version(session: &TrajectorySession, version: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.frame_version() < version {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn single_delta_reaches_current_frame() {
        let delta = Frame {
            particle_positions: Some(positions()),
            ..Frame::default()
        };
        let server = frame_server(vec![GetFrameResponse {
            frame_index: 0,
            frame: Some(encode_frame(&delta)),
        }]);
        let session = TrajectorySession::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let positions_changed = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            let positions_changed = Arc::clone(&positions_changed);
            session.on_frame_changed(move |update: &FrameUpdate| {
                let _ = fired.fetch_add(1, Ordering::SeqCst);
                if update.changes.has_changed(FrameField::ParticlePositions) {
                    let _ = positions_changed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        let connection = Arc::new(Connection::with_transport(server.transport()));

        session.open_client(Arc::clone(&connection)).await.unwrap();
        wait_for_version(&session, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.current_frame().particle_positions, Some(positions()));
        assert_eq!(session.current_frame_index(), Some(0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(positions_changed.load(Ordering::SeqCst), 1);

        session.close_client().await;
        session.close_client().await;
        assert!(!session.has_client().await);
        connection.close().await;
    }

    #[tokio::test]
    async fn malformed_delta_is_skipped() {
        let mut bad = FrameData::default();
        drop(bad.arrays.insert(
            FrameField::ParticlePositions.key().into(),
            ValueArray {
                values: Some(value_array::Values::StringValues(StringArray {
                    values: vec!["oops".into()],
                })),
            },
        ));
        let good = Frame {
            particle_positions: Some(positions()),
            ..Frame::default()
        };
        let server = frame_server(vec![
            GetFrameResponse {
                frame_index: 1,
                frame: Some(bad),
            },
            GetFrameResponse {
                frame_index: 2,
                frame: Some(encode_frame(&good)),
            },
        ]);
        let session = TrajectorySession::default();
        let connection = Arc::new(Connection::with_transport(server.transport()));

        session.open_client(connection).await.unwrap();
        wait_for_version(&session, 1).await;

        assert_eq!(session.current_frame().particle_positions, Some(positions()));
        assert_eq!(session.current_frame_index(), Some(2));
        session.close_client().await;
    }

    #[tokio::test]
    async fn playback_commands_are_sent_detached() {
        let server = frame_server(Vec::new());
        let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
        server.on_unary(paths::RUN_COMMAND, move |request: CommandMessage| {
            let _ = sender.send(request.name);
            async { Ok::<_, TransportError>(CommandReply::default()) }
        });
        let session = TrajectorySession::default();

        session.play();
        assert_eq!(server.call_count(paths::RUN_COMMAND), 0);

        let connection = Arc::new(Connection::with_transport(server.transport()));
        session.open_client(connection).await.unwrap();
        session.play();
        session.step();

        let mut names = Vec::new();
        for _ in 0..2 {
            let name = tokio::time::timeout(Duration::from_secs(1), received.recv())
                .await
                .unwrap()
                .unwrap();
            names.push(name);
        }
        names.sort();
        assert_eq!(names, ["playback/play", "playback/step"]);
        session.close_client().await;
    }

    async fn wait_for_calls(server: &LoopbackServer, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while server.call_count(paths::SUBSCRIBE_LATEST_FRAMES) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn reopening_replaces_the_subscription() {
        let server = frame_server(Vec::new());
        let session = TrajectorySession::default();
        let connection = Arc::new(Connection::with_transport(server.transport()));

        session.open_client(Arc::clone(&connection)).await.unwrap();
        wait_for_calls(&server, 1).await;
        session.open_client(Arc::clone(&connection)).await.unwrap();
        wait_for_calls(&server, 2).await;

        assert!(session.has_client().await);
        session.close_client().await;
        assert!(matches!(
            session.run_command("playback/play", None).await,
            Err(SessionError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_session_cancels_the_subscription() {
        let server = frame_server(Vec::new());
        let session = TrajectorySession::default();
        let connection = Arc::new(Connection::with_transport(server.transport()));
        session.open_client(Arc::clone(&connection)).await.unwrap();
        let token = session
            .client
            .lock()
            .await
            .as_ref()
            .unwrap()
            .stream
            .cancellation_token();

        drop(session);

        assert!(token.is_triggered());
        assert!(!connection.is_closed());
    }
}
