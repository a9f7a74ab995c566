use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::{PlaybackStatus, Resolved, Track};
use crate::notify::{Notification, Notifier};
use crate::queue::TrackQueue;

pub type GuildKey = u64;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("failed to run yt-dlp: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("yt-dlp reported an error: {0}")]
    Tool(String),
    #[error("no playable result for the query")]
    NoResults,
}

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("could not open audio source: {0}")]
    Source(String),
    #[error("audio control failed: {0}")]
    Control(String),
}

/// Resolves a user query into track metadata. Must not download media.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<Resolved, ResolveError>;
}

/// A started track. Dropping the handle does not stop rendering.
pub trait AudioHandle: Send + Sync {
    fn pause(&self) -> Result<(), AudioError>;
    fn resume(&self) -> Result<(), AudioError>;
    fn stop(&self) -> Result<(), AudioError>;
}

/// Sent exactly once per started track when its rendering ends, naturally
/// or via `stop()`.
#[derive(Clone, Copy, Debug)]
pub struct TrackEnded {
    pub guild: GuildKey,
    pub generation: u64,
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Begins rendering `url` in the guild's voice connection. The returned
    /// handle controls the track; the end of rendering is reported as a
    /// `TrackEnded` carrying `generation`.
    async fn begin(
        &self,
        guild: GuildKey,
        generation: u64,
        url: &str,
    ) -> Result<Box<dyn AudioHandle>, AudioError>;

    async fn disconnect(&self, guild: GuildKey);
}

struct SessionState {
    queue: TrackQueue,
    current: Option<Track>,
    status: PlaybackStatus,
    handle: Option<Box<dyn AudioHandle>>,
    last_activity: Instant,
    generation: u64,
    connected: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            queue: TrackQueue::new(),
            current: None,
            status: PlaybackStatus::Idle,
            handle: None,
            last_activity: Instant::now(),
            generation: 0,
            connected: true,
        }
    }

    /// Stops whatever is rendering and resets to a disconnected idle state.
    /// The generation bump discards any in-flight advance or end event.
    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.handle.take() {
            if let Err(why) = handle.stop() {
                warn!("Stopping track during teardown failed: {why}");
            }
        }
        self.queue.clear();
        self.current = None;
        self.status = PlaybackStatus::Idle;
        self.connected = false;
    }
}

struct Session {
    state: Mutex<SessionState>,
    // Held for the whole of an advance, so only one runs per session.
    advance_guard: Mutex<()>,
}

/// Snapshot of a guild's queue for display.
pub struct QueueView {
    pub current: Option<Track>,
    pub upcoming: Vec<Track>,
    pub total: usize,
}

/// The playback state machine. One session per guild; the controller is the
/// sole mutator of every session's queue and status.
pub struct Controller {
    resolver: Arc<dyn MediaResolver>,
    audio: Arc<dyn AudioOutput>,
    notifier: Arc<dyn Notifier>,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<GuildKey, Arc<Session>>>,
}

impl Controller {
    pub fn new(
        resolver: Arc<dyn MediaResolver>,
        audio: Arc<dyn AudioOutput>,
        notifier: Arc<dyn Notifier>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            audio,
            notifier,
            idle_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the guild's session if it does not exist yet. Called after a
    /// successful voice join.
    pub async fn ensure_session(&self, guild: GuildKey) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(guild).or_insert_with(|| {
            info!("Creating session for guild {guild}");
            Arc::new(Session {
                state: Mutex::new(SessionState::new()),
                advance_guard: Mutex::new(()),
            })
        });

        let mut state = session.state.lock().await;
        state.connected = true;
        state.last_activity = Instant::now();
    }

    async fn session(&self, guild: GuildKey) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(&guild).cloned()
    }

    pub async fn active_sessions(&self) -> Vec<GuildKey> {
        self.sessions.lock().await.keys().copied().collect()
    }

    pub async fn status(&self, guild: GuildKey) -> Option<PlaybackStatus> {
        let session = self.session(guild).await?;
        let state = session.state.lock().await;
        Some(state.status)
    }

    pub async fn queue_view(&self, guild: GuildKey, n: usize) -> Option<QueueView> {
        let session = self.session(guild).await?;
        let state = session.state.lock().await;
        Some(QueueView {
            current: state.current.clone(),
            upcoming: state.queue.preview(n),
            total: state.queue.len(),
        })
    }

    /// Resolves `query` and either starts playback or queues the result.
    pub async fn request_play(&self, guild: GuildKey, query: &str) {
        let Some(session) = self.session(guild).await else {
            return;
        };

        session.state.lock().await.last_activity = Instant::now();

        info!("Resolving {query} for guild {guild}");

        match self.resolver.resolve(query).await {
            Err(why) => {
                warn!("Resolution of {query} failed: {why}");
                self.notifier
                    .notify(
                        guild,
                        Notification::PlaybackError {
                            title: query.to_string(),
                            reason: why.to_string(),
                        },
                    )
                    .await;
            }
            Ok(Resolved::One(track)) => {
                let (busy, start) = {
                    let mut state = session.state.lock().await;
                    // An advance mid-resolution counts as busy too, so the
                    // request is acknowledged rather than silently queued.
                    let advancing = session.advance_guard.try_lock().is_err();
                    let busy = advancing
                        || state.status != PlaybackStatus::Idle
                        || !state.queue.is_empty();
                    state.queue.enqueue_one(track.clone());
                    (busy, state.status == PlaybackStatus::Idle)
                };

                if busy {
                    self.notifier
                        .notify(guild, Notification::TrackQueued { title: track.title })
                        .await;
                }

                if start {
                    self.advance(guild).await;
                }
            }
            Ok(Resolved::Playlist { title, tracks }) => {
                let count = tracks.len();
                let start = {
                    let mut state = session.state.lock().await;
                    state.queue.enqueue_many(tracks);
                    state.status == PlaybackStatus::Idle && !state.queue.is_empty()
                };

                self.notifier
                    .notify(guild, Notification::PlaylistAdded { title, count })
                    .await;

                if start {
                    self.advance(guild).await;
                }
            }
        }
    }

    /// Pops the next track and starts it, skipping over tracks whose source
    /// fails to open, or settles to idle when the queue runs out. Only runs
    /// from an idle session; the guard keeps it to one at a time.
    async fn advance(&self, guild: GuildKey) {
        let Some(session) = self.session(guild).await else {
            return;
        };

        let _guard = session.advance_guard.lock().await;

        loop {
            let (track, generation) = {
                let mut state = session.state.lock().await;
                if !state.connected || state.status != PlaybackStatus::Idle {
                    return;
                }

                state.generation += 1;
                match state.queue.dequeue_front() {
                    None => {
                        drop(state);
                        self.notifier.notify(guild, Notification::QueueEmpty).await;
                        return;
                    }
                    Some(track) => (track, state.generation),
                }
            };

            info!("Starting {} for guild {guild}", track.title);

            match self.audio.begin(guild, generation, &track.url).await {
                Ok(handle) => {
                    let mut state = session.state.lock().await;
                    if !state.connected || state.generation != generation {
                        // Superseded by stop or skip while the source was
                        // opening; the audio must not outlive the session.
                        drop(state);
                        if let Err(why) = handle.stop() {
                            warn!("Stopping superseded track failed: {why}");
                        }
                        return;
                    }

                    state.current = Some(track.clone());
                    state.status = PlaybackStatus::Playing;
                    state.handle = Some(handle);
                    state.last_activity = Instant::now();
                    drop(state);

                    self.notifier
                        .notify(guild, Notification::NowPlaying { title: track.title })
                        .await;
                    return;
                }
                Err(why) => {
                    warn!("Err starting source: {why:?}");
                    self.notifier
                        .notify(
                            guild,
                            Notification::PlaybackError {
                                title: track.title,
                                reason: why.to_string(),
                            },
                        )
                        .await;

                    let superseded = {
                        let state = session.state.lock().await;
                        !state.connected || state.generation != generation
                    };
                    if superseded {
                        return;
                    }
                    // Try the next queued track.
                }
            }
        }
    }

    /// End-of-track notification from the audio output. Stale generations
    /// (a skip or stop already moved the session on) are discarded.
    pub async fn track_ended(&self, guild: GuildKey, generation: u64) {
        let Some(session) = self.session(guild).await else {
            return;
        };

        {
            let mut state = session.state.lock().await;
            if !state.connected || state.generation != generation {
                info!("Discarding stale end event for guild {guild}");
                return;
            }
            state.generation += 1;
            state.handle = None;
            state.current = None;
            state.status = PlaybackStatus::Idle;
            state.last_activity = Instant::now();
        }

        info!("Track ended for guild {guild}, advancing");
        self.advance(guild).await;
    }

    /// Returns false when the guild has no session at all.
    pub async fn pause(&self, guild: GuildKey) -> bool {
        let Some(session) = self.session(guild).await else {
            return false;
        };

        let note = {
            let mut state = session.state.lock().await;
            if state.status != PlaybackStatus::Playing {
                Notification::NothingPlaying
            } else {
                let title = current_title(&state);
                match state.handle.as_ref().map(|h| h.pause()) {
                    Some(Ok(())) => {
                        state.status = PlaybackStatus::Paused;
                        state.last_activity = Instant::now();
                        Notification::Paused { title }
                    }
                    Some(Err(why)) => Notification::PlaybackError {
                        title,
                        reason: why.to_string(),
                    },
                    None => Notification::NothingPlaying,
                }
            }
        };

        self.notifier.notify(guild, note).await;
        true
    }

    pub async fn resume(&self, guild: GuildKey) -> bool {
        let Some(session) = self.session(guild).await else {
            return false;
        };

        let note = {
            let mut state = session.state.lock().await;
            if state.status != PlaybackStatus::Paused {
                Notification::NothingPlaying
            } else {
                let title = current_title(&state);
                match state.handle.as_ref().map(|h| h.resume()) {
                    Some(Ok(())) => {
                        state.status = PlaybackStatus::Playing;
                        state.last_activity = Instant::now();
                        Notification::Resumed { title }
                    }
                    Some(Err(why)) => Notification::PlaybackError {
                        title,
                        reason: why.to_string(),
                    },
                    None => Notification::NothingPlaying,
                }
            }
        };

        self.notifier.notify(guild, note).await;
        true
    }

    /// Stops the current track and advances. The generation bump makes the
    /// stopped track's end event a no-op, so only this advance dequeues.
    pub async fn skip(&self, guild: GuildKey) -> bool {
        let Some(session) = self.session(guild).await else {
            return false;
        };

        let proceed = {
            let mut state = session.state.lock().await;
            if state.status == PlaybackStatus::Idle {
                false
            } else {
                state.generation += 1;
                if let Some(handle) = state.handle.take() {
                    if let Err(why) = handle.stop() {
                        warn!("Stopping skipped track failed: {why}");
                    }
                }
                state.current = None;
                state.status = PlaybackStatus::Idle;
                state.last_activity = Instant::now();
                true
            }
        };

        if proceed {
            self.notifier.notify(guild, Notification::Skipped).await;
            self.advance(guild).await;
        } else {
            self.notifier.notify(guild, Notification::NothingToSkip).await;
        }
        true
    }

    /// Stops playback, clears the queue, leaves the voice channel and
    /// destroys the session. Wins over any in-flight advance.
    pub async fn stop_and_leave(&self, guild: GuildKey) -> bool {
        let session = self.sessions.lock().await.remove(&guild);
        let Some(session) = session else {
            return false;
        };

        session.state.lock().await.teardown();

        self.audio.disconnect(guild).await;
        self.notifier.notify(guild, Notification::Stopped).await;
        info!("Session for guild {guild} stopped");
        true
    }

    /// The gateway reported the bot's own voice state gone (kicked or
    /// moved). Drop the session without trying to disconnect again.
    pub async fn session_dropped(&self, guild: GuildKey) {
        let session = self.sessions.lock().await.remove(&guild);
        if let Some(session) = session {
            session.state.lock().await.teardown();
            info!("Session for guild {guild} dropped by the gateway");
        }
    }

    /// Idle-monitor entry point: tears the session down when the room has no
    /// human members or activity is older than the idle timeout. The
    /// timestamp is re-read under the session lock so a command racing the
    /// sweep keeps the session alive. Returns whether teardown happened.
    pub async fn enforce_idle(&self, guild: GuildKey, human_present: bool) -> bool {
        let Some(session) = self.session(guild).await else {
            return false;
        };

        let torn_down = {
            let mut state = session.state.lock().await;
            let stale = state.connected
                && (!human_present || state.last_activity.elapsed() > self.idle_timeout);
            if stale {
                state.teardown();
            }
            stale
        };

        if torn_down {
            info!("Tearing down idle session for guild {guild}");
            self.sessions.lock().await.remove(&guild);
            self.audio.disconnect(guild).await;
            self.notifier.notify(guild, Notification::Stopped).await;
        }

        torn_down
    }

    /// Drains end-of-track events, dispatching each on its own task so one
    /// guild's slow advance cannot stall another's.
    pub async fn run_end_listener(self: Arc<Self>, mut events: UnboundedReceiver<TrackEnded>) {
        while let Some(ended) = events.recv().await {
            let controller = Arc::clone(&self);
            tokio::spawn(async move {
                controller.track_ended(ended.guild, ended.generation).await;
            });
        }
    }

    #[cfg(test)]
    pub(crate) async fn backdate_activity(&self, guild: GuildKey, age: Duration) {
        if let Some(session) = self.session(guild).await {
            session.state.lock().await.last_activity = Instant::now() - age;
        }
    }

    #[cfg(test)]
    pub(crate) async fn current_generation(&self, guild: GuildKey) -> u64 {
        let session = self.session(guild).await.expect("session exists");
        let state = session.state.lock().await;
        state.generation
    }
}

fn current_title(state: &SessionState) -> String {
    state
        .current
        .as_ref()
        .map(|t| t.title.clone())
        .unwrap_or_else(|| crate::models::UNKNOWN_TRACK_TITLE.to_string())
}
