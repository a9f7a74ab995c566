//! Hand-rolled mock collaborators shared by the controller and idle-monitor
//! tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::controller::{AudioError, AudioHandle, AudioOutput, GuildKey, MediaResolver, ResolveError};
use crate::idle::{MembershipError, RoomMembership};
use crate::models::{Resolved, Track};
use crate::notify::{Notification, Notifier};

#[derive(Default)]
pub struct StubResolver {
    results: Mutex<HashMap<String, Resolved>>,
}

impl StubResolver {
    pub async fn add_track(&self, query: &str, url: &str, title: &str) {
        self.results.lock().await.insert(
            query.to_string(),
            Resolved::One(Track {
                url: url.to_string(),
                title: title.to_string(),
            }),
        );
    }

    pub async fn add_playlist(&self, query: &str, title: &str, entries: &[(&str, &str)]) {
        let tracks = entries
            .iter()
            .map(|(url, title)| Track {
                url: url.to_string(),
                title: title.to_string(),
            })
            .collect();
        self.results.lock().await.insert(
            query.to_string(),
            Resolved::Playlist {
                title: title.to_string(),
                tracks,
            },
        );
    }
}

#[async_trait]
impl MediaResolver for StubResolver {
    async fn resolve(&self, query: &str) -> Result<Resolved, ResolveError> {
        self.results
            .lock()
            .await
            .get(query)
            .cloned()
            .ok_or(ResolveError::NoResults)
    }
}

#[derive(Default)]
pub struct TestHandle {
    paused: AtomicBool,
    stopped: AtomicBool,
}

impl TestHandle {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl AudioHandle for Arc<TestHandle> {
    fn pause(&self) -> Result<(), AudioError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every begin/disconnect; `fail_for` makes a URL refuse to open.
#[derive(Default)]
pub struct RecordingAudio {
    begun: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    handles: Mutex<Vec<Arc<TestHandle>>>,
    disconnects: Mutex<Vec<GuildKey>>,
}

impl RecordingAudio {
    pub async fn fail_for(&self, url: &str) {
        self.failing.lock().await.insert(url.to_string());
    }

    pub async fn begun(&self) -> Vec<String> {
        self.begun.lock().await.clone()
    }

    pub async fn disconnects(&self) -> Vec<GuildKey> {
        self.disconnects.lock().await.clone()
    }

    pub async fn last_handle(&self) -> Arc<TestHandle> {
        self.handles
            .lock()
            .await
            .last()
            .cloned()
            .expect("no track was started")
    }
}

#[async_trait]
impl AudioOutput for RecordingAudio {
    async fn begin(
        &self,
        _guild: GuildKey,
        _generation: u64,
        url: &str,
    ) -> Result<Box<dyn AudioHandle>, AudioError> {
        if self.failing.lock().await.contains(url) {
            return Err(AudioError::Source(format!("cannot open {url}")));
        }
        self.begun.lock().await.push(url.to_string());
        let handle = Arc::new(TestHandle::default());
        self.handles.lock().await.push(Arc::clone(&handle));
        Ok(Box::new(handle))
    }

    async fn disconnect(&self, guild: GuildKey) {
        self.disconnects.lock().await.push(guild);
    }
}

/// Blocks inside `begin` until released, to model a slow source resolution.
#[derive(Default)]
pub struct GatedAudio {
    entered: Notify,
    release: Notify,
    handles: Mutex<Vec<Arc<TestHandle>>>,
}

impl GatedAudio {
    /// Waits until a `begin` call is in flight.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub async fn last_handle(&self) -> Arc<TestHandle> {
        self.handles
            .lock()
            .await
            .last()
            .cloned()
            .expect("no track was started")
    }
}

#[async_trait]
impl AudioOutput for GatedAudio {
    async fn begin(
        &self,
        _guild: GuildKey,
        _generation: u64,
        _url: &str,
    ) -> Result<Box<dyn AudioHandle>, AudioError> {
        self.entered.notify_one();
        self.release.notified().await;
        let handle = Arc::new(TestHandle::default());
        self.handles.lock().await.push(Arc::clone(&handle));
        Ok(Box::new(handle))
    }

    async fn disconnect(&self, _guild: GuildKey) {}
}

#[derive(Default)]
pub struct RecordingNotifier {
    notes: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub async fn notes(&self) -> Vec<Notification> {
        self.notes.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _guild: u64, notification: Notification) {
        self.notes.lock().await.push(notification);
    }
}

/// Per-guild member counts; unset guilds report the room as unreachable.
#[derive(Default)]
pub struct StubMembership {
    humans: Mutex<HashMap<GuildKey, usize>>,
}

impl StubMembership {
    pub async fn set_humans(&self, guild: GuildKey, count: usize) {
        self.humans.lock().await.insert(guild, count);
    }

    pub async fn set_unreachable(&self, guild: GuildKey) {
        self.humans.lock().await.remove(&guild);
    }
}

#[async_trait]
impl RoomMembership for StubMembership {
    async fn human_members(&self, guild: GuildKey) -> Result<usize, MembershipError> {
        self.humans
            .lock()
            .await
            .get(&guild)
            .copied()
            .ok_or(MembershipError::Unavailable)
    }
}

pub fn note_kinds(notes: &[Notification]) -> Vec<&'static str> {
    notes
        .iter()
        .map(|n| match n {
            Notification::PlaylistAdded { .. } => "PlaylistAdded",
            Notification::TrackQueued { .. } => "TrackQueued",
            Notification::NowPlaying { .. } => "NowPlaying",
            Notification::QueueEmpty => "QueueEmpty",
            Notification::PlaybackError { .. } => "PlaybackError",
            Notification::Stopped => "Stopped",
            Notification::Paused { .. } => "Paused",
            Notification::Resumed { .. } => "Resumed",
            Notification::Skipped => "Skipped",
            Notification::NothingToSkip => "NothingToSkip",
            Notification::NothingPlaying => "NothingPlaying",
        })
        .collect()
}
