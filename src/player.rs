use std::sync::Arc;

use async_trait::async_trait;
use serenity::model::id::GuildId;
use songbird::tracks::TrackHandle;
use songbird::{ytdl, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::controller::{AudioError, AudioHandle, AudioOutput, GuildKey, TrackEnded};

/// Audio output over songbird: opens yt-dlp sources into the guild's voice
/// call and reports end-of-track events back over the channel.
pub struct SongbirdOutput {
    manager: Arc<Songbird>,
    events: UnboundedSender<TrackEnded>,
}

impl SongbirdOutput {
    pub fn new(manager: Arc<Songbird>, events: UnboundedSender<TrackEnded>) -> Self {
        Self { manager, events }
    }
}

pub struct SongbirdHandle(TrackHandle);

impl AudioHandle for SongbirdHandle {
    fn pause(&self) -> Result<(), AudioError> {
        self.0
            .pause()
            .map_err(|why| AudioError::Control(format!("{why:?}")))
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.0
            .play()
            .map_err(|why| AudioError::Control(format!("{why:?}")))
    }

    fn stop(&self) -> Result<(), AudioError> {
        self.0
            .stop()
            .map_err(|why| AudioError::Control(format!("{why:?}")))
    }
}

#[async_trait]
impl AudioOutput for SongbirdOutput {
    async fn begin(
        &self,
        guild: GuildKey,
        generation: u64,
        url: &str,
    ) -> Result<Box<dyn AudioHandle>, AudioError> {
        let handler_lock = self
            .manager
            .get(GuildId(guild))
            .ok_or(AudioError::NotConnected)?;

        // Opened before taking the call lock; this is the slow part.
        let source = ytdl(url)
            .await
            .map_err(|why| AudioError::Source(format!("{why:?}")))?;

        let mut handler = handler_lock.lock().await;

        handler.stop(); // Just in case something was playing before
        let track_handle = handler.play_source(source);

        track_handle
            .add_event(
                Event::Track(TrackEvent::End),
                TrackEndNotifier {
                    guild,
                    generation,
                    events: self.events.clone(),
                },
            )
            .map_err(|why| AudioError::Control(format!("{why:?}")))?;

        Ok(Box::new(SongbirdHandle(track_handle)))
    }

    async fn disconnect(&self, guild: GuildKey) {
        if let Err(why) = self.manager.remove(GuildId(guild)).await {
            info!("Leaving voice channel for guild {guild} failed: {why:?}");
        }
    }
}

struct TrackEndNotifier {
    guild: GuildKey,
    generation: u64,
    events: UnboundedSender<TrackEnded>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        info!("End notifier triggered for guild {}", self.guild);

        let _ = self.events.send(TrackEnded {
            guild: self.guild,
            generation: self.generation,
        });

        None
    }
}
