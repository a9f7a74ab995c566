use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serenity::http::Http;
use serenity::model::application::component::ButtonStyle;
use serenity::model::channel::Message;
use serenity::model::id::ChannelId;
use serenity::Result as SerenityResult;
use tokio::sync::Mutex;
use tracing::info;

pub const BUTTON_TOGGLE: &str = "music_toggle";
pub const BUTTON_SKIP: &str = "music_skip";
pub const BUTTON_STOP: &str = "music_stop";

/// One of these is emitted per controller transition; rendering them is the
/// adapter's job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    PlaylistAdded { title: String, count: usize },
    TrackQueued { title: String },
    NowPlaying { title: String },
    QueueEmpty,
    PlaybackError { title: String, reason: String },
    Stopped,
    Paused { title: String },
    Resumed { title: String },
    Skipped,
    NothingToSkip,
    NothingPlaying,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, guild: u64, notification: Notification);
}

/// Renders notifications into the text channel last used to address the bot
/// in each guild. The NowPlaying message carries the control buttons.
pub struct DiscordNotifier {
    http: Arc<Http>,
    channels: Mutex<HashMap<u64, ChannelId>>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Remembers where a guild's notifications should go.
    pub async fn bind_channel(&self, guild: u64, channel: ChannelId) {
        self.channels.lock().await.insert(guild, channel);
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, guild: u64, notification: Notification) {
        let channel = self.channels.lock().await.get(&guild).copied();

        let Some(channel) = channel else {
            info!("No channel bound for guild {guild}, dropping {notification:?}");
            return;
        };

        if let Notification::NowPlaying { title } = &notification {
            let result = channel
                .send_message(&self.http, |m| {
                    m.content(format!("🎵 Now playing: **{title}**")).components(|c| {
                        c.create_action_row(|row| {
                            row.create_button(|b| {
                                b.custom_id(BUTTON_TOGGLE)
                                    .style(ButtonStyle::Primary)
                                    .emoji('⏯')
                                    .label("Play/Pause")
                            })
                            .create_button(|b| {
                                b.custom_id(BUTTON_SKIP)
                                    .style(ButtonStyle::Success)
                                    .emoji('⏭')
                                    .label("Next")
                            })
                            .create_button(|b| {
                                b.custom_id(BUTTON_STOP)
                                    .style(ButtonStyle::Danger)
                                    .emoji('⏹')
                                    .label("Stop")
                            })
                        })
                    })
                })
                .await;

            check_msg(result);
        } else {
            check_msg(channel.say(&self.http, render(&notification)).await);
        }
    }
}

fn render(notification: &Notification) -> String {
    match notification {
        Notification::PlaylistAdded { title, count } => {
            format!("🎵 Playlist added: **{title}** ({count} tracks)")
        }
        Notification::TrackQueued { title } => format!("🎶 Added to queue: **{title}**"),
        Notification::NowPlaying { title } => format!("🎵 Now playing: **{title}**"),
        Notification::QueueEmpty => "🎶 The queue is empty".to_string(),
        Notification::PlaybackError { title, reason } => {
            format!("❌ Could not play {title} due to error {reason}")
        }
        Notification::Stopped => "⏹ Playback stopped".to_string(),
        Notification::Paused { title } => format!("⏸ Paused: {title}"),
        Notification::Resumed { title } => format!("▶️ Resumed: {title}"),
        Notification::Skipped => "⏭ Skipped".to_string(),
        Notification::NothingToSkip => "🚫 Nothing to skip".to_string(),
        Notification::NothingPlaying => "🚫 Nothing is playing".to_string(),
    }
}

/// Checks that a message successfully sent; if not, then logs why to stdout.
pub fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}
