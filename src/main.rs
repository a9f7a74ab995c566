use std::env;
use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, EventHandler},
    framework::{
        standard::{
            macros::{command, group},
            Args, CommandError, CommandResult,
        },
        StandardFramework,
    },
    model::{channel::Message, gateway::Ready},
    prelude::GatewayIntents,
};
use serenity::cache::Cache;
use serenity::client::Context;
use serenity::model::application::interaction::message_component::MessageComponentInteraction;
use serenity::model::application::interaction::{Interaction, InteractionResponseType};
use serenity::model::gateway::Activity;
use serenity::model::guild::Guild;
use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::model::prelude::VoiceState;
use songbird::{SerenityInit, Songbird};
use tracing::info;

use crate::config::Config;
use crate::controller::Controller;
use crate::idle::{IdleMonitor, MembershipError, RoomMembership};
use crate::models::PlaybackStatus;
use crate::notify::{check_msg, DiscordNotifier, BUTTON_SKIP, BUTTON_STOP, BUTTON_TOGGLE};
use crate::player::SongbirdOutput;
use crate::resolver::YtDlpResolver;

mod config;
mod controller;
mod idle;
mod models;
mod notify;
mod player;
mod queue;
mod resolver;
#[cfg(test)]
mod testkit;

struct Handler;

pub struct ControllerKey;

impl serenity::prelude::TypeMapKey for ControllerKey {
    type Value = Arc<Controller>;
}

pub struct NotifierKey;

impl serenity::prelude::TypeMapKey for NotifierKey {
    type Value = Arc<DiscordNotifier>;
}

pub struct ConfigKey;

impl serenity::prelude::TypeMapKey for ConfigKey {
    type Value = Config;
}

const NOT_IN_MY_CHANNEL: &str = "You need to be in my voice channel for that";
const NOTHING_PLAYING: &str = "Nothing is playing";
const NOTHING_TO_SKIP: &str = "Nothing to skip";
const ALREADY_STOPPED: &str = "o_O Already stopped";

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        ctx.set_activity(Activity::listening("your requests")).await;
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        // The gateway cleared our own voice state: kicked, moved out, or the
        // channel went away. Drop the session rather than leaving a queue
        // pointed at a dead connection.
        if new.channel_id.is_none() && new.user_id == ctx.cache.current_user_id() {
            if let Some(guild_id) = new.guild_id {
                info!("Bot voice state cleared for guild {guild_id}");
                let controller = controller(&ctx).await;
                controller.session_dropped(guild_id.0).await;
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::MessageComponent(component) = interaction else {
            return;
        };

        let Some(guild_id) = component.guild_id else {
            return;
        };

        if !user_shares_bot_channel(&ctx, guild_id, component.user.id).await {
            respond_ephemeral(&ctx, &component, NOT_IN_MY_CHANNEL).await;
            return;
        }

        let controller = controller(&ctx).await;
        let guild = guild_id.0;

        // Presses that cannot transition anything are answered inline;
        // real transitions are acked here and their outcome lands in the
        // bound text channel.
        let transition = match classify_press(
            component.data.custom_id.as_str(),
            controller.status(guild).await,
        ) {
            PressAction::Transition(transition) => transition,
            PressAction::Reject(reply) => {
                respond_ephemeral(&ctx, &component, reply).await;
                return;
            }
            PressAction::Ignore => {
                info!("Unknown component {}", component.data.custom_id);
                return;
            }
        };

        if let Err(why) = component
            .create_interaction_response(&ctx.http, |r| {
                r.kind(InteractionResponseType::DeferredUpdateMessage)
            })
            .await
        {
            info!("Error acking interaction: {why:?}");
        }

        let handled = match transition {
            Transition::Pause => controller.pause(guild).await,
            Transition::Resume => controller.resume(guild).await,
            Transition::Skip => controller.skip(guild).await,
            Transition::Stop => controller.stop_and_leave(guild).await,
        };

        // The session can vanish between the status read and the transition.
        if !handled {
            check_msg(
                component
                    .create_followup_message(&ctx.http, |m| {
                        m.content(ALREADY_STOPPED).ephemeral(true)
                    })
                    .await,
            );
        }
    }
}

#[group]
#[commands(play, pause, resume, skip, stop, list, help)]
struct General;

#[tokio::main]
async fn main() {
    dotenv().expect(".env file not found");

    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    // Configure the client with your Discord bot token in the environment.
    let token = env::var("DISCORD_TOKEN").expect("Expected a token in the environment");

    let framework = StandardFramework::new()
        .configure(|c| c.prefix("!"))
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();

    let mut client = Client::builder(&token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird_with(songbird.clone())
        .await
        .expect("Err creating client");

    let notifier = Arc::new(DiscordNotifier::new(client.cache_and_http.http.clone()));

    let (end_events, end_receiver) = tokio::sync::mpsc::unbounded_channel();

    let controller = Arc::new(Controller::new(
        Arc::new(YtDlpResolver::new(config.default_search.clone())),
        Arc::new(SongbirdOutput::new(songbird.clone(), end_events)),
        notifier.clone(),
        config.idle_timeout,
    ));

    {
        let mut w = client.data.write().await;
        w.insert::<ControllerKey>(controller.clone());
        w.insert::<NotifierKey>(notifier);
        w.insert::<ConfigKey>(config.clone());
    }

    tokio::spawn(Arc::clone(&controller).run_end_listener(end_receiver));

    let membership = Arc::new(CacheMembership {
        cache: client.cache_and_http.cache.clone(),
        manager: songbird,
    });
    let monitor = IdleMonitor::new(
        controller,
        membership,
        config.idle_check_interval,
        config.membership_fail_open,
    );
    tokio::spawn(monitor.run());

    tokio::spawn(async move {
        let _ = client
            .start()
            .await
            .map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let query = args.message().trim().to_string();
    if query.is_empty() {
        check_msg(msg.reply(ctx, "Give me a URL or something to search for").await);
        return Ok(());
    }

    let guild = get_guild(ctx, msg)?;
    let guild_id = guild.id;

    let caller_channel = guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id);

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    match plan_join(manager.get(guild_id).is_some(), caller_channel) {
        JoinPlan::Connect(connect_to) => {
            let _handler = manager.join(guild_id, connect_to).await;
            deafen(ctx, guild_id).await;
        }
        JoinPlan::AlreadyConnected => {}
        JoinPlan::CallerNotInVoice => {
            check_msg(msg.reply(ctx, "Not in a voice channel").await);
            return Ok(());
        }
    }

    let controller = controller(ctx).await;
    let notifier = {
        let data = ctx.data.read().await;
        data.get::<NotifierKey>()
            .expect("Notifier placed in at initialisation.")
            .clone()
    };

    notifier.bind_channel(guild_id.0, msg.channel_id).await;
    controller.ensure_session(guild_id.0).await;
    controller.request_play(guild_id.0, &query).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if !user_shares_bot_channel(ctx, guild_id, msg.author.id).await {
        check_msg(msg.reply(ctx, NOT_IN_MY_CHANNEL).await);
        return Ok(());
    }

    if !controller(ctx).await.pause(guild_id.0).await {
        check_msg(msg.channel_id.say(&ctx.http, ALREADY_STOPPED).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("unpause")]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if !user_shares_bot_channel(ctx, guild_id, msg.author.id).await {
        check_msg(msg.reply(ctx, NOT_IN_MY_CHANNEL).await);
        return Ok(());
    }

    if !controller(ctx).await.resume(guild_id.0).await {
        check_msg(msg.channel_id.say(&ctx.http, ALREADY_STOPPED).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("next")]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    info!("SKIP - invoked from guild {}", guild_id.0);

    if !user_shares_bot_channel(ctx, guild_id, msg.author.id).await {
        check_msg(msg.reply(ctx, NOT_IN_MY_CHANNEL).await);
        return Ok(());
    }

    if !controller(ctx).await.skip(guild_id.0).await {
        check_msg(msg.channel_id.say(&ctx.http, ALREADY_STOPPED).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if !user_shares_bot_channel(ctx, guild_id, msg.author.id).await {
        check_msg(msg.reply(ctx, NOT_IN_MY_CHANNEL).await);
        return Ok(());
    }

    if !controller(ctx).await.stop_and_leave(guild_id.0).await {
        check_msg(msg.channel_id.say(&ctx.http, ALREADY_STOPPED).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("queue")]
async fn list(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let preview_len = {
        let data = ctx.data.read().await;
        data.get::<ConfigKey>()
            .map(|c| c.queue_preview_len)
            .unwrap_or(10)
    };

    let view = controller(ctx).await.queue_view(guild_id.0, preview_len).await;

    let Some(view) = view else {
        check_msg(msg.channel_id.say(&ctx.http, "The queue is empty!").await);
        return Ok(());
    };

    let mut lines = Vec::with_capacity(view.upcoming.len() + 2);

    match &view.current {
        Some(track) => lines.push(format!("**Now playing**: {}", track.title)),
        None => lines.push("**Now playing**: nothing".to_string()),
    }

    if view.upcoming.is_empty() {
        lines.push("The queue is empty!".to_string());
    } else {
        let titles: Vec<String> = view
            .upcoming
            .iter()
            .enumerate()
            .map(|(index, track)| format!("{} - {}", index + 1, track.title))
            .collect();
        lines.push(format!("**Queue**:\n```{}```", titles.join("\n")));

        if view.total > view.upcoming.len() {
            lines.push(format!("...and {} more tracks", view.total - view.upcoming.len()));
        }
    }

    check_msg(msg.channel_id.say(&ctx.http, lines.join("\n")).await);

    Ok(())
}

#[command]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let message = r#"
**Commands:**
    **play [URL|Title]** - Plays (or adds to the queue) new tracks given a URL or a video title (supports youtube playlists).
    **pause** - Pauses the current track.
    **resume** - Resumes the currently paused track.
    **skip** - Skips to the next track.
    **stop** - Stops playback, clears the queue and leaves the channel.
    **list** - Shows the current track and the queue.
    "#;

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

async fn controller(ctx: &Context) -> Arc<Controller> {
    let data = ctx.data.read().await;
    data.get::<ControllerKey>()
        .expect("Controller placed in at initialisation.")
        .clone()
}

#[derive(Debug, PartialEq, Eq)]
enum JoinPlan {
    Connect(ChannelId),
    AlreadyConnected,
    CallerNotInVoice,
}

/// An existing call is never re-joined, so a caller sitting in another room
/// cannot drag the bot away mid-playback; their track still gets queued.
fn plan_join(already_connected: bool, caller_channel: Option<ChannelId>) -> JoinPlan {
    if already_connected {
        return JoinPlan::AlreadyConnected;
    }

    match caller_channel {
        Some(channel) => JoinPlan::Connect(channel),
        None => JoinPlan::CallerNotInVoice,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Transition {
    Pause,
    Resume,
    Skip,
    Stop,
}

#[derive(Debug, PartialEq, Eq)]
enum PressAction {
    Transition(Transition),
    Reject(&'static str),
    Ignore,
}

fn classify_press(custom_id: &str, status: Option<PlaybackStatus>) -> PressAction {
    match custom_id {
        BUTTON_TOGGLE => match status {
            Some(PlaybackStatus::Playing) => PressAction::Transition(Transition::Pause),
            Some(PlaybackStatus::Paused) => PressAction::Transition(Transition::Resume),
            _ => PressAction::Reject(NOTHING_PLAYING),
        },
        BUTTON_SKIP => match status {
            Some(PlaybackStatus::Playing) | Some(PlaybackStatus::Paused) => {
                PressAction::Transition(Transition::Skip)
            }
            _ => PressAction::Reject(NOTHING_TO_SKIP),
        },
        BUTTON_STOP => match status {
            Some(_) => PressAction::Transition(Transition::Stop),
            None => PressAction::Reject(ALREADY_STOPPED),
        },
        _ => PressAction::Ignore,
    }
}

async fn respond_ephemeral(ctx: &Context, component: &MessageComponentInteraction, content: &str) {
    let result = component
        .create_interaction_response(&ctx.http, |r| {
            r.kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|d| d.content(content).ephemeral(true))
        })
        .await;
    if let Err(why) = result {
        info!("Error replying to interaction: {why:?}");
    }
}

fn shares_channel(bot_channel: Option<u64>, user_channel: Option<u64>) -> bool {
    matches!((bot_channel, user_channel), (Some(bot), Some(user)) if bot == user)
}

/// The authorization predicate: mutating operations are only accepted from
/// users sitting in the same voice channel as the bot.
async fn user_shares_bot_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> bool {
    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let bot_channel = match manager.get(guild_id) {
        Some(call) => call.lock().await.current_channel().map(|c| c.0),
        None => None,
    };

    let user_channel = ctx
        .cache
        .guild(guild_id)
        .and_then(|guild| guild.voice_states.get(&user_id).and_then(|vs| vs.channel_id))
        .map(|c| c.0);

    shares_channel(bot_channel, user_channel)
}

async fn deafen(ctx: &Context, guild_id: GuildId) {
    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let Some(handler_lock) = manager.get(guild_id) else {
        return;
    };

    let mut handler = handler_lock.lock().await;

    if handler.is_deaf() {
        info!("Already deafen!")
    } else if let Err(e) = handler.deafen(true).await {
        info!("Deafen failed due to {e:?}")
    }
}

/// Counts the humans sharing the bot's voice channel, from the gateway
/// cache. Used by the idle monitor only.
struct CacheMembership {
    cache: Arc<Cache>,
    manager: Arc<Songbird>,
}

#[async_trait]
impl RoomMembership for CacheMembership {
    async fn human_members(&self, guild: u64) -> Result<usize, MembershipError> {
        let call = self
            .manager
            .get(GuildId(guild))
            .ok_or(MembershipError::Unavailable)?;

        let channel = call
            .lock()
            .await
            .current_channel()
            .ok_or(MembershipError::Unavailable)?;

        let guild = self
            .cache
            .guild(GuildId(guild))
            .ok_or(MembershipError::Unavailable)?;

        let humans = guild
            .voice_states
            .values()
            .filter(|vs| vs.channel_id.map(|c| c.0) == Some(channel.0))
            // A user missing from the cache counts as human, failing toward
            // keeping the session alive.
            .filter(|vs| !self.cache.user(vs.user_id).map(|u| u.bot).unwrap_or(false))
            .count();

        Ok(humans)
    }
}

fn get_guild(ctx: &Context, msg: &Message) -> Result<Guild, CommandError> {
    msg.guild(&ctx.cache)
        .ok_or(CommandError::from("Guild not found"))
}

fn get_guild_id(ctx: &Context, msg: &Message) -> Result<GuildId, CommandError> {
    let guild_id = get_guild(ctx, msg)?.id;

    Ok(guild_id)
}
