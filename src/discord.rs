//! Discord gateway runtime: event handler, command dispatch, and the
//! per-room reply pipeline.

use crate::commands::{Command, GUIDE_TEXT, HELP_TEXT};
use crate::config::Config;
use crate::dedup::SeenMessages;
use crate::engage::{self, Decision, EngageSignals};
use crate::engine::RpEngine;
use crate::error::{Error, Result, RoomError};
use crate::llm::{GeminiClient, OocVerdict, ReplyGenerator};
use crate::room::RoomKind;
use crate::RoomCtx;

use serenity::async_trait;
use serenity::builder::{CreateThread, EditThread};
use serenity::model::channel::{Channel, ChannelType, Message};
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::prelude::*;

use anyhow::Context as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as TokioMutex;

const PLATFORM: &str = "discord";
const DEFAULT_THREAD_NAME: &str = "RP";

/// Where a message physically arrived, as far as room placement cares.
struct ChannelPlace {
    /// Thread parent, present only when the message is inside a thread.
    thread_parent: Option<String>,
    is_dm: bool,
}

pub struct Handler {
    engine: RpEngine,
    generator: ReplyGenerator,
    config: Arc<Config>,
    seen: StdMutex<SeenMessages>,
    /// Per-room-key mutexes so turns in one room serialize while unrelated
    /// rooms proceed concurrently.
    room_locks: TokioMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl Handler {
    pub fn new(engine: RpEngine, generator: ReplyGenerator, config: Arc<Config>) -> Self {
        Self {
            engine,
            generator,
            config,
            seen: StdMutex::new(SeenMessages::default()),
            room_locks: TokioMutex::new(HashMap::new()),
        }
    }

    async fn room_lock(&self, key: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.room_locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Forget a closed room's serialization lock so the map doesn't grow
    /// for the process lifetime. In-flight holders keep their `Arc`.
    async fn drop_room_lock(&self, key: &str) {
        self.room_locks.lock().await.remove(key);
    }

    /// Classify the arrival channel. Unresolvable guild channels are
    /// treated as plain channels.
    async fn place_of(&self, ctx: &Context, msg: &Message) -> ChannelPlace {
        if msg.guild_id.is_none() {
            return ChannelPlace {
                thread_parent: None,
                is_dm: true,
            };
        }
        let thread_parent = match msg.channel_id.to_channel(ctx).await {
            Ok(Channel::Guild(channel)) => match channel.kind {
                ChannelType::PublicThread
                | ChannelType::PrivateThread
                | ChannelType::NewsThread => channel.parent_id.map(|id| id.to_string()),
                _ => None,
            },
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(%error, channel_id = %msg.channel_id, "channel lookup failed");
                None
            }
        };
        ChannelPlace {
            thread_parent,
            is_dm: false,
        }
    }

    /// Channel allowlist gate for command handling. Threads pass when their
    /// parent is allowed; an empty allowlist allows everything.
    fn channel_allowed(&self, channel_id: &str, place: &ChannelPlace) -> bool {
        if place.is_dm || self.config.allowed_channel_ids.is_empty() {
            return true;
        }
        let allowed = &self.config.allowed_channel_ids;
        allowed.iter().any(|id| id == channel_id)
            || place
                .thread_parent
                .as_deref()
                .is_some_and(|parent| allowed.iter().any(|id| id == parent))
    }

    async fn dispatch_command(
        &self,
        ctx: &Context,
        msg: &Message,
        command: Command,
        place: &ChannelPlace,
    ) -> Result<()> {
        match command {
            Command::Guide { pin } => {
                let sent = msg
                    .channel_id
                    .say(&ctx.http, GUIDE_TEXT)
                    .await
                    .context("failed to send guide")?;
                if pin
                    && let Err(error) = sent.pin(&ctx.http).await
                {
                    tracing::warn!(%error, "failed to pin guide message");
                }
            }
            Command::Start { topic } => self.handle_start(ctx, msg, &topic, place).await?,
            Command::End => self.handle_end(ctx, msg, place).await?,
            Command::SetAlias { alias } => {
                let room_ctx = self.ctx_for(msg);
                self.engine
                    .alias()
                    .set_alias(&room_ctx, &alias, &msg.author.id.to_string())?;
                let reply = if alias.is_empty() {
                    "호칭을 해제했어.".to_string()
                } else {
                    format!("이제 '{alias}'라고 부를게.")
                };
                msg.channel_id
                    .say(&ctx.http, reply)
                    .await
                    .context("failed to send alias ack")?;
            }
            Command::WhoAmI => {
                let room_ctx = self.ctx_for(msg);
                let speaker = msg.author.id.to_string();
                let alias = match &place.thread_parent {
                    Some(parent) => {
                        self.engine
                            .alias()
                            .alias_for_with_parent(&room_ctx, &speaker, parent)
                    }
                    None => self.engine.alias().alias_for(&room_ctx, &speaker),
                };
                let reply = if alias.is_empty() {
                    "설정된 호칭이 없어. `!rp 이름 [호칭]`으로 정할 수 있어.".to_string()
                } else {
                    format!("지금 호칭은 '{alias}'야.")
                };
                msg.channel_id
                    .say(&ctx.http, reply)
                    .await
                    .context("failed to send alias report")?;
            }
            Command::Help => {
                msg.channel_id
                    .say(&ctx.http, HELP_TEXT)
                    .await
                    .context("failed to send help")?;
            }
        }
        Ok(())
    }

    /// Start a room. Plain guild channels get a fresh thread first; DMs and
    /// existing threads start in place.
    async fn handle_start(
        &self,
        ctx: &Context,
        msg: &Message,
        topic: &str,
        place: &ChannelPlace,
    ) -> Result<()> {
        let (room_ctx, kind, parent, target_channel) = if place.is_dm {
            (self.ctx_for(msg), RoomKind::Dm, String::new(), msg.channel_id)
        } else if let Some(parent) = &place.thread_parent {
            (self.ctx_for(msg), RoomKind::Thread, parent.clone(), msg.channel_id)
        } else {
            let name = if topic.is_empty() {
                DEFAULT_THREAD_NAME.to_string()
            } else {
                topic.chars().take(90).collect()
            };
            let thread = msg
                .channel_id
                .create_thread_from_message(&ctx.http, msg.id, CreateThread::new(name))
                .await
                .context("failed to create thread")?;
            let room_ctx = RoomCtx::new(
                PLATFORM,
                thread.id.to_string(),
                msg.author.id.to_string(),
            );
            (
                room_ctx,
                RoomKind::Thread,
                msg.channel_id.to_string(),
                thread.id,
            )
        };

        let ack = match self
            .engine
            .start_room(&room_ctx, topic, kind, topic, &parent)
        {
            Ok(ack) => ack,
            Err(Error::Room(RoomError::AlreadyActive)) => {
                msg.channel_id
                    .say(
                        &ctx.http,
                        "이미 진행 중인 RP가 있어. 먼저 `!rp 끝`으로 종료해줘.",
                    )
                    .await
                    .context("failed to send already-active notice")?;
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        target_channel
            .say(&ctx.http, ack)
            .await
            .context("failed to send start ack")?;

        // Best-effort generated opening. Empty output means no opening.
        let speaker = msg.author.id.to_string();
        let alias = self
            .engine
            .alias()
            .alias_for_with_parent(&room_ctx, &speaker, &parent);
        let alias = if alias.is_empty() {
            msg.author.display_name().to_string()
        } else {
            alias
        };
        let typing = target_channel.start_typing(&ctx.http);
        let opening = self.generator.generate_opening(&alias, topic).await;
        drop(typing);
        if !opening.is_empty() {
            target_channel
                .say(&ctx.http, &opening)
                .await
                .context("failed to send opening")?;
            self.engine
                .record_bot_turn(&room_ctx, &self.config.bot_name, &opening)?;
        }
        Ok(())
    }

    /// End a room. When the current channel has none, fall back to the
    /// caller's most recently updated child room under this channel.
    async fn handle_end(&self, ctx: &Context, msg: &Message, place: &ChannelPlace) -> Result<()> {
        let here = self.ctx_for(msg);
        let here_key = here.room_key();
        let (room_ctx, room_channel) = if self.engine.is_room_active(&here) {
            (here, msg.channel_id)
        } else {
            let fallback = self
                .engine
                .find_recent_child_room(&msg.channel_id.to_string(), &msg.author.id.to_string());
            match fallback {
                Some((_, entry)) => {
                    let channel: u64 = entry
                        .channel_id
                        .parse()
                        .ok()
                        .filter(|id| *id != 0)
                        .ok_or(Error::Room(RoomError::NoActiveRoom))?;
                    (
                        RoomCtx::new(PLATFORM, entry.channel_id, msg.author.id.to_string()),
                        serenity::model::id::ChannelId::new(channel),
                    )
                }
                None => {
                    msg.channel_id
                        .say(&ctx.http, "진행 중인 RP가 없어.")
                        .await
                        .context("failed to send no-room notice")?;
                    return Ok(());
                }
            }
        };

        // The fallback targets a different key than the one the dispatcher
        // locked; serialize against that room's traffic too. The in-place
        // case is already covered by the dispatcher's lock.
        let target_key = room_ctx.room_key();
        let child_lock = if target_key != here_key {
            Some(self.room_lock(&target_key).await)
        } else {
            None
        };
        let _child_guard = match &child_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let ack = match self.engine.end_room(&room_ctx) {
            Ok(ack) => ack,
            Err(Error::Room(RoomError::NoActiveRoom)) => {
                msg.channel_id
                    .say(&ctx.http, "진행 중인 RP가 없어.")
                    .await
                    .context("failed to send no-room notice")?;
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        self.drop_room_lock(&target_key).await;
        msg.channel_id
            .say(&ctx.http, ack)
            .await
            .context("failed to send end ack")?;

        // Archive the thread so closed scenes leave the channel list.
        if !place.is_dm
            && let Err(error) = room_channel
                .edit_thread(&ctx.http, EditThread::new().archived(true))
                .await
        {
            tracing::debug!(%error, "thread archive skipped");
        }
        Ok(())
    }

    /// The in-room message path: disengagement decision, ingestion, then
    /// generation with the OOC gate.
    async fn handle_room_message(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let room_ctx = self.ctx_for(msg);
        let key = room_ctx.room_key();

        let lock = self.room_lock(&key).await;
        let _guard = lock.lock().await;

        let Some(room) = self.engine.store().load_room(&key) else {
            return Ok(());
        };
        if !room.is_active {
            return Ok(());
        }

        let bot_id = ctx.cache.current_user().id;
        let mentions_me = msg.mentions_me(ctx).await.unwrap_or(false);
        let signals = EngageSignals {
            suppressed: room.is_suppressed(),
            direct_call: mentions_me || engage::name_match(&msg.content, &self.config.bot_name),
            step_back_cue: engage::has_step_back_cue(&msg.content, &self.config.cues),
            mentions_other_participant: msg.mentions.iter().any(|user| {
                user.id != bot_id && !user.bot && room.participants.contains(&user.id.to_string())
            }),
            participant_count: room.participants.len(),
        };
        let decision = engage::decide(signals);

        if let Some(suppressed) = decision.suppression_transition() {
            let mut room = room;
            room.set_suppressed(suppressed);
            self.engine.store().save_room(&room)?;
        }

        let speaker_name = msg.author.display_name().to_string();
        let ingested = self.engine.ingest_plain_chat(
            &room_ctx,
            &msg.content,
            &msg.id.to_string(),
            &speaker_name,
        )?;
        if !ingested {
            return Ok(());
        }

        match decision {
            Decision::StaySilent => return Ok(()),
            Decision::WithdrawFarewell => {
                msg.channel_id
                    .say(&ctx.http, engage::FAREWELL_ACK)
                    .await
                    .context("failed to send farewell ack")?;
                return Ok(());
            }
            Decision::WithdrawThirdParty => {
                msg.channel_id
                    .say(&ctx.http, engage::WITHDRAW_ACK)
                    .await
                    .context("failed to send withdrawal ack")?;
                return Ok(());
            }
            Decision::Resume | Decision::Engage => {}
        }

        // Reload to pick up the just-ingested turn.
        let Some(room) = self.engine.store().load_room(&key) else {
            return Ok(());
        };

        let speaker = msg.author.id.to_string();
        let alias =
            self.engine
                .alias()
                .alias_for_with_parent(&room_ctx, &speaker, &room.parent_channel_id);
        let user_display = if alias.is_empty() { speaker_name } else { alias };

        let typing = msg.channel_id.start_typing(&ctx.http);
        let reply = self.generator.reply_for_room(&room, &user_display).await;
        let reply = if reply.is_empty() {
            reply
        } else {
            let recent: Vec<String> = room
                .history
                .iter()
                .rev()
                .take(10)
                .rev()
                .map(|turn| format!("{}: {}", turn.speaker_name, turn.text))
                .collect();
            match self.generator.judge_ooc(&reply, &recent.join("\n")).await {
                Ok(OocVerdict::Unsafe) => {
                    tracing::info!(room = %key, "dropping out-of-character reply");
                    String::new()
                }
                Ok(OocVerdict::Safe) => reply,
                // Fail open: an unavailable classifier never blocks a reply.
                Err(error) => {
                    tracing::debug!(%error, "ooc classifier unavailable, delivering reply");
                    reply
                }
            }
        };
        drop(typing);

        if reply.is_empty() {
            return Ok(());
        }
        msg.channel_id
            .say(&ctx.http, &reply)
            .await
            .context("failed to send reply")?;
        self.engine
            .record_bot_turn(&room_ctx, &self.config.bot_name, &reply)?;
        Ok(())
    }

    fn ctx_for(&self, msg: &Message) -> RoomCtx {
        RoomCtx::new(
            PLATFORM,
            msg.channel_id.to_string(),
            msg.author.id.to_string(),
        )
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        // Client-boundary dedup, independent of the per-room persisted ring.
        {
            let mut seen = self.seen.lock().expect("seen set poisoned");
            if seen.check_and_insert(&msg.id.to_string()) {
                return;
            }
        }

        let place = self.place_of(&ctx, &msg).await;
        let channel_id = msg.channel_id.to_string();

        if let Some(command) = Command::parse(&msg.content) {
            if !self.channel_allowed(&channel_id, &place) {
                return;
            }
            // Commands write the same documents as the message path, so
            // they serialize under the same per-room lock.
            let lock = self.room_lock(&self.ctx_for(&msg).room_key()).await;
            let _guard = lock.lock().await;
            if let Err(error) = self.dispatch_command(&ctx, &msg, command, &place).await {
                tracing::error!(%error, channel_id = %channel_id, "command handling failed");
                let _ = msg
                    .channel_id
                    .say(&ctx.http, "명령 처리 중 문제가 생겼어. 잠시 뒤에 다시 시도해줘.")
                    .await;
            }
            return;
        }

        if !self.engine.is_active_room_channel(&channel_id) {
            return;
        }
        if let Err(error) = self.handle_room_message(&ctx, &msg).await {
            tracing::error!(%error, channel_id = %channel_id, "room message handling failed");
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "discord gateway connected");
    }
}

/// Build the generation pipeline and run the gateway client until shutdown.
pub async fn run(config: Arc<Config>, engine: RpEngine) -> Result<()> {
    let token = config.require_discord_token()?.to_string();
    let backend = GeminiClient::new(&config.llm)?;
    let generator = ReplyGenerator::new(Arc::new(backend), config.clone());
    let handler = Handler::new(engine, generator, config);

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        .await
        .context("failed to build discord client")?;
    client.start().await.context("discord gateway error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CueConfig, LlmConfig, SafetyStyle};
    use crate::error::ProviderError;
    use crate::llm::CompletionBackend;

    struct NoBackend;

    #[async_trait]
    impl CompletionBackend for NoBackend {
        async fn complete(&self, _prompt: &str) -> std::result::Result<String, ProviderError> {
            Err(ProviderError::EmptyText)
        }
    }

    fn handler() -> (tempfile::TempDir, Handler) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            data_dir: dir.path().to_path_buf(),
            discord_token: None,
            bot_name: "RP".into(),
            llm: LlmConfig {
                api_key: None,
                model: "gemini-2.5-flash".into(),
                temperature: 0.9,
                max_output_tokens: None,
                timeout_secs: 20,
            },
            allowed_channel_ids: Vec::new(),
            safety_style: SafetyStyle::Default,
            cues: CueConfig::default(),
        });
        let engine = RpEngine::new(config.clone());
        let generator = ReplyGenerator::new(Arc::new(NoBackend), config.clone());
        (dir, Handler::new(engine, generator, config))
    }

    #[tokio::test]
    async fn room_lock_is_shared_per_key() {
        let (_dir, handler) = handler();
        let a = handler.room_lock("discord_100").await;
        let b = handler.room_lock("discord_100").await;
        let other = handler.room_lock("discord_200").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        // a held guard excludes the same room but not an unrelated one
        let _guard = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(other.try_lock().is_ok());
    }

    #[tokio::test]
    async fn closed_room_lock_is_pruned() {
        let (_dir, handler) = handler();
        let before = handler.room_lock("discord_100").await;
        handler.drop_room_lock("discord_100").await;
        let after = handler.room_lock("discord_100").await;
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
