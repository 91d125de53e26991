//! Message ingestion: dedup by message id and history append.

use crate::RoomCtx;
use crate::engine::RpEngine;
use crate::error::Result;
use crate::room::Turn;

impl RpEngine {
    /// Admit an inbound chat turn into the room's history.
    ///
    /// Returns `false` with no mutation when the text is blank, the room is
    /// missing or inactive, or the message id is already in the room's
    /// recent-id ring. The ring is the crash-safe dedup layer; the client
    /// boundary keeps its own coarser in-memory set.
    pub fn ingest_plain_chat(
        &self,
        ctx: &RoomCtx,
        text: &str,
        message_id: &str,
        speaker_name: &str,
    ) -> Result<bool> {
        let content = text.trim();
        if content.is_empty() {
            return Ok(false);
        }

        let key = ctx.room_key();
        let Some(mut room) = self.store().load_room(&key) else {
            return Ok(false);
        };
        if !room.is_active {
            return Ok(false);
        }

        let message_id = message_id.trim();
        if !message_id.is_empty() {
            if room.recent_message_ids.iter().any(|id| id == message_id) {
                tracing::debug!(room = %key, message_id, "duplicate message id ignored");
                return Ok(false);
            }
            room.recent_message_ids.push(message_id.to_string());
            let len = room.recent_message_ids.len();
            if len > crate::MAX_RECENT_MESSAGE_IDS {
                room.recent_message_ids
                    .drain(..len - crate::MAX_RECENT_MESSAGE_IDS);
            }
        }

        if !room.participants.iter().any(|p| p == &ctx.user_id) {
            room.participants.push(ctx.user_id.clone());
        }

        let turn = Turn {
            user_id: ctx.user_id.clone(),
            speaker_name: speaker_name.trim().to_string(),
            text: content.to_string(),
            at: crate::now_iso(),
            message_id: message_id.to_string(),
        };
        room.history.push(turn);
        let len = room.history.len();
        if len > crate::MAX_HISTORY {
            room.history.drain(..len - crate::MAX_HISTORY);
        }
        room.updated_at = crate::now_iso();

        self.store().save_room(&room)?;
        self.set_active_room(ctx, &room)?;

        let mut speaker = speaker_name.trim().to_string();
        if speaker.is_empty() {
            speaker = self.alias().alias_for(ctx, &ctx.user_id);
        }
        if speaker.is_empty() {
            speaker = "상대".to_string();
        }
        self.store()
            .append_transcript_line(&key, &format!("{speaker}: {content}"))?;

        Ok(true)
    }

    /// Record the bot's own reply in the room, bypassing the inbound dedup
    /// path. Replies are history turns too, but they are never admitted
    /// through `ingest_plain_chat`.
    pub fn record_bot_turn(&self, ctx: &RoomCtx, bot_name: &str, text: &str) -> Result<()> {
        let key = ctx.room_key();
        let Some(mut room) = self.store().load_room(&key) else {
            return Ok(());
        };
        if !room.is_active {
            return Ok(());
        }

        room.history.push(Turn {
            user_id: String::new(),
            speaker_name: bot_name.to_string(),
            text: text.to_string(),
            at: crate::now_iso(),
            message_id: String::new(),
        });
        let len = room.history.len();
        if len > crate::MAX_HISTORY {
            room.history.drain(..len - crate::MAX_HISTORY);
        }
        room.updated_at = crate::now_iso();
        self.store().save_room(&room)?;
        self.store()
            .append_transcript_line(&key, &format!("{bot_name}: {text}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::RoomCtx;
    use crate::config::{Config, CueConfig, LlmConfig, SafetyStyle};
    use crate::engine::RpEngine;
    use crate::room::{RoomKind, RoomStore};

    use std::sync::Arc;

    fn engine() -> (tempfile::TempDir, RpEngine) {
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
        let store = RoomStore::new(config.rooms_dir());
        (dir, RpEngine::with_store(store, config))
    }

    fn ctx(user: &str) -> RoomCtx {
        RoomCtx::new("discord", "100", user)
    }

    #[test]
    fn blank_or_roomless_messages_are_rejected() {
        let (_dir, engine) = engine();
        assert!(!engine.ingest_plain_chat(&ctx("u1"), "   ", "m1", "").unwrap());
        assert!(!engine.ingest_plain_chat(&ctx("u1"), "hello", "m1", "").unwrap());
    }

    #[test]
    fn duplicate_message_id_leaves_history_unchanged() {
        let (_dir, engine) = engine();
        let ctx = ctx("u1");
        engine
            .start_room(&ctx, "t", RoomKind::Thread, "", "")
            .unwrap();

        assert!(engine.ingest_plain_chat(&ctx, "first", "m1", "u-one").unwrap());
        assert!(!engine.ingest_plain_chat(&ctx, "again", "m1", "u-one").unwrap());

        let room = engine.store().load_room(&ctx.room_key()).unwrap();
        assert_eq!(room.history.len(), 1);
        assert_eq!(room.history[0].text, "first");
    }

    #[test]
    fn recent_id_ring_evicts_oldest() {
        let (_dir, engine) = engine();
        let ctx = ctx("u1");
        engine
            .start_room(&ctx, "t", RoomKind::Thread, "", "")
            .unwrap();

        for i in 0..(crate::MAX_RECENT_MESSAGE_IDS + 3) {
            assert!(engine
                .ingest_plain_chat(&ctx, &format!("msg {i}"), &format!("m{i}"), "")
                .unwrap());
        }
        let room = engine.store().load_room(&ctx.room_key()).unwrap();
        assert_eq!(room.recent_message_ids.len(), crate::MAX_RECENT_MESSAGE_IDS);
        assert!(!room.recent_message_ids.contains(&"m0".to_string()));

        // an evicted id is admissible again — the ring is bounded, not global
        assert!(engine.ingest_plain_chat(&ctx, "msg 0 again", "m0", "").unwrap());
    }

    #[test]
    fn new_speaker_joins_participants() {
        let (_dir, engine) = engine();
        let owner = ctx("u1");
        engine
            .start_room(&owner, "t", RoomKind::Thread, "", "")
            .unwrap();
        engine
            .ingest_plain_chat(&ctx("u2"), "hi", "m1", "second")
            .unwrap();

        let room = engine.store().load_room(&owner.room_key()).unwrap();
        assert_eq!(room.participants, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[test]
    fn inactive_room_rejects_ingest() {
        let (_dir, engine) = engine();
        let ctx = ctx("u1");
        engine
            .start_room(&ctx, "t", RoomKind::Thread, "", "")
            .unwrap();
        engine.end_room(&ctx).unwrap();
        assert!(!engine.ingest_plain_chat(&ctx, "hello", "m1", "").unwrap());
    }

    #[test]
    fn transcript_line_uses_speaker_then_alias_fallback() {
        let (_dir, engine) = engine();
        let ctx = ctx("u1");
        engine
            .start_room(&ctx, "t", RoomKind::Thread, "", "")
            .unwrap();
        engine.alias().set_alias(&ctx, "용사", "u1").unwrap();
        engine.ingest_plain_chat(&ctx, "간다", "m1", "").unwrap();

        let raw =
            std::fs::read_to_string(engine.store().transcript_path(&ctx.room_key())).unwrap();
        assert!(raw.lines().any(|line| line == "용사: 간다"));
    }

    #[test]
    fn bot_turn_is_recorded_outside_ingest_dedup() {
        let (_dir, engine) = engine();
        let ctx = ctx("u1");
        engine
            .start_room(&ctx, "t", RoomKind::Thread, "", "")
            .unwrap();
        engine.ingest_plain_chat(&ctx, "안녕", "m1", "u-one").unwrap();
        engine.record_bot_turn(&ctx, "RP", "*문을 연다*").unwrap();

        let room = engine.store().load_room(&ctx.room_key()).unwrap();
        assert_eq!(room.history.len(), 2);
        assert_eq!(room.history[1].speaker_name, "RP");
        // bot turns never occupy the dedup ring
        assert_eq!(room.recent_message_ids.len(), 1);
    }
}
