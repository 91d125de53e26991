//! Room lifecycle: start, end, cleanup, and runtime integrity checks.

use crate::RoomCtx;
use crate::engine::RpEngine;
use crate::error::{Result, RoomError};
use crate::lock::pid_alive;
use crate::room::{
    ActiveRoomEntry, CleanupReport, HealthReport, Room, RoomKind, RoomSettings, WorldInfo,
};

impl RpEngine {
    /// Open a room for the channel. Fails with `RoomError::AlreadyActive`
    /// when a non-closed room already exists for the key.
    pub fn start_room(
        &self,
        ctx: &RoomCtx,
        title: &str,
        kind: RoomKind,
        opening: &str,
        parent_channel_id: &str,
    ) -> Result<String> {
        // Pre-clean stale index/cache entries before creating a new room.
        // Best-effort: a cleanup failure must not block the start.
        if let Err(error) = self.cleanup_non_active_rooms() {
            tracing::warn!(%error, "pre-start cleanup failed");
        }

        let key = ctx.room_key();
        if let Some(existing) = self.store().load_room(&key)
            && existing.is_active
        {
            return Err(RoomError::AlreadyActive.into());
        }

        let now = crate::now_iso();
        let room = Room {
            id: key.clone(),
            title: title.trim().to_string(),
            kind,
            parent_channel_id: parent_channel_id.trim().to_string(),
            owner_id: ctx.user_id.clone(),
            participants: vec![ctx.user_id.clone()],
            history: Vec::new(),
            opening: opening.trim().to_string(),
            world: WorldInfo::default(),
            settings: RoomSettings {
                // Brand-new thread keys have no prefs yet; inherit from the
                // parent channel so the alias survives thread creation.
                user_alias: self
                    .alias()
                    .alias_for_with_parent(ctx, &ctx.user_id, parent_channel_id),
                ..RoomSettings::default()
            },
            recent_message_ids: Vec::new(),
            temp: serde_json::Map::new(),
            is_active: true,
            created_at: now.clone(),
            updated_at: now,
            closed_at: None,
        };
        self.store().save_room(&room)?;
        self.set_active_room(ctx, &room)?;

        self.store().append_transcript_line(&key, "")?;
        self.store().append_transcript_line(&key, "---")?;
        let heading = if room.title.is_empty() { "RP" } else { &room.title };
        self.store().append_transcript_line(&key, heading)?;
        if !room.opening.is_empty() && room.opening != room.title {
            self.store().append_transcript_line(&key, &room.opening)?;
        }

        tracing::info!(room = %key, owner = %ctx.user_id, "room started");
        Ok("RP 시작했어. 이제 그냥 채팅하면 돼.".to_string())
    }

    /// Close the channel's room. Fails with `RoomError::NoActiveRoom` when
    /// there is nothing to close; a second call on the same room fails the
    /// same way and leaves `closed_at` untouched.
    pub fn end_room(&self, ctx: &RoomCtx) -> Result<String> {
        let key = ctx.room_key();
        let Some(mut room) = self.store().load_room(&key) else {
            return Err(RoomError::NoActiveRoom.into());
        };
        if !room.is_active {
            return Err(RoomError::NoActiveRoom.into());
        }

        let now = crate::now_iso();
        room.is_active = false;
        room.closed_at = Some(now.clone());
        room.updated_at = now;
        room.recent_message_ids.clear();
        room.temp.clear();
        self.store().save_room(&room)?;

        self.clear_active_room(&key)?;
        self.drop_legacy_cache_entry(&key)?;
        self.store().append_transcript_line(&key, "")?;

        tracing::info!(room = %key, "room closed");
        Ok("RP 종료했어.".to_string())
    }

    pub fn is_room_active(&self, ctx: &RoomCtx) -> bool {
        self.store()
            .load_room(&ctx.room_key())
            .is_some_and(|room| room.is_active)
    }

    /// Fast-path membership check against the index, without opening any
    /// room document.
    pub fn is_active_room_channel(&self, channel_id: &str) -> bool {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            return false;
        }
        self.store()
            .load_active_index()
            .values()
            .any(|entry| entry.channel_id == channel_id)
    }

    /// Most recently updated active child room under a parent channel owned
    /// by `owner_id`. Fallback target for closing from the parent channel.
    pub fn find_recent_child_room(
        &self,
        parent_channel_id: &str,
        owner_id: &str,
    ) -> Option<(String, ActiveRoomEntry)> {
        self.store()
            .load_active_index()
            .into_iter()
            .filter(|(_, entry)| {
                entry.parent_channel_id == parent_channel_id && entry.owner_id == owner_id
            })
            .max_by(|(_, a), (_, b)| a.updated_at.cmp(&b.updated_at))
    }

    /// Non-destructive cleanup: prune cache entries whose key is not in the
    /// active set and repair the alias-preferences allowlist skeleton. Room
    /// documents and transcripts are never deleted.
    pub fn cleanup_non_active_rooms(&self) -> Result<CleanupReport> {
        let active = self.store().load_active_index();
        let active_keys: Vec<&String> = active.keys().collect();

        let cache = self.store().load_legacy_cache();
        let before = cache.len();
        let pruned: std::collections::BTreeMap<_, _> = cache
            .into_iter()
            .filter(|(key, _)| active_keys.iter().any(|active_key| *active_key == key))
            .collect();
        let cache_pruned = before.saturating_sub(pruned.len());
        if cache_pruned > 0 {
            self.store().save_legacy_cache(&pruned)?;
        }

        let mut prefs = self.store().load_prefs();
        let allowlist = self.config().protected_pref_keys();
        if prefs.seed_allowlist_keys(&allowlist) {
            prefs.ensure_protection_metadata(&allowlist);
            self.store().save_prefs(&prefs)?;
        }

        let room_keys = self.store().room_keys();
        let stale_channel_ids: Vec<String> = room_keys
            .iter()
            .filter(|key| !active.contains_key(*key))
            .filter_map(|key| key.strip_prefix("discord_"))
            .map(String::from)
            .collect();

        Ok(CleanupReport {
            active_count: active.len(),
            preserved_json_count: room_keys.len(),
            preserved_md_count: self.store().transcript_count(),
            cache_pruned,
            stale_channel_ids,
        })
    }

    /// Scan the active index and the runtime lock for integrity violations.
    /// With `recover=false` this is side-effect-free and safe to call
    /// unboundedly often; with `recover=true` dangling index entries are
    /// removed and a stale lock is deleted.
    pub fn runtime_healthcheck(&self, recover: bool) -> Result<HealthReport> {
        let mut index = self.store().load_active_index();
        let mut issues = Vec::new();
        let mut recovered = Vec::new();

        let keys: Vec<String> = index.keys().cloned().collect();
        for key in keys {
            let entry = &index[&key];
            if entry.channel_id.trim().is_empty() {
                issues.push(format!("{key}: missing channel_id"));
                if recover {
                    index.remove(&key);
                    recovered.push(key);
                }
                continue;
            }

            let dangling = match self.store().load_room(&key) {
                Some(room) => !room.is_active,
                None => true,
            };
            if dangling {
                issues.push(format!("{key}: dangling active index"));
                if recover {
                    index.remove(&key);
                    recovered.push(key);
                }
            }
        }

        if recover && !recovered.is_empty() {
            self.store().save_active_index(&index)?;
        }

        let mut lock_ok = true;
        if let Some(lock) = self.store().load_lock()
            && !pid_alive(lock.pid)
        {
            lock_ok = false;
            issues.push("runtime lock is stale".to_string());
            if recover {
                self.store().remove_lock()?;
            }
        }

        Ok(HealthReport {
            ok: issues.is_empty(),
            issues,
            recovered,
            lock_ok,
        })
    }

    /// Write-through registration of a room in the active index.
    pub(crate) fn set_active_room(&self, ctx: &RoomCtx, room: &Room) -> Result<()> {
        let mut index = self.store().load_active_index();
        index.insert(
            room.id.clone(),
            ActiveRoomEntry {
                platform: ctx.platform.clone(),
                channel_id: ctx.channel_id.clone(),
                parent_channel_id: room.parent_channel_id.clone(),
                scope: "room-only".to_string(),
                title: room.title.clone(),
                kind: room.kind,
                owner_id: room.owner_id.clone(),
                updated_at: crate::now_iso(),
            },
        );
        self.store().save_active_index(&index)
    }

    fn clear_active_room(&self, key: &str) -> Result<()> {
        let mut index = self.store().load_active_index();
        if index.remove(key).is_some() {
            self.store().save_active_index(&index)?;
        }
        Ok(())
    }

    fn drop_legacy_cache_entry(&self, key: &str) -> Result<()> {
        let mut cache = self.store().load_legacy_cache();
        if cache.remove(key).is_some() {
            self.store().save_legacy_cache(&cache)?;
        }
        Ok(())
    }
}
