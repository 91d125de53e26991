//! Per-channel display alias preferences.
//!
//! Aliases resolve per-speaker override first, then the channel default,
//! then empty (callers fall back to the platform display name). Threads
//! inherit a missing speaker alias from their parent channel on first
//! lookup, copied through rather than linked live.

use crate::RoomCtx;
use crate::error::Result;
use crate::room::RoomStore;

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, BTreeSet};

/// One channel's alias entry in the preferences document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_alias: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alias_by_user: BTreeMap<String, String>,
}

impl ChannelPrefs {
    pub fn is_empty(&self) -> bool {
        self.user_alias.is_none() && self.alias_by_user.is_empty()
    }
}

/// The whole `_room_prefs.json` document: channel key → prefs, plus the
/// protection metadata that keeps allow-listed channels from being pruned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefsDoc {
    #[serde(rename = "__protected_keys__", default)]
    pub protected_keys: Vec<String>,
    #[serde(rename = "__allowlist_keys__", default)]
    pub allowlist_keys: Vec<String>,
    #[serde(flatten)]
    pub channels: BTreeMap<String, ChannelPrefs>,
}

impl PrefsDoc {
    /// Merge the configured allowlist into the stored protected set and
    /// refresh the allowlist snapshot. Returns the effective protected set.
    pub fn ensure_protection_metadata(&mut self, allowlist: &[String]) -> BTreeSet<String> {
        let mut protected: BTreeSet<String> = self
            .protected_keys
            .iter()
            .map(|key| key.trim().to_string())
            .filter(|key| key.starts_with("discord_"))
            .collect();
        protected.extend(allowlist.iter().cloned());

        self.protected_keys = protected.iter().cloned().collect();
        self.allowlist_keys = allowlist.to_vec();
        protected
    }

    /// Guarantee a skeleton entry for every allow-listed channel so a
    /// degraded (emptied) document repairs itself on the next write.
    pub fn seed_allowlist_keys(&mut self, allowlist: &[String]) -> bool {
        let mut changed = false;
        for key in allowlist {
            if !self.channels.contains_key(key) {
                self.channels.insert(key.clone(), ChannelPrefs::default());
                changed = true;
            }
        }
        changed
    }
}

/// Alias resolver over the shared store.
#[derive(Debug, Clone)]
pub struct AliasResolver {
    store: RoomStore,
    allowlist: Vec<String>,
}

impl AliasResolver {
    pub fn new(store: RoomStore, allowlist: Vec<String>) -> Self {
        Self { store, allowlist }
    }

    /// Resolved alias for a speaker in a channel: per-speaker override wins
    /// over the channel default; empty when neither exists.
    pub fn alias_for(&self, ctx: &RoomCtx, speaker_id: &str) -> String {
        let prefs = self.store.load_prefs();
        Self::lookup(&prefs, &ctx.room_key(), speaker_id)
    }

    /// Alias lookup with thread inheritance: when the thread has no entry for
    /// the speaker, consult the parent channel and copy a hit into the
    /// thread's prefs so future lookups stay local.
    pub fn alias_for_with_parent(
        &self,
        ctx: &RoomCtx,
        speaker_id: &str,
        parent_channel_id: &str,
    ) -> String {
        let mut prefs = self.store.load_prefs();
        let key = ctx.room_key();

        let local = Self::lookup(&prefs, &key, speaker_id);
        if !local.is_empty() || parent_channel_id.trim().is_empty() {
            return local;
        }

        let parent_ctx = RoomCtx::new(ctx.platform.clone(), parent_channel_id, ctx.user_id.clone());
        let inherited = Self::lookup(&prefs, &parent_ctx.room_key(), speaker_id);
        if inherited.is_empty() {
            return inherited;
        }

        let entry = prefs.channels.entry(key).or_default();
        if speaker_id.is_empty() {
            entry.user_alias = Some(inherited.clone());
        } else {
            entry
                .alias_by_user
                .insert(speaker_id.to_string(), inherited.clone());
        }
        if let Err(error) = self.persist(prefs) {
            tracing::warn!(%error, "failed to cache inherited alias");
        }
        inherited
    }

    /// Set or clear an alias. `speaker_id` empty targets the channel default;
    /// an empty `alias` clears the entry instead of storing an empty string.
    /// Clearing the last key of a channel removes the channel entry, unless
    /// the key is protected by the allowlist.
    pub fn set_alias(&self, ctx: &RoomCtx, alias: &str, speaker_id: &str) -> Result<()> {
        let mut prefs = self.store.load_prefs();
        let key = ctx.room_key();
        let alias = alias.trim();
        let speaker_id = speaker_id.trim();
        let protected = prefs.ensure_protection_metadata(&self.allowlist);

        {
            let entry = prefs.channels.entry(key.clone()).or_default();
            if speaker_id.is_empty() {
                if alias.is_empty() {
                    entry.user_alias = None;
                } else {
                    entry.user_alias = Some(alias.to_string());
                }
            } else if alias.is_empty() {
                entry.alias_by_user.remove(speaker_id);
            } else {
                entry
                    .alias_by_user
                    .insert(speaker_id.to_string(), alias.to_string());
            }
        }

        let emptied = prefs
            .channels
            .get(&key)
            .is_some_and(ChannelPrefs::is_empty);
        if emptied && !protected.contains(&key) {
            prefs.channels.remove(&key);
        }

        self.persist(prefs)
    }

    fn lookup(prefs: &PrefsDoc, channel_key: &str, speaker_id: &str) -> String {
        let Some(entry) = prefs.channels.get(channel_key) else {
            return String::new();
        };
        if !speaker_id.is_empty()
            && let Some(alias) = entry.alias_by_user.get(speaker_id)
            && !alias.trim().is_empty()
        {
            return alias.trim().to_string();
        }
        entry
            .user_alias
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    fn persist(&self, mut prefs: PrefsDoc) -> Result<()> {
        prefs.ensure_protection_metadata(&self.allowlist);
        prefs.seed_allowlist_keys(&self.allowlist);
        self.store.save_prefs(&prefs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(allowlist: Vec<String>) -> (tempfile::TempDir, AliasResolver) {
        let dir = tempfile::tempdir().unwrap();
        let store = RoomStore::new(dir.path().join("rp_rooms"));
        (dir, AliasResolver::new(store, allowlist))
    }

    fn ctx(channel: &str) -> RoomCtx {
        RoomCtx::new("discord", channel, "owner")
    }

    #[test]
    fn override_wins_over_channel_default() {
        let (_dir, resolver) = resolver(Vec::new());
        let ctx = ctx("100");
        resolver.set_alias(&ctx, "A", "").unwrap();
        resolver.set_alias(&ctx, "B", "x").unwrap();

        assert_eq!(resolver.alias_for(&ctx, "x"), "B");
        assert_eq!(resolver.alias_for(&ctx, "y"), "A");
        assert_eq!(resolver.alias_for(&ctx, ""), "A");
    }

    #[test]
    fn clearing_last_key_removes_channel_entry() {
        let (_dir, resolver) = resolver(Vec::new());
        let ctx = ctx("100");
        resolver.set_alias(&ctx, "A", "x").unwrap();
        resolver.set_alias(&ctx, "", "x").unwrap();

        let prefs = resolver.store.load_prefs();
        assert!(!prefs.channels.contains_key("discord_100"));
    }

    #[test]
    fn protected_channel_keeps_empty_skeleton() {
        let (_dir, resolver) = resolver(vec!["discord_100".into()]);
        let ctx = ctx("100");
        resolver.set_alias(&ctx, "A", "x").unwrap();
        resolver.set_alias(&ctx, "", "x").unwrap();

        let prefs = resolver.store.load_prefs();
        let entry = prefs.channels.get("discord_100").unwrap();
        assert!(entry.is_empty());
        assert!(prefs.protected_keys.contains(&"discord_100".to_string()));
    }

    #[test]
    fn thread_inherits_parent_alias_as_write_through_copy() {
        let (_dir, resolver) = resolver(Vec::new());
        let parent = ctx("parent");
        resolver.set_alias(&parent, "용사", "x").unwrap();

        let thread = ctx("thread");
        let got = resolver.alias_for_with_parent(&thread, "x", "parent");
        assert_eq!(got, "용사");

        // cached in the thread entry: a plain lookup now succeeds
        assert_eq!(resolver.alias_for(&thread, "x"), "용사");

        // and it is a copy, not a live link
        resolver.set_alias(&parent, "기사", "x").unwrap();
        assert_eq!(resolver.alias_for(&thread, "x"), "용사");
    }

    #[test]
    fn missing_everything_resolves_empty() {
        let (_dir, resolver) = resolver(Vec::new());
        assert_eq!(resolver.alias_for(&ctx("900"), "x"), "");
    }

    #[test]
    fn prefs_document_round_trips_metadata_fields() {
        let mut doc = PrefsDoc::default();
        doc.ensure_protection_metadata(&["discord_1".into()]);
        doc.seed_allowlist_keys(&["discord_1".into()]);
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("__protected_keys__"));
        let back: PrefsDoc = serde_json::from_str(&json).unwrap();
        assert!(back.channels.contains_key("discord_1"));
    }
}
