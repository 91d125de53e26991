//! Room documents: the per-channel conversation state.

pub mod ingest;
pub mod lifecycle;
pub mod store;

pub use store::RoomStore;

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

/// Where a room lives on the platform side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    #[default]
    Thread,
    Dm,
}

/// One admitted conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub user_id: String,
    #[serde(default)]
    pub speaker_name: String,
    pub text: String,
    pub at: String,
    #[serde(default)]
    pub message_id: String,
}

/// Free-form world metadata. Never validated — operator-authored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Per-room generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSettings {
    pub tone: String,
    pub rating: String,
    pub style: String,
    /// Alias resolved at room start. Per-turn resolution can still override.
    #[serde(default)]
    pub user_alias: String,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            tone: "balanced".into(),
            rating: "safe".into(),
            style: "narrative".into(),
            user_alias: String::new(),
        }
    }
}

/// The central entity: one JSON document per (platform, channel) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub kind: RoomKind,
    /// Back-reference to the parent channel for threads. Never an
    /// ownership edge.
    #[serde(default)]
    pub parent_channel_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub opening: String,
    #[serde(default)]
    pub world: WorldInfo,
    #[serde(default)]
    pub settings: RoomSettings,
    #[serde(default)]
    pub recent_message_ids: Vec<String>,
    /// Transient flags (e.g. suppression state). Discarded on close.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub temp: serde_json::Map<String, serde_json::Value>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<String>,
}

impl Room {
    /// Clamp bounded collections after deserializing a document that may
    /// predate the current caps. The single normalization point for room
    /// documents — every load path goes through this.
    pub fn normalize(&mut self) {
        let history_len = self.history.len();
        if history_len > crate::MAX_HISTORY {
            self.history.drain(..history_len - crate::MAX_HISTORY);
        }
        let ids_len = self.recent_message_ids.len();
        if ids_len > crate::MAX_RECENT_MESSAGE_IDS {
            self.recent_message_ids
                .drain(..ids_len - crate::MAX_RECENT_MESSAGE_IDS);
        }
        if !self.is_active && !self.temp.is_empty() {
            self.temp.clear();
        }
    }

    /// Whether the engine is currently holding back from replying here.
    pub fn is_suppressed(&self) -> bool {
        self.temp
            .get("suppressed")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Flip suppression state, stamping the transition time.
    pub fn set_suppressed(&mut self, suppressed: bool) {
        if suppressed {
            self.temp.insert("suppressed".into(), true.into());
            self.temp
                .insert("suppressed_at".into(), crate::now_iso().into());
        } else {
            self.temp.remove("suppressed");
            self.temp.remove("suppressed_at");
        }
    }
}

/// Denormalized summary kept in the active-room index for fast existence
/// checks without opening the full room document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRoomEntry {
    pub platform: String,
    pub channel_id: String,
    #[serde(default)]
    pub parent_channel_id: String,
    /// Always `"room-only"` — the index never claims the parent channel.
    pub scope: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub kind: RoomKind,
    #[serde(default)]
    pub owner_id: String,
    pub updated_at: String,
}

/// The active-room index document: room key → summary.
pub type ActiveRoomIndex = BTreeMap<String, ActiveRoomEntry>;

/// Counts returned by the non-destructive cleanup pass. Observability,
/// not correctness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub active_count: usize,
    pub preserved_json_count: usize,
    pub preserved_md_count: usize,
    pub cache_pruned: usize,
    pub stale_channel_ids: Vec<String>,
}

/// Result of a runtime integrity scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub ok: bool,
    pub issues: Vec<String>,
    pub recovered: Vec<String>,
    pub lock_ok: bool,
}
