//! rpbot: a Discord roleplay conversation engine with file-backed room state.

pub mod alias;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod discord;
pub mod engage;
pub mod engine;
pub mod error;
pub mod llm;
pub mod lock;
pub mod prompt;
pub mod room;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// History cap per room document.
pub const MAX_HISTORY: usize = 500;

/// Recent message id ring cap per room document.
pub const MAX_RECENT_MESSAGE_IDS: usize = 200;

/// Transcript file line cap per room.
pub const MAX_TRANSCRIPT_LINES: usize = 2000;

/// Addressing context for a single room: which platform channel the event
/// came from and who sent it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomCtx {
    pub platform: String,
    pub channel_id: String,
    pub user_id: String,
}

impl RoomCtx {
    pub fn new(
        platform: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Deterministic slug key identifying the room document,
    /// `{platform}_{channel-slug}`.
    pub fn room_key(&self) -> String {
        format!("{}_{}", slugify(&self.platform), slugify(&self.channel_id))
    }
}

/// Lowercase a string and collapse everything outside `[a-z0-9_-]` into
/// single dashes. Empty input falls back to `"room"` so a key is always
/// a usable filename.
pub fn slugify(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;

    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "room".to_string()
    } else {
        trimmed.to_string()
    }
}

/// RFC 3339 UTC timestamp used in every persisted document.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
