//! File-backed persistence for room documents, indexes, and transcripts.
//!
//! The filesystem is the store: one JSON document per room, a single
//! active-room index, one alias-preferences document, one runtime-lock
//! document, and a plain-text transcript per room. A single runtime process
//! is the sole writer (enforced by the lock component, not here).

use crate::alias::PrefsDoc;
use crate::error::Result;
use crate::lock::LockDoc;
use crate::room::{ActiveRoomIndex, Room};

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Injected repository over the rooms directory. Every durable read and
/// write in the engine goes through this.
#[derive(Debug, Clone)]
pub struct RoomStore {
    root: PathBuf,
}

impl RoomStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn room_json_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    pub fn transcript_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.md"))
    }

    fn active_index_path(&self) -> PathBuf {
        self.root.join("_active_rooms.json")
    }

    fn prefs_path(&self) -> PathBuf {
        self.root.join("_room_prefs.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join("_runtime_lock.json")
    }

    fn legacy_cache_path(&self) -> PathBuf {
        self.root.join("_legacy_cache.json")
    }

    // -- room documents ---------------------------------------------------

    /// Load a room document. Missing file is `None`; an unreadable document
    /// is also `None` (callers surface it as "no active room here") but gets
    /// logged so the operator can investigate instead of silently losing
    /// state.
    pub fn load_room(&self, key: &str) -> Option<Room> {
        let path = self.room_json_path(key);
        if !path.exists() {
            return None;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(room = key, %error, "failed to read room document");
                return None;
            }
        };
        match serde_json::from_str::<Room>(&raw) {
            Ok(mut room) => {
                room.normalize();
                Some(room)
            }
            Err(error) => {
                tracing::warn!(room = key, %error, "room document is not valid JSON");
                None
            }
        }
    }

    pub fn save_room(&self, room: &Room) -> Result<()> {
        self.write_json(&self.room_json_path(&room.id), room)
    }

    /// Room keys that have a document on disk, regardless of activity.
    pub fn room_keys(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = name.strip_suffix(".json")?;
                if key.starts_with('_') {
                    return None;
                }
                Some(key.to_string())
            })
            .collect();
        keys.sort();
        keys
    }

    /// Count of transcript files on disk (cleanup reporting).
    pub fn transcript_count(&self) -> usize {
        std::fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| {
                        entry.file_name().to_string_lossy().ends_with(".md")
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    // -- auxiliary documents ----------------------------------------------
    //
    // Corrupt or missing auxiliary files fall back to empty defaults so the
    // bot stays responsive; only room documents get the stricter treatment
    // above.

    pub fn load_active_index(&self) -> ActiveRoomIndex {
        self.read_json_or_default(&self.active_index_path())
    }

    pub fn save_active_index(&self, index: &ActiveRoomIndex) -> Result<()> {
        self.write_json(&self.active_index_path(), index)
    }

    pub fn load_prefs(&self) -> PrefsDoc {
        self.read_json_or_default(&self.prefs_path())
    }

    pub fn save_prefs(&self, prefs: &PrefsDoc) -> Result<()> {
        self.write_json(&self.prefs_path(), prefs)
    }

    pub fn load_lock(&self) -> Option<LockDoc> {
        let path = self.lock_path();
        if !path.exists() {
            return None;
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub fn save_lock(&self, lock: &LockDoc) -> Result<()> {
        self.write_json(&self.lock_path(), lock)
    }

    pub fn remove_lock(&self) -> Result<()> {
        match std::fs::remove_file(self.lock_path()) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    pub fn load_legacy_cache(&self) -> BTreeMap<String, serde_json::Value> {
        self.read_json_or_default(&self.legacy_cache_path())
    }

    pub fn save_legacy_cache(&self, cache: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        self.write_json(&self.legacy_cache_path(), cache)
    }

    // -- transcripts ------------------------------------------------------

    /// Append one human-readable line to the room's plain-text transcript,
    /// evicting the oldest lines beyond the cap. Append-only from the
    /// caller's perspective and independent from the JSON document.
    pub fn append_transcript_line(&self, key: &str, line: &str) -> Result<()> {
        let path = self.transcript_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create rooms dir: {}", parent.display()))?;
        }

        let mut lines: Vec<String> = match std::fs::read_to_string(&path) {
            Ok(raw) => raw.lines().map(String::from).collect(),
            Err(_) => Vec::new(),
        };
        lines.push(line.trim_end().to_string());
        let len = lines.len();
        if len > crate::MAX_TRANSCRIPT_LINES {
            lines.drain(..len - crate::MAX_TRANSCRIPT_LINES);
        }

        let mut body = lines.join("\n");
        body.push('\n');
        std::fs::write(&path, body)
            .with_context(|| format!("failed to write transcript: {}", path.display()))?;
        Ok(())
    }

    // -- JSON helpers -----------------------------------------------------

    fn read_json_or_default<T: DeserializeOwned + Default>(&self, path: &Path) -> T {
        if !path.exists() {
            return T::default();
        }
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create rooms dir: {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(value)?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write document: {}", path.display()))?;
        Ok(())
    }
}
