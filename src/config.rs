//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;

use std::path::PathBuf;

/// How the engine should route real-world safety topics during roleplay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyStyle {
    /// Provider default behavior, no extra prompt rule.
    #[default]
    Default,
    /// Keep safety handling inside the fiction: respond with character
    /// action/emotion/dialogue instead of real-world advisory text.
    Immersive,
}

/// rpbot configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory holding room documents, indexes, and the runtime lock.
    pub data_dir: PathBuf,

    /// Discord bot token. Required by `run`, optional for offline commands.
    pub discord_token: Option<String>,

    /// Display name the bot speaks as inside prompts.
    pub bot_name: String,

    /// Generation backend settings.
    pub llm: LlmConfig,

    /// Channel ids whose alias preferences must survive pruning.
    pub allowed_channel_ids: Vec<String>,

    /// Safety-topic handling for prompt assembly.
    pub safety_style: SafetyStyle,

    /// Heuristic rule tables. Configuration, not hard business logic.
    pub cues: CueConfig,
}

/// Generation backend configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key for the hosted text-completion backend.
    pub api_key: Option<String>,

    /// Model name, e.g. `gemini-2.5-flash`.
    pub model: String,

    /// Sampling temperature.
    pub temperature: f64,

    /// Max output tokens. `None` means use the provider default cap.
    pub max_output_tokens: Option<u32>,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

/// Keyword tables driving the scene-anchor, truncation, and disengagement
/// heuristics. Kept in config so the lists can be localized and tested
/// independently of the control flow they feed.
#[derive(Debug, Clone)]
pub struct CueConfig {
    /// Topic-transition cues that soften the scene anchor.
    pub transition: Vec<String>,

    /// "Step back" phrases that request disengagement when directly called.
    pub step_back: Vec<String>,

    /// Korean grammatical particles that indicate a mid-clause cut when they
    /// end the output.
    pub truncation_tails: Vec<String>,
}

impl Default for CueConfig {
    fn default() -> Self {
        Self {
            transition: [
                "다음", "이제", "그럼", "넘어가", "장면", "전환", "바꾸", "정리", "next", "scene",
                "move on", "switch", "shift",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            step_back: ["빠져", "빠질게", "나갈게", "쉬어", "그만 껴", "step back", "stay out"]
                .into_iter()
                .map(String::from)
                .collect(),
            truncation_tails: [
                "을", "를", "이", "가", "에", "로", "와", "과", "며", "고", "서", "데", "는", "은",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let data_dir = match std::env::var("RPBOT_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => dirs::data_dir()
                .map(|d| d.join("rpbot"))
                .unwrap_or_else(|| PathBuf::from("./data")),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let llm = LlmConfig {
            api_key: env_nonempty("GEMINI_API_KEY").or_else(|| env_nonempty("GOOGLE_API_KEY")),
            model: env_nonempty("RP_LLM_MODEL").unwrap_or_else(|| "gemini-2.5-flash".into()),
            temperature: env_nonempty("RP_LLM_TEMPERATURE")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0.9),
            max_output_tokens: env_nonempty("RP_LLM_MAX_TOKENS")
                .and_then(|raw| raw.parse::<i64>().ok())
                .filter(|tokens| *tokens > 0)
                .map(|tokens| tokens as u32),
            timeout_secs: 20,
        };

        let safety_style = match env_nonempty("RP_SAFETY_STYLE").as_deref() {
            Some("immersive") => SafetyStyle::Immersive,
            _ => SafetyStyle::Default,
        };

        Ok(Self {
            data_dir,
            discord_token: env_nonempty("DISCORD_TOKEN"),
            bot_name: env_nonempty("RP_BOT_NAME").unwrap_or_else(|| "RP".into()),
            llm,
            allowed_channel_ids: parse_csv_ids(
                &env_nonempty("RP_ALLOWED_CHANNEL_IDS").unwrap_or_default(),
            ),
            safety_style,
            cues: CueConfig::default(),
        })
    }

    /// The Discord token, or the error that makes `run` exit with code 2.
    pub fn require_discord_token(&self) -> Result<&str> {
        self.discord_token
            .as_deref()
            .ok_or_else(|| ConfigError::MissingCredential("DISCORD_TOKEN").into())
    }

    /// Directory holding every room document and index file.
    pub fn rooms_dir(&self) -> PathBuf {
        self.data_dir.join("rp_rooms")
    }

    /// Alias-preference keys that pruning must always preserve,
    /// in room-key form.
    pub fn protected_pref_keys(&self) -> Vec<String> {
        self.allowed_channel_ids
            .iter()
            .map(|id| format!("discord_{}", crate::slugify(id)))
            .collect()
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Split a comma- or newline-separated id list, dropping empty segments.
pub fn parse_csv_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = raw
        .replace('\n', ",")
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
