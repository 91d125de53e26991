//! Top-level error types for rpbot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Room lifecycle precondition violations.
///
/// Recovered locally and surfaced as a user-facing chat message, never fatal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("a room is already active for this channel")]
    AlreadyActive,

    #[error("no active room for this channel")]
    NoActiveRoom,
}

/// Generation backend failures.
///
/// The caller treats any of these as "no reply this turn" — retries are
/// bounded to the quality gates, never indefinite.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("missing API key for the generation backend")]
    MissingKey,

    #[error("request to the generation backend failed: {0}")]
    Transport(String),

    #[error("generation backend returned status {0}")]
    Status(u16),

    #[error("generation backend returned no candidates")]
    EmptyCandidates,

    #[error("generation backend returned empty text")]
    EmptyText,
}

/// Runtime lock conflicts.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LockError {
    #[error("duplicate runtime blocked: same token already running (pid={pid})")]
    DuplicateToken { pid: u32 },

    #[error("duplicate runtime blocked: another runtime is running (pid={pid})")]
    DuplicateRuntime { pid: u32 },
}

/// The OOC classifier could not produce a verdict.
///
/// Callers must treat this identically to a SAFE verdict (fail open).
#[derive(Debug, thiserror::Error)]
#[error("OOC classifier unavailable: {reason}")]
pub struct ClassifierUnavailable {
    pub reason: String,
}
