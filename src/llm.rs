//! Generation backend adapter: completion trait, quality gates, and the
//! retry-bounded opening/reply generators.

pub mod gates;
pub mod gemini;
pub mod generate;

pub use gemini::GeminiClient;
pub use generate::ReplyGenerator;

use crate::error::ProviderError;

use async_trait::async_trait;

/// The single operation consumed from the hosted text-completion backend.
///
/// Implemented by `GeminiClient` in production and by stubs in tests.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Binary verdict from the out-of-character classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OocVerdict {
    /// In-character response.
    Safe,
    /// Meta/safety-style intervention that breaks immersion.
    Unsafe,
}
