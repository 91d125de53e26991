//! Opening and reply generation with bounded retries.
//!
//! Every generator is fail-soft: provider trouble produces an empty string
//! and a warning, never an error surfaced to the room. The out-of-character
//! judge is the one place a failure is reported, so the caller can decide to
//! fail open.

use crate::config::Config;
use crate::error::ClassifierUnavailable;
use crate::llm::gates::{has_placeholder_pattern, looks_truncated};
use crate::llm::{CompletionBackend, OocVerdict};
use crate::prompt::{self, PromptContext};
use crate::room::Room;

use std::sync::Arc;

const ANTI_PLACEHOLDER_SUFFIX: &str = "\n\n금지: 대괄호 플레이스홀더([예시])를 절대 출력하지 마.";
const TRUNCATION_RETRY_SUFFIX: &str =
    "\n\n방금 출력이 중간에 잘렸어. 같은 장면을 완결 문장으로 다시 출력해.";
const JUDGE_TRANSCRIPT_CHARS: usize = 1200;

/// Strip the markers the model keeps sneaking in despite the prompt rules.
fn strip_markup(text: &str) -> String {
    text.replace("**", "").replace('"', "").trim().to_string()
}

#[derive(Clone)]
pub struct ReplyGenerator {
    backend: Arc<dyn CompletionBackend>,
    config: Arc<Config>,
}

impl ReplyGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: Arc<Config>) -> Self {
        Self { backend, config }
    }

    /// One completion with a single anti-placeholder retry. Returns `None`
    /// when the backend fails or the placeholder pattern persists.
    async fn complete_gated(&self, prompt: &str) -> Option<String> {
        let out = match self.backend.complete(prompt).await {
            Ok(out) => out,
            Err(error) => {
                tracing::warn!(%error, "completion failed");
                return None;
            }
        };
        let mut cleaned = strip_markup(&out);
        if has_placeholder_pattern(&cleaned) {
            let retry = format!("{prompt}{ANTI_PLACEHOLDER_SUFFIX}");
            match self.backend.complete(&retry).await {
                Ok(out) => cleaned = strip_markup(&out),
                Err(error) => {
                    tracing::warn!(%error, "placeholder retry failed");
                    return None;
                }
            }
        }
        if has_placeholder_pattern(&cleaned) {
            tracing::warn!("placeholder pattern persisted after retry, dropping output");
            return None;
        }
        Some(cleaned)
    }

    /// Generate the two-line scene opening: one italic action line, one line
    /// of dialogue. Anything that doesn't come back as at least two usable
    /// lines is discarded.
    pub async fn generate_opening(&self, user_alias: &str, seed: &str) -> String {
        let alias = {
            let trimmed = user_alias.trim();
            if trimmed.is_empty() { "너" } else { trimmed }
        };
        let seed = {
            let trimmed = seed.trim();
            if trimmed.is_empty() { "새로운 장면" } else { trimmed }
        };
        let prompt = format!(
            "너는 {bot}이며 디스코드 RP 상대역이다.\n\
             오프닝만 작성한다. 템플릿 문구 금지.\n\
             출력 규칙:\n\
             1) 정확히 2줄\n\
             2) 1줄은 기울임체 행동(별표로 감싸기)\n\
             3) 2줄은 대사(따옴표/볼드 금지)\n\
             4) 메타 문장 금지(예: 장면의 첫 문장, 시작하자 같은 운영 문구 금지)\n\
             5) 사용자 이름/호칭은 과하게 반복하지 말고 자연스럽게 필요할 때만 0~1회 사용\n\
             사용자 호칭: {alias}\n\
             주제: {seed}",
            bot = self.config.bot_name,
        );

        let Some(text) = self.complete_gated(&prompt).await else {
            return String::new();
        };
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if lines.len() >= 2 {
            format!("{}\n{}", lines[0], lines[1])
        } else {
            String::new()
        }
    }

    /// Generate an in-character reply for the room's current state.
    ///
    /// Gate order: markup strip, placeholder (one retry, persistent hit
    /// drops the output), truncation (one retry, kept only when the retry is
    /// non-empty and placeholder-clean). Empty string means "say nothing".
    pub async fn reply_for_room(&self, room: &Room, user_display: &str) -> String {
        let ctx = PromptContext::from_room(
            room,
            user_display,
            &self.config.bot_name,
            self.config.safety_style,
            &self.config.cues,
        );
        let prompt = prompt::build_prompt(&ctx);

        let Some(mut cleaned) = self.complete_gated(&prompt).await else {
            return String::new();
        };

        if looks_truncated(&cleaned, &self.config.cues) {
            let retry = format!("{prompt}{TRUNCATION_RETRY_SUFFIX}");
            match self.backend.complete(&retry).await {
                Ok(out) => {
                    let retried = strip_markup(&out);
                    if !retried.is_empty() && !has_placeholder_pattern(&retried) {
                        cleaned = retried;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "truncation retry failed, keeping first output");
                }
            }
        }
        cleaned
    }

    /// Classify a candidate reply as in-character or an immersion-breaking
    /// intervention. Empty candidates are trivially safe. Backend failure is
    /// returned as-is; callers fail open.
    pub async fn judge_ooc(
        &self,
        reply: &str,
        recent_transcript: &str,
    ) -> Result<OocVerdict, ClassifierUnavailable> {
        let text = reply.trim();
        if text.is_empty() {
            return Ok(OocVerdict::Safe);
        }
        let transcript: String = recent_transcript.chars().take(JUDGE_TRANSCRIPT_CHARS).collect();
        let prompt = format!(
            "다음 RP 답변이 몰입을 깨는 운영자/안전/메타 개입인지 판정해.\n\
             기준: 캐릭터 대사/행동이 아니라 현실 조언/훈계/운영 안내가 중심이면 UNSAFE.\n\
             캐릭터 반응 중심이면 SAFE.\n\
             출력은 SAFE 또는 UNSAFE 한 단어만.\n\n\
             최근대화:\n{transcript}\n\n\
             후보답변:\n{text}"
        );
        let out = self
            .backend
            .complete(&prompt)
            .await
            .map_err(|error| ClassifierUnavailable {
                reason: error.to_string(),
            })?;
        if out.trim().to_uppercase().starts_with("UNSAFE") {
            Ok(OocVerdict::Unsafe)
        } else {
            Ok(OocVerdict::Safe)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::room::Turn;

    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records every prompt it was given.
    struct Scripted {
        responses: Mutex<VecDeque<Result<String, ProviderError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new<I>(responses: I) -> Arc<Self>
        where
            I: IntoIterator<Item = Result<String, ProviderError>>,
        {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for Scripted {
        async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ProviderError::EmptyText))
        }
    }

    fn test_config(data_dir: std::path::PathBuf) -> Config {
        Config {
            data_dir,
            discord_token: None,
            bot_name: "RP".into(),
            llm: crate::config::LlmConfig {
                api_key: None,
                model: "gemini-2.5-flash".into(),
                temperature: 0.9,
                max_output_tokens: None,
                timeout_secs: 20,
            },
            allowed_channel_ids: Vec::new(),
            safety_style: crate::config::SafetyStyle::Default,
            cues: crate::config::CueConfig::default(),
        }
    }

    fn make_generator(backend: Arc<Scripted>) -> ReplyGenerator {
        let config = test_config(std::path::PathBuf::from("/tmp"));
        ReplyGenerator::new(backend, Arc::new(config))
    }

    fn room_with_history() -> Room {
        Room {
            id: "discord_bookshop".into(),
            title: "달빛 서점".into(),
            kind: crate::room::RoomKind::Thread,
            parent_channel_id: String::new(),
            owner_id: "u1".into(),
            participants: vec!["u1".into()],
            history: vec![Turn {
                user_id: "u1".into(),
                speaker_name: "민지".into(),
                text: "문을 열고 들어선다".into(),
                at: "2026-08-30T00:00:00Z".into(),
                message_id: "m1".into(),
            }],
            opening: "비 오는 밤의 서점".into(),
            world: crate::room::WorldInfo::default(),
            settings: crate::room::RoomSettings::default(),
            recent_message_ids: Vec::new(),
            temp: serde_json::Map::new(),
            is_active: true,
            created_at: "2026-08-30T00:00:00Z".into(),
            updated_at: "2026-08-30T00:00:00Z".into(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn clean_reply_uses_single_call() {
        let backend = Scripted::new([Ok("\"그는 조용히 **웃었다**.\"".to_string())]);
        let generator = make_generator(backend.clone());
        let reply = generator.reply_for_room(&room_with_history(), "민지").await;
        assert_eq!(reply, "그는 조용히 웃었다.");
        assert_eq!(backend.prompts().len(), 1);
    }

    #[tokio::test]
    async fn ellipsis_ending_is_not_retried() {
        let backend = Scripted::new([Ok("그는 천천히 문을 바라보았다…".to_string())]);
        let generator = make_generator(backend.clone());
        let reply = generator.reply_for_room(&room_with_history(), "민지").await;
        assert_eq!(reply, "그는 천천히 문을 바라보았다…");
        assert_eq!(backend.prompts().len(), 1);
    }

    #[tokio::test]
    async fn placeholder_triggers_one_retry() {
        let backend = Scripted::new([
            Ok("[정확한 목적어]를 향해 걸었다.".to_string()),
            Ok("서가 사이를 천천히 걸었다.".to_string()),
        ]);
        let generator = make_generator(backend.clone());
        let reply = generator.reply_for_room(&room_with_history(), "민지").await;
        assert_eq!(reply, "서가 사이를 천천히 걸었다.");
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("플레이스홀더"));
    }

    #[tokio::test]
    async fn persistent_placeholder_yields_empty() {
        let backend = Scripted::new([
            Ok("[첫 번째 단계]".to_string()),
            Ok("아직도 [빈 칸]이 남았다.".to_string()),
        ]);
        let generator = make_generator(backend.clone());
        let reply = generator.reply_for_room(&room_with_history(), "민지").await;
        assert_eq!(reply, "");
        assert_eq!(backend.prompts().len(), 2);
    }

    #[tokio::test]
    async fn truncated_output_gets_one_completion_retry() {
        let backend = Scripted::new([
            Ok("그가 조용히 손을".to_string()),
            Ok("그가 조용히 손을 내밀었다.".to_string()),
        ]);
        let generator = make_generator(backend.clone());
        let reply = generator.reply_for_room(&room_with_history(), "민지").await;
        assert_eq!(reply, "그가 조용히 손을 내밀었다.");
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("잘렸어"));
    }

    #[tokio::test]
    async fn bad_truncation_retry_keeps_first_output() {
        let backend = Scripted::new([
            Ok("그가 조용히 손을".to_string()),
            Ok("[다시 쓴 장면]".to_string()),
        ]);
        let generator = make_generator(backend.clone());
        let reply = generator.reply_for_room(&room_with_history(), "민지").await;
        assert_eq!(reply, "그가 조용히 손을");
    }

    #[tokio::test]
    async fn provider_failure_yields_empty_reply() {
        let backend = Scripted::new([Err(ProviderError::Status(503))]);
        let generator = make_generator(backend);
        let reply = generator.reply_for_room(&room_with_history(), "민지").await;
        assert_eq!(reply, "");
    }

    #[tokio::test]
    async fn opening_keeps_first_two_lines() {
        let backend =
            Scripted::new([Ok("*창밖의 비를 바라본다*\n오늘은 늦었네.\n추가 설명".to_string())]);
        let generator = make_generator(backend.clone());
        let opening = generator.generate_opening("민지", "비 오는 서점").await;
        assert_eq!(opening, "*창밖의 비를 바라본다*\n오늘은 늦었네.");
        let prompts = backend.prompts();
        assert!(prompts[0].contains("사용자 호칭: 민지"));
        assert!(prompts[0].contains("주제: 비 오는 서점"));
    }

    #[tokio::test]
    async fn single_line_opening_is_discarded() {
        let backend = Scripted::new([Ok("*조용히 웃는다*".to_string())]);
        let generator = make_generator(backend);
        assert_eq!(generator.generate_opening("민지", "").await, "");
    }

    #[tokio::test]
    async fn opening_defaults_alias_and_seed() {
        let backend = Scripted::new([Ok("*서성인다*\n왔구나.".to_string())]);
        let generator = make_generator(backend.clone());
        generator.generate_opening("  ", "").await;
        let prompts = backend.prompts();
        assert!(prompts[0].contains("사용자 호칭: 너"));
        assert!(prompts[0].contains("주제: 새로운 장면"));
    }

    #[tokio::test]
    async fn judge_reads_leading_verdict_word() {
        let backend = Scripted::new([Ok("unsafe".to_string())]);
        let generator = make_generator(backend);
        let verdict = generator.judge_ooc("현실에서는 경찰에 신고하세요.", "").await;
        assert_eq!(verdict.unwrap(), OocVerdict::Unsafe);

        let backend = Scripted::new([Ok("SAFE".to_string())]);
        let generator = make_generator(backend);
        let verdict = generator.judge_ooc("그는 고개를 끄덕였다.", "").await;
        assert_eq!(verdict.unwrap(), OocVerdict::Safe);
    }

    #[tokio::test]
    async fn judge_skips_backend_for_empty_reply() {
        let backend = Scripted::new(Vec::<Result<String, ProviderError>>::new());
        let generator = make_generator(backend.clone());
        let verdict = generator.judge_ooc("   ", "아무 대화").await;
        assert_eq!(verdict.unwrap(), OocVerdict::Safe);
        assert!(backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn judge_surfaces_backend_failure() {
        let backend = Scripted::new([Err(ProviderError::Status(500))]);
        let generator = make_generator(backend);
        let verdict = generator.judge_ooc("그는 웃었다.", "").await;
        assert!(verdict.is_err());
    }

    #[tokio::test]
    async fn generation_reads_room_state_without_mutating_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path().to_path_buf()));
        let engine = crate::engine::RpEngine::new(config.clone());
        let ctx = crate::RoomCtx::new("discord", "100", "u1");
        engine
            .start_room(&ctx, "", crate::room::RoomKind::Thread, "탐험 시작", "")
            .unwrap();
        for (i, text) in ["문 앞에 선다", "천천히 들어간다", "주위를 살핀다"]
            .iter()
            .enumerate()
        {
            assert!(engine
                .ingest_plain_chat(&ctx, text, &format!("m{i}"), "민지")
                .unwrap());
        }
        let room = engine.store().load_room(&ctx.room_key()).unwrap();
        assert_eq!(room.history.len(), 3);

        let backend = Scripted::new([Ok("…그는 문을 열었다.".to_string())]);
        let generator = ReplyGenerator::new(backend.clone(), config);
        let reply = generator.reply_for_room(&room, "민지").await;
        assert_eq!(reply, "…그는 문을 열었다.");
        // ellipsis-led but sentence-final output passes both gates first try
        assert_eq!(backend.prompts().len(), 1);

        let after = engine.store().load_room(&ctx.room_key()).unwrap();
        assert_eq!(after.history.len(), 3);
        assert!(after.is_active);
    }
}
