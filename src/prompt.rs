//! Scene anchor derivation and prompt assembly.
//!
//! Both are pure given their inputs — no I/O, no network. The prompt is
//! deterministic string composition over a typed context so the section
//! order can be asserted in tests.

use crate::config::{CueConfig, SafetyStyle};
use crate::room::Room;

/// How strongly the anchor should pin generation to the opening scene.
/// Decays over the room's turn count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorStrength {
    High,
    Medium,
    Low,
}

/// Derived text snippet reinjected into every prompt to keep replies
/// thematically stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneAnchor {
    pub text: String,
    pub strength: AnchorStrength,
    /// Whether a topic-transition cue was spotted in the recent turns.
    pub transitioning: bool,
    /// Set when the anchor was derived from the latest turn because the
    /// room carries no opening.
    pub recent_fallback: bool,
}

impl SceneAnchor {
    /// The strength line appended under the anchor in the prompt.
    pub fn strength_label(&self) -> &'static str {
        if self.recent_fallback {
            return "앵커 강도: 중간(직전 맥락 우선)";
        }
        match (self.strength, self.transitioning) {
            (AnchorStrength::High, _) => "앵커 강도: 높음(초반 맥락 고정, 급격한 이탈 금지)",
            (AnchorStrength::Medium, true) => {
                "앵커 강도: 중간(현재 대화 흐름 우선, 부드러운 장면 이동 허용)"
            }
            (AnchorStrength::Medium, false) => "앵커 강도: 중간(연속성 유지, 무관한 점프 금지)",
            (AnchorStrength::Low, _) => "앵커 강도: 낮음",
        }
    }
}

/// Turn-count threshold below which the opening stays a hard anchor.
const EARLY_ANCHOR_TURNS: usize = 4;

/// How many recent turns are scanned for transition cues.
const TRANSITION_WINDOW: usize = 8;

/// How many turns of transcript go into the prompt.
const PROMPT_TRANSCRIPT_TURNS: usize = 10;

fn clip_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Derive the scene anchor for a room: opening-pinned early, relaxed as the
/// conversation progresses, falling back to the latest turn when there is
/// no opening at all.
pub fn derive_scene_anchor(room: &Room, cues: &CueConfig) -> SceneAnchor {
    let opening = room.opening.trim();
    let turn_count = room.history.len();

    let recent_window: String = room
        .history
        .iter()
        .rev()
        .take(TRANSITION_WINDOW)
        .rev()
        .map(|turn| turn.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let recent_lower = recent_window.to_lowercase();
    let transitioning = cues
        .transition
        .iter()
        .any(|cue| recent_lower.contains(&cue.to_lowercase()));

    if !opening.is_empty() {
        if turn_count <= EARLY_ANCHOR_TURNS {
            return SceneAnchor {
                text: format!("현재 장면 앵커: {}", clip_chars(opening, 160)),
                strength: AnchorStrength::High,
                transitioning,
                recent_fallback: false,
            };
        }
        if transitioning {
            return SceneAnchor {
                text: format!("현재 장면 앵커: {} (전환 진행 중)", clip_chars(opening, 120)),
                strength: AnchorStrength::Medium,
                transitioning: true,
                recent_fallback: false,
            };
        }
        return SceneAnchor {
            text: format!("현재 장면 앵커: {}", clip_chars(opening, 120)),
            strength: AnchorStrength::Medium,
            transitioning: false,
            recent_fallback: false,
        };
    }

    let latest = room
        .history
        .iter()
        .rev()
        .map(|turn| turn.text.trim())
        .find(|text| !text.is_empty());
    if let Some(latest) = latest {
        return SceneAnchor {
            text: format!(
                "현재 장면 앵커: 최근 대화 흐름 기준({})",
                clip_chars(latest, 80)
            ),
            strength: AnchorStrength::Medium,
            transitioning,
            recent_fallback: true,
        };
    }

    SceneAnchor {
        text: "현재 장면 앵커: 미지정".to_string(),
        strength: AnchorStrength::Low,
        transitioning: false,
        recent_fallback: false,
    }
}

/// Typed inputs to prompt assembly.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub bot_name: String,
    pub tone: String,
    pub user_alias: String,
    pub world_summary: String,
    pub anchor: SceneAnchor,
    /// `- {speaker}: {text}` lines for the last turns, oldest first.
    pub transcript: Vec<String>,
    /// First one or two turns of a room get an extra anti-meta rule.
    pub early_turn: bool,
    pub safety_style: SafetyStyle,
}

impl PromptContext {
    /// Build the context from a room document. The current speaker's display
    /// name wins over the room's stored alias so third-party turns don't get
    /// addressed as the owner.
    pub fn from_room(
        room: &Room,
        user_display: &str,
        bot_name: &str,
        safety_style: SafetyStyle,
        cues: &CueConfig,
    ) -> Self {
        let transcript = room
            .history
            .iter()
            .rev()
            .take(PROMPT_TRANSCRIPT_TURNS)
            .rev()
            .filter_map(|turn| {
                let text = turn.text.trim();
                if text.is_empty() {
                    return None;
                }
                let mut speaker = turn.speaker_name.trim().to_string();
                if speaker.is_empty() && !turn.user_id.is_empty() {
                    let tail: String = turn
                        .user_id
                        .chars()
                        .rev()
                        .take(4)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    speaker = format!("user-{tail}");
                }
                if speaker.is_empty() {
                    speaker = "상대".to_string();
                }
                Some(format!("- {speaker}: {text}"))
            })
            .collect();

        let user_alias = if user_display.trim().is_empty() {
            room.settings.user_alias.trim().to_string()
        } else {
            user_display.trim().to_string()
        };

        Self {
            bot_name: bot_name.to_string(),
            tone: room.settings.tone.trim().to_string(),
            user_alias,
            world_summary: room.world.summary.trim().to_string(),
            anchor: derive_scene_anchor(room, cues),
            transcript,
            early_turn: room.history.len() <= 2,
            safety_style,
        }
    }
}

/// Assemble the generation prompt. Fixed section order: persona header,
/// hard rules, soft rules, tone, alias, world summary, scene anchor,
/// recent transcript.
pub fn build_prompt(ctx: &PromptContext) -> String {
    let early_rule = if ctx.early_turn {
        "0) 첫 반응 단계(초반 1~2턴)여도 반드시 RP 톤으로 답한다. 운영/메타 설명으로 새지 않는다.\n"
    } else {
        ""
    };
    let immersive_rule = if ctx.safety_style == SafetyStyle::Immersive {
        "0-1) 현실 안전 가이드/신고 유도/상담 안내를 직접 출력하지 말고, 캐릭터 행동/감정/대사로만 대응한다.\n"
    } else {
        ""
    };

    let world_summary = if ctx.world_summary.is_empty() {
        "미지정"
    } else {
        &ctx.world_summary
    };
    let transcript = if ctx.transcript.is_empty() {
        "- (대화 없음)".to_string()
    } else {
        ctx.transcript.join("\n")
    };

    format!(
        "너는 {bot_name}이며, 디스코드 RP 상대역이다.\n\
         출력 규칙(하드/소프트):\n\
         {early_rule}{immersive_rule}\
         [HARD]\n\
         1) RP 활성 흐름에서는 메인/운영 개입 없이 캐릭터 반응 중심으로 유지한다.\n\
         2) 직전 대화 맥락을 이어서 RP로 반응한다.\n\
         3) 메타 설명/시스템 언급/규칙 재진술 금지.\n\
         4) 한국어 우선(사용자가 영어를 명시 요청한 경우만 영어 허용).\n\
         5) 영문 3인칭 소설체(He/She/They 시작) 금지.\n\
         6) 최근 대화의 발화자 이름을 구분해 제3자 발화 오인을 피한다.\n\
         7) 문장을 중간에 끊지 말고 자연스럽게 끝맺는다.\n\
         \n[SOFT]\n\
         8) 말투/서사 길이는 장면에 맞춰 유동적으로 작성한다(고정 템플릿/고정 2줄 금지).\n\
         9) 상황 질문/침묵성 발화가 와도 흐름을 멈추지 말고 장면·감정·행동을 제시해 서사를 주도한다.\n\
         10) 사용자 호칭은 설정 alias를 우선 사용하고, 필요할 때만 자연스럽게 사용한다(과반복 금지).\n\
         11) 행동/상태 묘사는 기울임체(*...*)를 기본 형식으로 사용하고, 괄호 서술((...), [..], {{...}})은 사용하지 않는다.\n\
         12) 직접 대화/행동 중심으로 답한다(관찰자 시점 설명문 단독 출력 회피).\n\n\
         RP 톤: {tone}\n\
         사용자 호칭: {alias}\n\
         세계관 요약: {world}\n\
         {anchor}\n\
         {anchor_strength}\n\
         최근 대화:\n\
         {transcript}",
        bot_name = ctx.bot_name,
        early_rule = early_rule,
        immersive_rule = immersive_rule,
        tone = ctx.tone,
        alias = ctx.user_alias,
        world = world_summary,
        anchor = ctx.anchor.text,
        anchor_strength = ctx.anchor.strength_label(),
        transcript = transcript,
    )
}
