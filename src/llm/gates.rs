//! Output quality gates: placeholder-artifact and truncation detection.
//!
//! Heuristics, not parsers. The keyword tables live in `CueConfig` so the
//! truncation particles can be localized without touching this logic.

use crate::config::CueConfig;

use std::sync::LazyLock;

/// Bracket-delimited template artifact, e.g. `[정확한 목적어]` or `[topic]`.
static PLACEHOLDER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\[[^\]\n]{1,80}\]").expect("placeholder pattern"));

/// Whether the text still contains an unfilled template placeholder.
pub fn has_placeholder_pattern(text: &str) -> bool {
    PLACEHOLDER.is_match(text)
}

/// Endings that mark a sentence as complete.
const COMPLETE_TAILS: [&str; 3] = ["…", "...", "…\""];
const SENTENCE_FINAL: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// Whether the text looks cut off mid-clause.
///
/// Ordered checks: empty counts as truncated; an ellipsis or sentence-final
/// punctuation counts as complete; a trailing grammatical particle from the
/// configured table counts as truncated; finally, a very short trailing token
/// (≤ 2 chars) counts as truncated.
pub fn looks_truncated(text: &str, cues: &CueConfig) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    if COMPLETE_TAILS.iter().any(|tail| trimmed.ends_with(tail)) {
        return false;
    }
    if trimmed
        .chars()
        .next_back()
        .is_some_and(|last| SENTENCE_FINAL.contains(&last))
    {
        return false;
    }
    if cues
        .truncation_tails
        .iter()
        .any(|tail| trimmed.ends_with(tail.as_str()))
    {
        return true;
    }
    let last_token = trimmed.split_whitespace().next_back().unwrap_or(trimmed);
    last_token.chars().count() <= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cues() -> CueConfig {
        CueConfig::default()
    }

    #[test]
    fn placeholder_pattern_matches_bracketed_spans() {
        assert!(has_placeholder_pattern("다음 [정확한 목적어]를 봐"));
        assert!(has_placeholder_pattern("start [topic] end"));
        assert!(!has_placeholder_pattern("괄호 없음"));
        // newline inside brackets is not a placeholder
        assert!(!has_placeholder_pattern("[줄\n바꿈]"));
    }

    #[test]
    fn ellipsis_is_complete() {
        assert!(!looks_truncated("…그는 문을 열었다…", &cues()));
        assert!(!looks_truncated("그랬지...", &cues()));
    }

    #[test]
    fn sentence_final_punctuation_is_complete() {
        assert!(!looks_truncated("문을 열었다.", &cues()));
        assert!(!looks_truncated("정말이야!", &cues()));
        assert!(!looks_truncated("갈까？", &cues()));
    }

    #[test]
    fn trailing_particle_is_truncated() {
        assert!(looks_truncated("그가 조용히 손을", &cues()));
        assert!(looks_truncated("차가운 바람이 불어오는 창가에", &cues()));
    }

    #[test]
    fn short_trailing_token_is_truncated() {
        // 1-character trailing token trips the gate
        assert!(looks_truncated("천천히 그", &cues()));
    }

    #[test]
    fn normal_long_ending_token_is_complete() {
        assert!(!looks_truncated("그는 웃으며 고개를 끄덕였다", &cues()));
    }

    #[test]
    fn empty_output_counts_as_truncated() {
        assert!(looks_truncated("", &cues()));
        assert!(looks_truncated("   ", &cues()));
    }
}
