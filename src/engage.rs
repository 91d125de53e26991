//! Natural disengagement policy: when to go silent in multi-party rooms.
//!
//! A two-state machine (Active, Suppressed) evaluated per inbound turn
//! before generation. The precedence order is load-bearing: re-engagement
//! on a direct call must be checked before continued silence.

use crate::config::CueConfig;

/// Message-derived inputs to the policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngageSignals {
    /// Current suppression state from `room.temp`.
    pub suppressed: bool,
    /// Explicit @-mention of the bot or a bot-name match in the text.
    pub direct_call: bool,
    /// The message contains a step-back cue phrase.
    pub step_back_cue: bool,
    /// The message mentions a participant other than the bot.
    pub mentions_other_participant: bool,
    /// Number of participants in the room.
    pub participant_count: usize,
}

/// What the engine should do with this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Un-suppress and generate a reply.
    Resume,
    /// Stay suppressed, no reply, no state change.
    StaySilent,
    /// Suppress and send one farewell acknowledgment (explicit step-back).
    WithdrawFarewell,
    /// Suppress and send one withdrawal acknowledgment (third-party
    /// conversation detected).
    WithdrawThirdParty,
    /// Generate a reply normally.
    Engage,
}

impl Decision {
    /// Whether this decision flips the suppression flag, and to what.
    pub fn suppression_transition(self) -> Option<bool> {
        match self {
            Decision::Resume => Some(false),
            Decision::WithdrawFarewell | Decision::WithdrawThirdParty => Some(true),
            Decision::StaySilent | Decision::Engage => None,
        }
    }
}

/// Evaluate the policy. Rules in order:
/// 1. suppressed + direct call → resume
/// 2. suppressed → stay silent
/// 3. step-back cue + direct call → withdraw with farewell
/// 4. ≥2 participants, not a direct call, mentions another participant →
///    withdraw (third-party conversation)
/// 5. otherwise → engage
///
/// Rule 4 intentionally triggers on any non-bot participant mention, even
/// when the message could be read as addressed to the bot too — preserved
/// from the source behavior pending a product decision.
pub fn decide(signals: EngageSignals) -> Decision {
    if signals.suppressed {
        if signals.direct_call {
            return Decision::Resume;
        }
        return Decision::StaySilent;
    }
    if signals.step_back_cue && signals.direct_call {
        return Decision::WithdrawFarewell;
    }
    if signals.participant_count >= 2
        && !signals.direct_call
        && signals.mentions_other_participant
    {
        return Decision::WithdrawThirdParty;
    }
    Decision::Engage
}

/// Whether the text addresses the bot by name. Mentions are resolved by the
/// platform layer; this covers plain-text name matches.
pub fn name_match(text: &str, bot_name: &str) -> bool {
    let bot_name = bot_name.trim();
    !bot_name.is_empty() && text.to_lowercase().contains(&bot_name.to_lowercase())
}

/// Whether the text contains any configured step-back cue.
pub fn has_step_back_cue(text: &str, cues: &CueConfig) -> bool {
    let lowered = text.to_lowercase();
    cues.step_back
        .iter()
        .any(|cue| lowered.contains(&cue.to_lowercase()))
}

/// One-line farewell acknowledgment for an explicit step-back request.
pub const FAREWELL_ACK: &str = "알겠어, 잠깐 빠져 있을게. 부르면 다시 올게.";

/// One-line withdrawal acknowledgment when a third-party conversation is
/// detected.
pub const WITHDRAW_ACK: &str = "둘이 얘기 나눠. 필요하면 불러줘.";
