//! `!rp` command surface. Parsing is pure; dispatch lives in the Discord
//! handler so this table stays trivially testable.

/// Guide text sent for bare `!rp` and pinned for `!rp 가이드`.
pub const GUIDE_TEXT: &str = "RP 가이드\n\
- `!rp 시작 [주제]` — 새 장면 시작 (일반 채널에선 스레드를 만들어서 시작해)\n\
- `!rp 끝` — 장면 종료\n\
- `!rp 이름 [호칭]` — 내가 부를 호칭 설정 (비워서 보내면 해제)\n\
- `!rp 사용자명` — 현재 호칭 확인\n\
- `!rp 가이드` — 이 가이드를 다시 올리고 고정\n\
시작한 뒤에는 명령 없이 그냥 채팅하면 돼.";

/// Fixed reply for unrecognized subcommands.
pub const HELP_TEXT: &str =
    "명령: !rp 시작 [주제] / !rp 끝 / !rp 이름 [호칭] / !rp 가이드 / !rp 사용자명";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send the guide; `pin` for the explicit `가이드` form.
    Guide { pin: bool },
    /// Start a room, optionally seeded with a topic.
    Start { topic: String },
    /// End the room in (or under) the current channel.
    End,
    /// Set the caller's alias; empty clears it.
    SetAlias { alias: String },
    /// Report the alias currently resolved for the caller.
    WhoAmI,
    /// Unrecognized subcommand.
    Help,
}

impl Command {
    /// Parse a raw message. `None` means the message is not a command at
    /// all and should flow into normal chat handling.
    pub fn parse(text: &str) -> Option<Command> {
        let raw = text.trim();
        if raw.split_whitespace().next() != Some("!rp") {
            return None;
        }

        let rest = raw["!rp".len()..].trim_start();
        let Some(sub) = rest.split_whitespace().next() else {
            return Some(Command::Guide { pin: false });
        };
        // `rest` starts with `sub` after the trim, so this slice is safe.
        let tail = rest[sub.len()..].trim().to_string();

        Some(match sub {
            "시작" => Command::Start { topic: tail },
            "끝" => Command::End,
            "이름" | "호칭" => Command::SetAlias { alias: tail },
            "가이드" => Command::Guide { pin: true },
            "사용자명" | "이름확인" => Command::WhoAmI,
            _ => Command::Help,
        })
    }
}
