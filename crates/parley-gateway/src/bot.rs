use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

/// Fixed identity the bot posts under.
pub const BOT_USER_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0b07);
pub const BOT_NAME: &str = "Bot";

const DICE_FACES: [&str; 6] = ["⚀", "⚁", "⚂", "⚃", "⚄", "⚅"];
const POLL_USAGE: &str = "❌ **Invalid Poll Format**\n\n\
     Usage: `/poll \"Your question?\" \"Option 1\" \"Option 2\"`";
const MOVE_USAGE: &str = "❌ Usage: `/move <row> <col>` with row and col between 0 and 2";
const GAME_USAGE: &str = "❌ Usage: `/game ttt @user`";
const SCHEDULE_USAGE: &str = "❌ **Invalid time format!**\n\n\
     Use: `<number><unit>` with `s`, `m`, `h` or `d`, up to 30 days\n\n\
     Example: `/schedule 30m Reminder!`";
const CANCEL_USAGE: &str = "❌ Usage: `/cancelschedule <id>`";
const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(30 * 86_400);

/// A slash command typed into chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Help,
    Dice,
    Flip,
    Poll {
        question: String,
        options: Vec<String>,
    },
    /// Tic-tac-toe challenge by username
    Game { opponent: String },
    Move { row: u8, col: u8 },
    Resign,
    /// Post `content` as the author once `delay` has passed
    Schedule { delay: Duration, content: String },
    Schedules,
    CancelSchedule { id: String },
    /// Recognized command with bad arguments; carries the usage text
    Usage(&'static str),
    Unknown(String),
}

/// None if the content is not a command at all.
pub fn parse(content: &str) -> Option<BotCommand> {
    let rest = content.trim().strip_prefix('/')?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let cmd = match name.to_ascii_lowercase().as_str() {
        "help" => BotCommand::Help,
        "dice" | "roll" => BotCommand::Dice,
        "flip" | "coin" => BotCommand::Flip,
        "poll" => {
            let mut parts = quoted(args);
            if parts.len() < 3 {
                BotCommand::Usage(POLL_USAGE)
            } else {
                let question = parts.remove(0);
                BotCommand::Poll {
                    question,
                    options: parts,
                }
            }
        }
        "game" => {
            let mut words = args.split_whitespace();
            match (words.next(), words.next()) {
                (Some(kind), Some(user)) if kind.eq_ignore_ascii_case("ttt") => {
                    BotCommand::Game {
                        opponent: user.trim_start_matches('@').to_string(),
                    }
                }
                _ => BotCommand::Usage(GAME_USAGE),
            }
        }
        "move" => {
            let coords: Vec<Option<u8>> = args.split_whitespace().map(|w| w.parse().ok()).collect();
            match coords.as_slice() {
                [Some(row), Some(col)] if *row <= 2 && *col <= 2 => BotCommand::Move {
                    row: *row,
                    col: *col,
                },
                _ => BotCommand::Usage(MOVE_USAGE),
            }
        }
        "resign" => BotCommand::Resign,
        "schedule" => {
            let (spec, content) = match args.split_once(char::is_whitespace) {
                Some((spec, content)) => (spec, content.trim()),
                None => (args, ""),
            };
            match delay_spec(spec) {
                Some(delay) if !content.is_empty() => BotCommand::Schedule {
                    delay,
                    content: content.to_string(),
                },
                _ => BotCommand::Usage(SCHEDULE_USAGE),
            }
        }
        "schedules" => BotCommand::Schedules,
        "cancelschedule" => match args.split_whitespace().next() {
            Some(id) => BotCommand::CancelSchedule {
                id: id.trim_matches('`').to_string(),
            },
            None => BotCommand::Usage(CANCEL_USAGE),
        },
        other => BotCommand::Unknown(other.to_string()),
    };
    Some(cmd)
}

/// `<number><unit>` with unit one of s, m, h, d.
fn delay_spec(spec: &str) -> Option<Duration> {
    let unit = spec.chars().last()?;
    let per_unit = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        _ => return None,
    };
    let digits = &spec[..spec.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs = digits.parse::<u64>().ok()?.checked_mul(per_unit)?;
    let delay = Duration::from_secs(secs);
    (secs > 0 && delay <= MAX_SCHEDULE_DELAY).then_some(delay)
}

/// `90s` style, largest whole unit.
pub fn format_delay(delay: Duration) -> String {
    let secs = delay.as_secs();
    match secs {
        0 => "now".to_string(),
        1..60 => format!("{}s", secs),
        60..3_600 => format!("{}m", secs / 60),
        3_600..86_400 => format!("{}h", secs / 3_600),
        _ => format!("{}d", secs / 86_400),
    }
}

/// Every `"..."` segment, in order.
fn quoted(args: &str) -> Vec<String> {
    args.split('"')
        .skip(1)
        .step_by(2)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn help_text() -> String {
    "🤖 **Available Commands**\n\n\
     **🎲 Fun**\n\
     • `/dice` - Roll a dice 🎲\n\
     • `/flip` - Flip a coin 🪙\n\
     • `/poll \"Q?\" \"A\" \"B\"` - Create poll\n\n\
     **🎮 Games**\n\
     • `/game ttt @user` - Tic-Tac-Toe\n\
     • `/move <r> <c>` - Make move\n\
     • `/resign` - Quit game\n\n\
     **⏰ Scheduling**\n\
     • `/schedule 10m msg` - Send later\n\
     • `/schedules` - List pending\n\
     • `/cancelschedule <id>`\n\n\
     **🤖 AI**\n\
     • `@ai <question>` - Ask AI"
        .to_string()
}

pub fn roll_dice<R: Rng + ?Sized>(rng: &mut R) -> String {
    let roll: usize = rng.random_range(1..=6);
    format!(
        "🎲 **Dice Roll**\n\nYou rolled: {} **{}**",
        DICE_FACES[roll - 1],
        roll
    )
}

pub fn flip_coin<R: Rng + ?Sized>(rng: &mut R) -> String {
    let result = if rng.random_bool(0.5) {
        "**HEADS** 👑"
    } else {
        "**TAILS** 🦅"
    };
    format!("🪙 **Coin Flip**\n\nResult: {}", result)
}

pub fn unknown_text(name: &str) -> String {
    format!(
        "❓ Unknown command: /{}\nType /help for available commands.",
        name
    )
}

/// What the bot says for a command, or None for commands that act on a
/// poll, a game or the schedule instead.
pub fn canned_reply(command: &BotCommand) -> Option<String> {
    let mut rng = rand::rng();
    match command {
        BotCommand::Help => Some(help_text()),
        BotCommand::Dice => Some(roll_dice(&mut rng)),
        BotCommand::Flip => Some(flip_coin(&mut rng)),
        BotCommand::Usage(usage) => Some(usage.to_string()),
        BotCommand::Unknown(name) => Some(unknown_text(name)),
        BotCommand::Poll { .. }
        | BotCommand::Game { .. }
        | BotCommand::Move { .. }
        | BotCommand::Resign
        | BotCommand::Schedule { .. }
        | BotCommand::Schedules
        | BotCommand::CancelSchedule { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse("hello"), None);
        assert_eq!(parse(" /help "), Some(BotCommand::Help));
    }

    #[test]
    fn aliases() {
        assert_eq!(parse("/roll"), Some(BotCommand::Dice));
        assert_eq!(parse("/COIN"), Some(BotCommand::Flip));
        assert_eq!(
            parse("/nope"),
            Some(BotCommand::Unknown("nope".to_string()))
        );
    }

    #[test]
    fn poll_parses_quoted_parts() {
        assert_eq!(
            parse(r#"/poll "Best language?" "Rust" "C++" "Go""#),
            Some(BotCommand::Poll {
                question: "Best language?".into(),
                options: vec!["Rust".into(), "C++".into(), "Go".into()],
            })
        );
        assert_eq!(
            parse(r#"/poll "Only a question?" "one""#),
            Some(BotCommand::Usage(POLL_USAGE))
        );
    }

    #[test]
    fn game_commands() {
        assert_eq!(
            parse("/game ttt @bob"),
            Some(BotCommand::Game {
                opponent: "bob".into()
            })
        );
        assert_eq!(parse("/move 1 2"), Some(BotCommand::Move { row: 1, col: 2 }));
        assert_eq!(parse("/move 1 5"), Some(BotCommand::Usage(MOVE_USAGE)));
        assert_eq!(parse("/resign"), Some(BotCommand::Resign));
    }

    #[test]
    fn schedule_commands() {
        assert_eq!(
            parse("/schedule 10m stand-up in five"),
            Some(BotCommand::Schedule {
                delay: Duration::from_secs(600),
                content: "stand-up in five".into(),
            })
        );
        assert_eq!(
            parse("/schedule 2d x"),
            Some(BotCommand::Schedule {
                delay: Duration::from_secs(2 * 86_400),
                content: "x".into(),
            })
        );
        assert_eq!(parse("/schedule 10m"), Some(BotCommand::Usage(SCHEDULE_USAGE)));
        assert_eq!(parse("/schedule 10 hi"), Some(BotCommand::Usage(SCHEDULE_USAGE)));
        assert_eq!(parse("/schedule -5s hi"), Some(BotCommand::Usage(SCHEDULE_USAGE)));
        assert_eq!(parse("/schedule 0s hi"), Some(BotCommand::Usage(SCHEDULE_USAGE)));
        assert_eq!(parse("/schedule 31d hi"), Some(BotCommand::Usage(SCHEDULE_USAGE)));
        assert_eq!(
            parse("/schedule 99999999999999999999d hi"),
            Some(BotCommand::Usage(SCHEDULE_USAGE))
        );
        assert_eq!(parse("/schedules"), Some(BotCommand::Schedules));
        assert_eq!(
            parse("/cancelschedule `sched_abc`"),
            Some(BotCommand::CancelSchedule {
                id: "sched_abc".into()
            })
        );
        assert_eq!(parse("/cancelschedule"), Some(BotCommand::Usage(CANCEL_USAGE)));
    }

    #[test]
    fn delays_format_in_the_largest_unit() {
        assert_eq!(format_delay(Duration::from_secs(45)), "45s");
        assert_eq!(format_delay(Duration::from_secs(600)), "10m");
        assert_eq!(format_delay(Duration::from_secs(7_300)), "2h");
        assert_eq!(format_delay(Duration::from_secs(3 * 86_400)), "3d");
        assert_eq!(format_delay(Duration::ZERO), "now");
    }

    #[test]
    fn dice_stays_in_range() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let text = roll_dice(&mut rng);
            let n: usize = text
                .rsplit("**")
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap();
            assert!((1..=6).contains(&n));
        }
        assert!(flip_coin(&mut rng).contains("Coin Flip"));
    }

    #[test]
    fn only_chatty_commands_have_canned_replies() {
        assert!(canned_reply(&BotCommand::Help).unwrap().contains("/dice"));
        assert!(canned_reply(&BotCommand::Unknown("x".into())).unwrap().contains("/x"));
        assert_eq!(canned_reply(&BotCommand::Resign), None);
        assert_eq!(canned_reply(&BotCommand::Move { row: 0, col: 0 }), None);
        assert_eq!(canned_reply(&BotCommand::Schedules), None);
        assert!(help_text().contains("/schedule"));
    }
}
