//! Closing-time body parser.
//!
//! Materializes the hash commands of a post being force-closed. Every
//! whitespace separated `#word` is looked at; unknown words are plain text.

use rand::seq::SliceRandom;
use rand::Rng;

use domains::{BodyParser, BoardConfigs, Command, ParseError, ParsedBody};

/// Longest accepted body, in characters.
pub const MAX_BODY_LEN: usize = 2000;
/// Commands past this many in one post are left as text.
pub const MAX_COMMANDS: usize = 10;
const MAX_DICE: u16 = 10;
const MAX_DIE_FACES: u16 = 10_000;

/// Produces commands only. `>>id` links need the thread of the target post,
/// which this parser has no store to look up, so they stay plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashCommandParser;

impl BodyParser for HashCommandParser {
    fn parse(&self, body: &str, conf: &BoardConfigs, _is_closing: bool) -> Result<ParsedBody, ParseError> {
        if body.chars().count() > MAX_BODY_LEN {
            return Err(ParseError::BadInput(format!("body exceeds {MAX_BODY_LEN} characters")));
        }
        if body.contains('\0') {
            return Err(ParseError::BadInput("body contains a NUL character".into()));
        }

        let mut rng = rand::thread_rng();
        let commands = body
            .split_whitespace()
            .filter_map(|word| word.strip_prefix('#'))
            .filter_map(|word| parse_command(word, conf, &mut rng))
            .take(MAX_COMMANDS)
            .collect();
        Ok(ParsedBody { links: Vec::new(), commands })
    }
}

fn parse_command(word: &str, conf: &BoardConfigs, rng: &mut impl Rng) -> Option<Command> {
    match word {
        "flip" => Some(Command::Flip(rng.gen_bool(0.5))),
        "8ball" => conf.eightball.choose(rng).cloned().map(Command::EightBall),
        _ => {
            let (dice, faces) = parse_dice(word)?;
            Some(Command::Dice((0..dice).map(|_| rng.gen_range(1..=faces)).collect()))
        }
    }
}

/// `d6` or `3d20`, within sane bounds.
fn parse_dice(word: &str) -> Option<(u16, u16)> {
    let (count, faces) = word.split_once('d')?;
    let count = if count.is_empty() { 1 } else { count.parse().ok()? };
    let faces: u16 = faces.parse().ok()?;
    let valid = (1..=MAX_DICE).contains(&count) && (2..=MAX_DIE_FACES).contains(&faces);
    valid.then_some((count, faces))
}
