//! Text command input for the headless peer.
//!
//! Each stdin line becomes one [`Command`]. Most commands wrap an [`Intent`];
//! the rest are game-logic hooks and host controls that have no key binding
//! in a real client.

use crate::signals::Intent;
use shared::{PeerId, Subject, Transform, Vec3};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Intent(Intent),
    Damage { target: PeerId, amount: f32 },
    GuardedObjectDestroyed,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("not a number: {0}")]
    InvalidNumber(String),
}

pub const HELP: &str = "\
commands:
  interact avatar <peer> | interact entity <id>
  cancel
  revive <peer>
  move <x> <y> <z> [yaw]
  ready
  start
  damage <peer> <amount>
  destroy
  quit";

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err(CommandError::Empty);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "interact" | "i" => {
            let kind = words.next().ok_or(CommandError::MissingArgument("subject"))?;
            let id = number(words.next(), "id")?;
            let subject = match kind {
                "avatar" | "a" => Subject::Avatar(id),
                "entity" | "e" => Subject::Entity(id),
                other => return Err(CommandError::Unknown(other.to_string())),
            };
            Command::Intent(Intent::Interact(subject))
        }
        "cancel" | "c" => Command::Intent(Intent::CancelInteract),
        "revive" | "r" => Command::Intent(Intent::Revive(number(words.next(), "peer")?)),
        "move" | "m" => {
            let x = number(words.next(), "x")?;
            let y = number(words.next(), "y")?;
            let z = number(words.next(), "z")?;
            let yaw = match words.next() {
                Some(word) => number(Some(word), "yaw")?,
                None => 0.0,
            };
            Command::Intent(Intent::Move(Transform {
                position: Vec3::new(x, y, z),
                yaw,
            }))
        }
        "ready" => Command::Intent(Intent::ToggleReady),
        "start" => Command::Intent(Intent::StartMatch),
        "damage" => Command::Damage {
            target: number(words.next(), "peer")?,
            amount: number(words.next(), "amount")?,
        },
        "destroy" => Command::GuardedObjectDestroyed,
        "quit" | "q" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };

    Ok(command)
}

fn number<T: std::str::FromStr>(word: Option<&str>, name: &'static str) -> Result<T, CommandError> {
    let word = word.ok_or(CommandError::MissingArgument(name))?;
    word.parse()
        .map_err(|_| CommandError::InvalidNumber(word.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interact() {
        assert_eq!(
            parse_command("interact avatar 3"),
            Ok(Command::Intent(Intent::Interact(Subject::Avatar(3))))
        );
        assert_eq!(
            parse_command("i e 7"),
            Ok(Command::Intent(Intent::Interact(Subject::Entity(7))))
        );
        assert_eq!(
            parse_command("interact rock 1"),
            Err(CommandError::Unknown("rock".to_string()))
        );
    }

    #[test]
    fn test_parse_move_with_optional_yaw() {
        assert_eq!(
            parse_command("move 1 0 2.5"),
            Ok(Command::Intent(Intent::Move(Transform::at(Vec3::new(1.0, 0.0, 2.5)))))
        );
        match parse_command("m 0 0 0 1.5") {
            Ok(Command::Intent(Intent::Move(t))) => assert_eq!(t.yaw, 1.5),
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_command("   "), Err(CommandError::Empty));
        assert_eq!(parse_command("revive"), Err(CommandError::MissingArgument("peer")));
        assert_eq!(
            parse_command("damage 2 lots"),
            Err(CommandError::InvalidNumber("lots".to_string()))
        );
        assert_eq!(parse_command("dance"), Err(CommandError::Unknown("dance".to_string())));
    }

    #[test]
    fn test_parse_host_commands() {
        assert_eq!(
            parse_command("damage 2 40"),
            Ok(Command::Damage {
                target: 2,
                amount: 40.0
            })
        );
        assert_eq!(parse_command("destroy"), Ok(Command::GuardedObjectDestroyed));
        assert_eq!(parse_command("QUIT"), Ok(Command::Quit));
        assert_eq!(parse_command("ready"), Ok(Command::Intent(Intent::ToggleReady)));
    }
}
