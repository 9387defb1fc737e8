//! Console command parsing for rtcctl

use rtcproto::CommandParams;
use thiserror::Error;

/// One line typed by the operator
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Issue(CommandParams),
    Status,
    Reconnect,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error("'{command}' takes {expected} argument(s)")]
    ArgumentCount { command: String, expected: usize },

    #[error("'{0}' is not a number")]
    InvalidNumber(String),
}

pub const HELP: &str = "\
commands:
  ping                      check the mount answers
  move <az> <el>            slew to azimuth/elevation in degrees
  halt                      stop all motion
  track <az-rate> <el-rate> track at degrees per second
  home                      return to the home position
  set <name> <value>        set a mount parameter
  status                    show link health and latest telemetry
  reconnect                 drop and re-establish the link
  quit                      leave";

fn number(word: &str) -> Result<f64, ParseError> {
    word.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber(word.to_string()))
}

fn arguments<'a>(command: &str, args: &[&'a str], expected: usize) -> Result<Vec<&'a str>, ParseError> {
    if args.len() != expected {
        return Err(ParseError::ArgumentCount {
            command: command.to_string(),
            expected,
        });
    }
    Ok(args.to_vec())
}

/// Parse one console line
pub fn parse_line(line: &str) -> Result<ConsoleCommand, ParseError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let (command, args) = match words.split_first() {
        Some((command, args)) => (command.to_ascii_lowercase(), args),
        None => return Err(ParseError::Empty),
    };

    let parsed = match command.as_str() {
        "ping" => {
            arguments(&command, args, 0)?;
            ConsoleCommand::Issue(CommandParams::Ping)
        }
        "move" => {
            let args = arguments(&command, args, 2)?;
            ConsoleCommand::Issue(CommandParams::Move {
                azimuth: number(args[0])?,
                elevation: number(args[1])?,
            })
        }
        "halt" => {
            arguments(&command, args, 0)?;
            ConsoleCommand::Issue(CommandParams::Halt)
        }
        "track" => {
            let args = arguments(&command, args, 2)?;
            ConsoleCommand::Issue(CommandParams::SetTrackingRate {
                azimuth_rate: number(args[0])?,
                elevation_rate: number(args[1])?,
            })
        }
        "home" => {
            arguments(&command, args, 0)?;
            ConsoleCommand::Issue(CommandParams::Home)
        }
        "set" => {
            let args = arguments(&command, args, 2)?;
            ConsoleCommand::Issue(CommandParams::SetParameter {
                name: args[0].to_string(),
                value: number(args[1])?,
            })
        }
        "status" => ConsoleCommand::Status,
        "reconnect" => ConsoleCommand::Reconnect,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        _ => return Err(ParseError::Unknown(command)),
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("ping"), Ok(ConsoleCommand::Issue(CommandParams::Ping)));
        assert_eq!(
            parse_line("  MOVE 120.5 45 "),
            Ok(ConsoleCommand::Issue(CommandParams::Move { azimuth: 120.5, elevation: 45.0 }))
        );
        assert_eq!(
            parse_line("track 0.004 -0.001"),
            Ok(ConsoleCommand::Issue(CommandParams::SetTrackingRate {
                azimuth_rate: 0.004,
                elevation_rate: -0.001,
            }))
        );
        assert_eq!(
            parse_line("set slew_rate 2"),
            Ok(ConsoleCommand::Issue(CommandParams::SetParameter {
                name: "slew_rate".to_string(),
                value: 2.0,
            }))
        );
        assert_eq!(parse_line("status"), Ok(ConsoleCommand::Status));
        assert_eq!(parse_line("reconnect"), Ok(ConsoleCommand::Reconnect));
        assert_eq!(parse_line("quit"), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_line("   "), Err(ParseError::Empty));
        assert_eq!(parse_line("park"), Err(ParseError::Unknown("park".to_string())));
        assert_eq!(
            parse_line("move 10"),
            Err(ParseError::ArgumentCount { command: "move".to_string(), expected: 2 })
        );
        assert_eq!(parse_line("halt now"), Err(ParseError::ArgumentCount { command: "halt".to_string(), expected: 0 }));
        assert_eq!(parse_line("move ten 20"), Err(ParseError::InvalidNumber("ten".to_string())));
        assert_eq!(parse_line("set x NaN"), Err(ParseError::InvalidNumber("NaN".to_string())));
    }
}
