//! Line-oriented operator console read from stdin.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// A user joined the session
    Join(String),
    /// A user left the session
    Leave(String),
    /// Run a backup right now
    Backup,
    /// Mark part of the dataset as edited
    Touch(String),
    Status,
    Reload,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCommandError(String);

impl fmt::Display for ParseCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (commands: join NAME, leave NAME, backup, touch LABEL, status, reload, quit)", self.0)
    }
}

impl std::error::Error for ParseCommandError {}

impl FromStr for ConsoleCommand {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let argument = |what: &str| {
            if rest.is_empty() {
                Err(ParseCommandError(format!("`{verb}` needs a {what}")))
            } else {
                Ok(rest.to_string())
            }
        };

        match verb.to_ascii_lowercase().as_str() {
            "join" => argument("user name").map(ConsoleCommand::Join),
            "leave" => argument("user name").map(ConsoleCommand::Leave),
            "touch" => argument("label").map(ConsoleCommand::Touch),
            "backup" => Ok(ConsoleCommand::Backup),
            "status" => Ok(ConsoleCommand::Status),
            "reload" => Ok(ConsoleCommand::Reload),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            "" => Err(ParseCommandError("empty command".to_string())),
            other => Err(ParseCommandError(format!("unknown command `{other}`"))),
        }
    }
}
