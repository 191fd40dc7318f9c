//! Line commands typed into the student list screen.

use thiserror::Error;

pub const HELP: &str = "\
commands:
  add <name>           add a student
  remove <id>          remove a student
  rename <id> <name>   change a student's name
  sync                 push and pull once with the remote
  online               start continuous sync
  offline              stop continuous sync
  list                 print the list
  help                 show this help
  quit                 exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Add(String),
    Remove(String),
    Rename { id: String, name: String },
    Sync,
    Online,
    Offline,
    List,
    Help,
    Quit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("empty line")]
    Empty,
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one line. Names may contain spaces; ids may not.
pub fn parse(line: &str) -> Result<Input, InputError> {
    let line = line.trim();
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command.to_ascii_lowercase().as_str() {
        "" => Err(InputError::Empty),
        "add" if !rest.is_empty() => Ok(Input::Add(rest.to_string())),
        "add" => Err(InputError::Usage("add <name>")),
        "remove" | "rm" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
            [id] => Ok(Input::Remove(id.to_string())),
            _ => Err(InputError::Usage("remove <id>")),
        },
        "rename" => match rest.split_once(char::is_whitespace) {
            Some((id, name)) if !name.trim().is_empty() => Ok(Input::Rename {
                id: id.to_string(),
                name: name.trim().to_string(),
            }),
            _ => Err(InputError::Usage("rename <id> <name>")),
        },
        "sync" => Ok(Input::Sync),
        "online" => Ok(Input::Online),
        "offline" => Ok(Input::Offline),
        "list" | "ls" => Ok(Input::List),
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" | "q" => Ok(Input::Quit),
        other => Err(InputError::Unknown(other.to_string())),
    }
}
