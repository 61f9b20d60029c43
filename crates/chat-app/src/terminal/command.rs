use std::path::PathBuf;

pub const HELP: &str = "\
commands:
  /new             start a new chat
  /temp on|off     toggle temporary chats (hidden from the list)
  /list            show saved chats
  /open <n>        open chat n from the last list
  /delete <n>      delete chat n from the last list
  /image <path>    ask about an image
  /model <id>      switch model and save it to settings
  /quit            exit
anything else is sent to the current chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    NewChat,
    Temporary(bool),
    List,
    Open(usize),
    Delete(usize),
    Image(PathBuf),
    Model(String),
    Help,
    Quit,
    /// Recognized command with a bad argument; carries the usage hint.
    Invalid(&'static str),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    match name {
        "new" => Command::NewChat,
        "temp" => match argument {
            "on" => Command::Temporary(true),
            "off" => Command::Temporary(false),
            _ => Command::Invalid("usage: /temp on|off"),
        },
        "list" => Command::List,
        "open" => parse_index(argument).map_or(Command::Invalid("usage: /open <n>"), Command::Open),
        "delete" => {
            parse_index(argument).map_or(Command::Invalid("usage: /delete <n>"), Command::Delete)
        }
        "image" if !argument.is_empty() => Command::Image(PathBuf::from(argument)),
        "image" => Command::Invalid("usage: /image <path>"),
        "model" if !argument.is_empty() => Command::Model(argument.to_string()),
        "model" => Command::Invalid("usage: /model <id>"),
        "quit" | "exit" => Command::Quit,
        _ => Command::Help,
    }
}

/// List positions are shown 1-based.
fn parse_index(argument: &str) -> Option<usize> {
    argument
        .parse::<usize>()
        .ok()
        .and_then(|index| index.checked_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_sent_trimmed() {
        assert_eq!(parse_command("  hello there \n"), Command::Send("hello there".into()));
        assert_eq!(parse_command("   "), Command::Send(String::new()));
    }

    #[test]
    fn commands_with_arguments() {
        assert_eq!(parse_command("/temp on"), Command::Temporary(true));
        assert_eq!(parse_command("/temp off"), Command::Temporary(false));
        assert_eq!(parse_command("/open 2"), Command::Open(1));
        assert_eq!(parse_command("/delete 1"), Command::Delete(0));
        assert_eq!(
            parse_command("/image ./cat photo.png"),
            Command::Image(PathBuf::from("./cat photo.png"))
        );
        assert_eq!(parse_command("/model gpt-4o"), Command::Model("gpt-4o".into()));
    }

    #[test]
    fn bad_arguments_report_usage() {
        assert!(matches!(parse_command("/open 0"), Command::Invalid(_)));
        assert!(matches!(parse_command("/open x"), Command::Invalid(_)));
        assert!(matches!(parse_command("/temp maybe"), Command::Invalid(_)));
        assert!(matches!(parse_command("/image"), Command::Invalid(_)));
        assert_eq!(parse_command("/unknown"), Command::Help);
    }
}
