/// A line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Reply { parent_id: String, text: String },
    React { message_id: String, emoji: String },
    Join(String),
    Refresh,
    Quit,
    Help,
}

pub const HELP: &str = "\
commands:
  <text>                    send a message
  /reply <id> <text>        reply to a message
  /react <id> <emoji>       toggle a reaction
  /join <channel>           switch channel
  /refresh                  reload the channel
  /quit";

impl Command {
    /// Parse a prompt line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Say(line.to_string())));
        };

        let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let args = args.trim();
        let command = match name {
            "reply" => {
                let (parent_id, text) = two_args(args, "/reply <id> <text>")?;
                Self::Reply { parent_id, text }
            }
            "react" => {
                let (message_id, emoji) = two_args(args, "/react <id> <emoji>")?;
                Self::React { message_id, emoji }
            }
            "join" if !args.is_empty() && !args.contains(char::is_whitespace) => Self::Join(args.to_string()),
            "join" => return Err("usage: /join <channel>".into()),
            "refresh" => Self::Refresh,
            "quit" | "exit" => Self::Quit,
            "help" => Self::Help,
            other => return Err(format!("unknown command /{}, try /help", other)),
        };
        Ok(Some(command))
    }
}

fn two_args(args: &str, usage: &str) -> Result<(String, String), String> {
    match args.split_once(char::is_whitespace) {
        Some((first, rest)) if !rest.trim().is_empty() => Ok((first.to_string(), rest.trim().to_string())),
        _ => Err(format!("usage: {}", usage)),
    }
}
