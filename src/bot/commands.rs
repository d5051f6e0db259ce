use std::time::Duration;

/// A prefix command recognised in chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Play { query: String, shuffle: bool },
    Skip,
    Clear,
    Queue,
    Disconnect,
    Summon,
    Help,
}

impl Command {
    /// Parses `content` if it starts with `prefix` and names a known verb.
    pub fn parse(prefix: &str, content: &str) -> Option<Self> {
        let rest = content.trim().strip_prefix(prefix)?;
        let (verb, args) = match rest.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (rest, ""),
        };

        let command = match verb.to_lowercase().as_str() {
            "play" | "p" => Self::parse_play(args),
            "skip" | "s" => Self::Skip,
            "clear" | "c" => Self::Clear,
            "queue" | "q" => Self::Queue,
            "disconnect" | "d" => Self::Disconnect,
            "summon" => Self::Summon,
            "help" | "h" => Self::Help,
            _ => return None,
        };
        Some(command)
    }

    // `play` with nothing to play shows the help instead
    fn parse_play(args: &str) -> Self {
        let (shuffle, query) = match args.split_once(char::is_whitespace) {
            Some((flag, query)) if is_random_flag(flag) => (true, query.trim()),
            None if is_random_flag(args) => (true, ""),
            _ => (false, args),
        };

        if query.is_empty() {
            return Self::Help;
        }
        Self::Play {
            query: query.to_string(),
            shuffle,
        }
    }

    /// How long the bot's reply stays in the channel.
    pub fn reply_ttl(&self) -> Duration {
        match self {
            Self::Queue => Duration::from_secs(15),
            Self::Help => Duration::from_secs(30),
            _ => Duration::from_secs(10),
        }
    }
}

fn is_random_flag(arg: &str) -> bool {
    matches!(arg, "-r" | "--random")
}

pub fn help_text(prefix: &str) -> String {
    format!(
        "**Commands**\n\
         `{p}play <link | search | spotify playlist>` (`{p}p`) queue tracks\n\
         `{p}play -r <link | playlist>` queue in random order\n\
         `{p}skip` (`{p}s`) skip the current track\n\
         `{p}clear` (`{p}c`) clear everything but the current track\n\
         `{p}queue` (`{p}q`) show the queue\n\
         `{p}summon` join your voice channel\n\
         `{p}disconnect` (`{p}d`) leave voice, keeping the queue\n\
         `{p}help` (`{p}h`) show this message",
        p = prefix
    )
}
