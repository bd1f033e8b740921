//! Line-oriented command surface: maps user text to session intents.

use livecast_core::models::Destination;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Play {
        destination: Destination,
        input: String,
    },
    Stop {
        destination: Destination,
    },
    Volume {
        destination: Destination,
        percent: u32,
    },
    Status {
        destination: Destination,
    },
    Help,
    Quit,
}

pub const USAGE: &str = "\
commands:
  play <host:port> <url>     queue a video for the destination
  stop <host:port>           stop playback and discard the queue
  volume <host:port> <0-400> set the live volume percent
  status <host:port>         show session state and queue
  help                       this text
  quit                       stop all sessions and exit";

/// Parse one input line. `None` for blank lines.
pub fn parse(line: &str) -> Option<Result<Command, String>> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;

    let command = match verb {
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "play" => match (parts.next(), parts.next()) {
            (Some(dest), Some(input)) => destination(dest).map(|destination| Command::Play {
                destination,
                input: input.to_string(),
            }),
            _ => Err("usage: play <host:port> <url>".to_string()),
        },
        "stop" | "disconnect" => match parts.next() {
            Some(dest) => destination(dest).map(|destination| Command::Stop { destination }),
            None => Err("usage: stop <host:port>".to_string()),
        },
        "volume" => match (parts.next(), parts.next()) {
            (Some(dest), Some(percent)) => match percent.parse::<u32>() {
                Ok(percent) => {
                    destination(dest).map(|destination| Command::Volume { destination, percent })
                }
                Err(_) => Err(format!("not a volume percent: {percent}")),
            },
            _ => Err("usage: volume <host:port> <percent>".to_string()),
        },
        "status" => match parts.next() {
            Some(dest) => destination(dest).map(|destination| Command::Status { destination }),
            None => Err("usage: status <host:port>".to_string()),
        },
        other => Err(format!("unknown command: {other} (try 'help')")),
    };

    Some(command)
}

/// `host:port` → destination (server = host, channel = port).
fn destination(raw: &str) -> Result<Destination, String> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected <host:port>, got '{raw}'"))?;
    if host.is_empty() {
        return Err(format!("expected <host:port>, got '{raw}'"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("not a UDP port: {port}"))?;
    Ok(Destination::new(host, port))
}
