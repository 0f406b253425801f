use anyhow::{anyhow, bail, Result};
use simple_mesh::{ConnectionState, EmittedEvents, PeerId, PeerStatus, RosterEntry};

/// a line typed at the node's prompt
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Call(PeerId),
    Chat(PeerId),
    Hangup(PeerId),
    End,
    Say(String),
    React(String),
    Status(PeerStatus),
    Name(String),
    /// None leaves the room
    Room(Option<String>),
    CreateRoom,
    Volume(PeerId, f32),
    Mute(PeerId),
    Resume,
    Peers,
    Roster,
    Help,
    Quit,
}

pub const HELP: &str = "\
/call <addr>          start an audio call (and data channel) with the node at <addr>
/chat <addr>          open only a data channel to <addr>
/hangup <addr>        end the call with <addr>
/end                  end every call and release the microphone
/react <emoji>        send a reaction
/status <s>           online | away | busy | offline
/name <label>         change the name shown to others
/room [code]          join a room code, or leave the room when no code is given
/create-room          generate a new room code
/volume <addr> <0-1>  playback volume for <addr>
/mute <addr>          toggle mute for <addr>
/resume               retry playback that was blocked
/peers                connection state of every peer
/roster               presence records
/quit
anything else is sent as a chat message";

pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        bail!("empty input");
    }
    if !line.starts_with('/') {
        return Ok(Command::Say(line.to_string()));
    }

    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    let peer = || -> Result<PeerId> {
        match rest.split_whitespace().next() {
            Some(p) => Ok(PeerId::from(p)),
            None => Err(anyhow!("{} needs a peer address", cmd)),
        }
    };

    let parsed = match cmd {
        "/call" => Command::Call(peer()?),
        "/chat" => Command::Chat(peer()?),
        "/hangup" => Command::Hangup(peer()?),
        "/end" => Command::End,
        "/say" => {
            if rest.is_empty() {
                bail!("nothing to say");
            }
            Command::Say(rest.to_string())
        }
        "/react" => {
            if rest.is_empty() {
                bail!("/react needs an emoji");
            }
            Command::React(rest.to_string())
        }
        "/status" => Command::Status(rest.parse()?),
        "/name" => Command::Name(rest.to_string()),
        "/room" => Command::Room(if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }),
        "/create-room" => Command::CreateRoom,
        "/volume" => {
            let mut args = rest.split_whitespace();
            let peer = args
                .next()
                .ok_or_else(|| anyhow!("/volume needs a peer address"))?;
            let volume: f32 = args
                .next()
                .ok_or_else(|| anyhow!("/volume needs a level"))?
                .parse()?;
            Command::Volume(peer.into(), volume)
        }
        "/mute" => Command::Mute(peer()?),
        "/resume" => Command::Resume,
        "/peers" => Command::Peers,
        "/roster" => Command::Roster,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => bail!("unknown command: {}", other),
    };
    Ok(parsed)
}

/// one line for the terminal
pub fn describe_event(evt: &EmittedEvents) -> String {
    match evt {
        EmittedEvents::ConnectionStateChanged { peer, state } => {
            format!("* {} is {}", peer, state)
        }
        EmittedEvents::StreamAttached { peer } => format!("* receiving audio from {}", peer),
        EmittedEvents::PeerDisconnected { peer } => format!("* {} left", peer),
        EmittedEvents::PeerError { peer, error } => format!("! {}: {}", peer, error),
        EmittedEvents::RosterChanged { roster } => {
            format!("* roster changed ({} peers)", roster.len())
        }
        EmittedEvents::ChatReceived {
            sender, text, timestamp, ..
        } => format!("[{}] {}: {}", clock(*timestamp), sender, text),
        EmittedEvents::ReactionReceived {
            peer,
            emoji,
            timestamp,
        } => format!("[{}] {} reacted {}", clock(*timestamp), peer, emoji),
        EmittedEvents::PeerLimitWarning { active } => format!(
            "! {} peers connected, audio may degrade in a mesh this size",
            active
        ),
    }
}

pub fn describe_states(states: &[(PeerId, ConnectionState)]) -> String {
    if states.is_empty() {
        return "no peers".into();
    }
    states
        .iter()
        .map(|(peer, state)| format!("{:<24} {}", peer.to_string(), state))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn describe_roster(roster: &[RosterEntry]) -> String {
    roster
        .iter()
        .map(|e| {
            format!(
                "{:<24} {:<16} {:<8} {}",
                e.id.to_string(),
                e.label.as_deref().unwrap_or("-"),
                e.status
                    .map(|s| format!("{:?}", s).to_lowercase())
                    .unwrap_or_else(|| "-".into()),
                e.room_code().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clock(timestamp: u64) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_millis_opt(timestamp as i64) {
        chrono::LocalResult::Single(t) => t.format("%H:%M:%S").to_string(),
        _ => "--:--:--".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(
            parse_command("  hello there ").unwrap(),
            Command::Say("hello there".into())
        );
        assert!(parse_command("   ").is_err());
    }

    #[test]
    fn peer_commands_need_an_address() {
        assert_eq!(
            parse_command("/call 127.0.0.1:5000").unwrap(),
            Command::Call("127.0.0.1:5000".into())
        );
        assert!(parse_command("/call").is_err());
        assert!(parse_command("/mute").is_err());
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(
            parse_command("/status Away").unwrap(),
            Command::Status(PeerStatus::Away)
        );
        assert!(parse_command("/status sleeping").is_err());
        assert_eq!(
            parse_command("/volume b:1 0.25").unwrap(),
            Command::Volume("b:1".into(), 0.25)
        );
        assert!(parse_command("/volume b:1 loud").is_err());
        assert_eq!(parse_command("/room").unwrap(), Command::Room(None));
        assert_eq!(
            parse_command("/room abc123").unwrap(),
            Command::Room(Some("abc123".into()))
        );
        assert!(parse_command("/dance").is_err());
    }

    #[test]
    fn describes_events() {
        let line = describe_event(&EmittedEvents::PeerLimitWarning { active: 5 });
        assert!(line.contains('5'));
        let line = describe_event(&EmittedEvents::ConnectionStateChanged {
            peer: "b".into(),
            state: ConnectionState::Connected,
        });
        assert!(line.starts_with("* b is"));
        assert_eq!(describe_states(&[]), "no peers");
    }
}
