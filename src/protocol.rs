/// Control commands a collaborator may receive over the wire. The server
/// itself does not interpret messages; this parser exists for subscribers
/// reacting to inbound text (see the binary's event loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

/// Case-insensitive match on a trimmed message token. Anything that is not
/// exactly a known command is `None`.
pub fn parse_command(message: &str) -> Option<Command> {
    match message.trim() {
        m if m.eq_ignore_ascii_case("start") => Some(Command::Start),
        m if m.eq_ignore_ascii_case("stop") => Some(Command::Stop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands_case_insensitively() {
        assert_eq!(parse_command("start"), Some(Command::Start));
        assert_eq!(parse_command("START"), Some(Command::Start));
        assert_eq!(parse_command("SToP"), Some(Command::Stop));
        assert_eq!(parse_command("  stop \r\n"), Some(Command::Stop));
    }

    #[test]
    fn rejects_everything_else() {
        assert_eq!(parse_command("restart"), None);
        assert_eq!(parse_command("start now"), None);
        assert_eq!(parse_command(""), None);
    }
}
