//! Server messages.
//!
//! - [`ServerMessage`]
//! - [`MessageChain`]
use std::fmt;

/// Highest severity that is still informational.
pub const MAX_INFO_SEVERITY: u8 = 10;

/// One ERROR, INFO or EED token.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub number: i32,
    pub state: u8,
    pub severity: u8,
    pub text: String,
    pub server: String,
    pub procedure: String,
    pub line: i32,
    /// Five character SQL state, only sent by Sybase.
    pub sql_state: Option<String>,
}

impl ServerMessage {
    /// Severity above 10 is an error, anything else is informational.
    pub fn is_error(&self) -> bool {
        self.severity > MAX_INFO_SEVERITY
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg {}, Level {}, State {}", self.number, self.severity, self.state)?;
        if !self.procedure.is_empty() {
            write!(f, ", Procedure {}", self.procedure)?;
        }
        if self.line > 0 {
            write!(f, ", Line {}", self.line)?;
        }
        write!(f, ": {}", self.text)
    }
}

impl fmt::Debug for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Ordered server messages of one request.
///
/// Used as the error payload when any message in the chain is an error.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MessageChain {
    messages: Vec<ServerMessage>,
}

impl MessageChain {
    pub fn new() -> MessageChain {
        MessageChain::default()
    }

    pub fn push(&mut self, message: ServerMessage) {
        self.messages.push(message);
    }

    /// Chain holds at least one message with severity above 10.
    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(ServerMessage::is_error)
    }

    /// First message with severity above 10.
    pub fn first_error(&self) -> Option<&ServerMessage> {
        self.messages.iter().find(|m| m.is_error())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ServerMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Take every message, leaving the chain empty.
    pub fn take(&mut self) -> MessageChain {
        std::mem::take(self)
    }
}

impl<'a> IntoIterator for &'a MessageChain {
    type Item = &'a ServerMessage;
    type IntoIter = std::slice::Iter<'a, ServerMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

impl IntoIterator for MessageChain {
    type Item = ServerMessage;
    type IntoIter = std::vec::IntoIter<ServerMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl std::error::Error for MessageChain { }

impl fmt::Display for MessageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.first_error().or(self.messages.first()) {
            Some(first) => {
                write!(f, "server error, {first}")?;
                if self.messages.len() > 1 {
                    write!(f, " (+{} more)", self.messages.len() - 1)?;
                }
                Ok(())
            },
            None => f.write_str("server error"),
        }
    }
}

impl fmt::Debug for MessageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.messages).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn message(number: i32, severity: u8) -> ServerMessage {
        ServerMessage {
            number,
            state: 1,
            severity,
            text: "boom".into(),
            server: "srv".into(),
            procedure: String::new(),
            line: 1,
            sql_state: None,
        }
    }

    #[test]
    fn severity_threshold() {
        let mut chain = MessageChain::new();
        chain.push(message(5701, 0));
        chain.push(message(50000, 10));
        assert!(!chain.has_errors());

        chain.push(message(2627, 14));
        assert!(chain.has_errors());
        assert_eq!(chain.first_error().unwrap().number, 2627);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn display_leads_with_error() {
        let mut chain = MessageChain::new();
        chain.push(message(5701, 0));
        chain.push(message(208, 16));
        assert_eq!(chain.to_string(), "server error, Msg 208, Level 16, State 1, Line 1: boom (+1 more)");
    }
}
