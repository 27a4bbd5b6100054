//! # Administrative Commands
//!
//! The line protocol of the control port. Payloads of `send:` are raw bytes,
//! so parsing works on byte slices.

use std::fmt;

use bytes::Bytes;

use crate::core::session::SessionInfo;

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// `reset server`: replace the downstream listener and all sessions.
    ResetDownstream,
    /// `list`: show every downstream session.
    ListSessions,
    /// `send:<bytes>`: queue bytes for the active station link.
    SendUpstream(Bytes),
}

impl AdminCommand {
    /// Parses one line with its terminator already removed.
    pub fn parse(line: &[u8]) -> Option<Self> {
        match line {
            b"reset server" => Some(AdminCommand::ResetDownstream),
            b"list" => Some(AdminCommand::ListSessions),
            [b's', b'e', b'n', b'd', b':', payload @ ..] if !payload.is_empty() => {
                Some(AdminCommand::SendUpstream(Bytes::copy_from_slice(payload)))
            }
            _ => None,
        }
    }
}

/// Result of executing a command, rendered as the text sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Answer to `list`.
    Sessions(Vec<SessionInfo>),
    /// `reset server` succeeded.
    DownstreamReset,
    /// `reset server` failed; the text says why.
    ResetFailed(String),
    /// `send:` queued this many bytes.
    Queued(usize),
    /// `send:` with no active station link.
    NoActiveStation,
    /// Unparseable line.
    Unknown,
}

impl fmt::Display for CommandReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandReply::Sessions(sessions) => {
                write!(f, "client count: {}\r\n", sessions.len())?;
                for s in sessions {
                    write!(f, "{}: {}, {}\r\n", s.id, s.address, s.sent_count)?;
                }
                Ok(())
            }
            CommandReply::DownstreamReset => f.write_str("downstream listener reset\r\n"),
            CommandReply::ResetFailed(reason) => write!(f, "reset failed: {}\r\n", reason),
            CommandReply::Queued(n) => write!(f, "queued {} bytes\r\n", n),
            CommandReply::NoActiveStation => f.write_str("no active station connection\r\n"),
            CommandReply::Unknown => f.write_str("unknown command\r\n"),
        }
    }
}
