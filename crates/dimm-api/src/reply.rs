//! Parser for inbound OpenTPL lines.
//!
//! Every line the device sends is classified into a [`Reply`]. Parsing is
//! tolerant of repeated whitespace and surrounding blanks; anything that does
//! not match a known shape is a [`Error::Protocol`] and is expected to be
//! logged and dropped by the caller.

use std::sync::LazyLock;

use regex::Regex;

use crate::command::{CommandId, DataValue, unquote};
use crate::error::Error;

static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+COMMAND\s+(\S+)(?:\s+(.*))?$").expect("invalid COMMAND regex")
});
static DATA_INLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+DATA\s+INLINE\s+([^\s=]+)\s*=(.*)$").expect("invalid DATA INLINE regex")
});
static DATA_OK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+DATA\s+OK\s+(\S+)").expect("invalid DATA OK regex")
});
static DATA_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+DATA\s+ERROR\s+(\S+)\s+(.+)$").expect("invalid DATA ERROR regex")
});
static EVENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+EVENT\s+(\S+)\s+([^\s:]+):(\d+):?(?:\s+(.*))?$")
        .expect("invalid EVENT regex")
});
static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^AUTH\s+(\S+)(?:\s+(\d+)\s+(\d+))?").expect("invalid AUTH regex")
});

// ── Reply types ──────────────────────────────────────────────────────

/// Second word of a `COMMAND` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// Accepted; data and a final `COMPLETE`/`FAILED` follow.
    Ok,
    Complete,
    Failed { message: Option<String> },
    /// `ERROR UNKNOWN`, `ERROR UNAUTHENTICATED`, `ERROR IDBUSY n`, ...
    Error { detail: String },
    AbortedBy { detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Connection banner, e.g. `TPL2 2.0 CONN 1 AUTH PLAIN ENC`.
    Welcome { banner: String },
    Auth {
        ok: bool,
        read_level: Option<u8>,
        write_level: Option<u8>,
    },
    Disconnect,
    Command {
        id: CommandId,
        status: CommandStatus,
    },
    DataInline {
        id: CommandId,
        name: String,
        value: DataValue,
    },
    DataOk {
        id: CommandId,
        name: String,
    },
    DataError {
        id: CommandId,
        name: String,
        reason: String,
    },
    Event {
        id: CommandId,
        kind: String,
        name: String,
        number: u32,
        description: Option<String>,
    },
}

impl Reply {
    /// Identifier carried by the line, if the shape has one.
    pub fn id(&self) -> Option<CommandId> {
        match self {
            Self::Command { id, .. }
            | Self::DataInline { id, .. }
            | Self::DataOk { id, .. }
            | Self::DataError { id, .. }
            | Self::Event { id, .. } => Some(*id),
            Self::Welcome { .. } | Self::Auth { .. } | Self::Disconnect => None,
        }
    }

    /// `true` if the line belongs to an issued command rather than being
    /// pushed by the device on its own.
    pub fn is_correlated(&self) -> bool {
        !matches!(self, Self::Event { .. }) && self.id().is_some_and(|id| !id.is_unsolicited())
    }
}

// ── Parsing ──────────────────────────────────────────────────────────

/// Classify one inbound line.
pub fn parse(line: &str) -> Result<Reply, Error> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::Protocol("empty line".into()));
    }

    if let Some(caps) = COMMAND_RE.captures(line) {
        let id = parse_id(&caps[1])?;
        let rest = caps.get(3).map(|m| m.as_str().trim()).filter(|s| !s.is_empty());
        let status = match &caps[2] {
            "OK" => CommandStatus::Ok,
            "COMPLETE" => CommandStatus::Complete,
            "FAILED" => CommandStatus::Failed {
                message: rest.map(|s| unquote(s).to_owned()),
            },
            "ERROR" => CommandStatus::Error {
                detail: rest.unwrap_or("unspecified").to_owned(),
            },
            "ABORTEDBY" => CommandStatus::AbortedBy {
                detail: rest.unwrap_or_default().to_owned(),
            },
            other => {
                return Err(Error::Protocol(format!("unknown COMMAND status '{other}'")));
            }
        };
        return Ok(Reply::Command { id, status });
    }

    if let Some(caps) = DATA_INLINE_RE.captures(line) {
        return Ok(Reply::DataInline {
            id: parse_id(&caps[1])?,
            name: caps[2].to_owned(),
            value: DataValue::from_wire(&caps[3]),
        });
    }

    if let Some(caps) = DATA_ERROR_RE.captures(line) {
        return Ok(Reply::DataError {
            id: parse_id(&caps[1])?,
            name: caps[2].to_owned(),
            reason: caps[3].trim().to_owned(),
        });
    }

    if let Some(caps) = DATA_OK_RE.captures(line) {
        return Ok(Reply::DataOk {
            id: parse_id(&caps[1])?,
            name: caps[2].to_owned(),
        });
    }

    if let Some(caps) = EVENT_RE.captures(line) {
        let number = caps[4]
            .parse()
            .map_err(|_| Error::Protocol(format!("bad event number in '{line}'")))?;
        return Ok(Reply::Event {
            id: parse_id(&caps[1])?,
            kind: caps[2].to_owned(),
            name: caps[3].to_owned(),
            number,
            description: caps
                .get(5)
                .map(|m| m.as_str().trim().to_owned())
                .filter(|s| !s.is_empty()),
        });
    }

    if let Some(caps) = AUTH_RE.captures(line) {
        return Ok(Reply::Auth {
            ok: &caps[1] == "OK",
            read_level: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            write_level: caps.get(3).and_then(|m| m.as_str().parse().ok()),
        });
    }

    if line.starts_with("TPL") {
        return Ok(Reply::Welcome {
            banner: line.to_owned(),
        });
    }

    if line.split_whitespace().next() == Some("DISCONNECT") {
        return Ok(Reply::Disconnect);
    }

    Err(Error::Protocol(format!("unrecognized line '{line}'")))
}

fn parse_id(raw: &str) -> Result<CommandId, Error> {
    raw.parse()
        .map(CommandId::new)
        .map_err(|_| Error::Protocol(format!("command id out of range: {raw}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(n: u64) -> CommandId {
        CommandId::new(n)
    }

    #[test]
    fn parses_command_states() {
        assert_eq!(
            parse("3 COMMAND OK").unwrap(),
            Reply::Command {
                id: id(3),
                status: CommandStatus::Ok
            }
        );
        assert_eq!(
            parse("3 COMMAND COMPLETE").unwrap(),
            Reply::Command {
                id: id(3),
                status: CommandStatus::Complete
            }
        );
        assert_eq!(
            parse("4 COMMAND FAILED \"no such variable\"").unwrap(),
            Reply::Command {
                id: id(4),
                status: CommandStatus::Failed {
                    message: Some("no such variable".into())
                }
            }
        );
        assert_eq!(
            parse("5 COMMAND ERROR UNKNOWN").unwrap(),
            Reply::Command {
                id: id(5),
                status: CommandStatus::Error {
                    detail: "UNKNOWN".into()
                }
            }
        );
    }

    #[test]
    fn tolerates_extra_whitespace() {
        assert_eq!(
            parse("  7   DATA   INLINE   DIMM.SEEING =  0.64 \r").unwrap(),
            Reply::DataInline {
                id: id(7),
                name: "DIMM.SEEING".into(),
                value: DataValue::Value("0.64".into()),
            }
        );
        assert_eq!(
            parse("7\tCOMMAND\tCOMPLETE").unwrap(),
            Reply::Command {
                id: id(7),
                status: CommandStatus::Complete
            }
        );
    }

    #[test]
    fn data_lines() {
        assert_eq!(
            parse("8 DATA OK AMEBA.MODE").unwrap(),
            Reply::DataOk {
                id: id(8),
                name: "AMEBA.MODE".into()
            }
        );
        assert_eq!(
            parse("8 DATA ERROR WEATHER.FOO FAILED 15 \"not settable\"").unwrap(),
            Reply::DataError {
                id: id(8),
                name: "WEATHER.FOO".into(),
                reason: "FAILED 15 \"not settable\"".into(),
            }
        );
        assert_eq!(
            parse("9 DATA INLINE SCOPE.RA=NULL").unwrap(),
            Reply::DataInline {
                id: id(9),
                name: "SCOPE.RA".into(),
                value: DataValue::Unknown,
            }
        );
    }

    #[test]
    fn events_are_unsolicited() {
        let reply = parse("0 EVENT INFO DIMM.SEEING:1 0.71").unwrap();
        assert_eq!(
            reply,
            Reply::Event {
                id: id(0),
                kind: "INFO".into(),
                name: "DIMM.SEEING".into(),
                number: 1,
                description: Some("0.71".into()),
            }
        );
        assert!(!reply.is_correlated());

        let reply = parse("12 EVENT ERROR SCOPE:3").unwrap();
        assert!(!reply.is_correlated());

        // Some firmware puts a colon between the number and the payload.
        let reply = parse("0 EVENT INFO DIMM.TIMESTAMP:1: 1718000000.5").unwrap();
        assert!(matches!(
            reply,
            Reply::Event { number: 1, description: Some(ref d), .. } if d == "1718000000.5"
        ));
    }

    #[test]
    fn id_zero_is_not_correlated() {
        assert!(!parse("0 COMMAND COMPLETE").unwrap().is_correlated());
        assert!(parse("1 COMMAND COMPLETE").unwrap().is_correlated());
    }

    #[test]
    fn handshake_lines() {
        assert_eq!(
            parse("TPL2 2.0 CONN 1 AUTH PLAIN ENC").unwrap(),
            Reply::Welcome {
                banner: "TPL2 2.0 CONN 1 AUTH PLAIN ENC".into()
            }
        );
        assert_eq!(
            parse("AUTH OK 2 3").unwrap(),
            Reply::Auth {
                ok: true,
                read_level: Some(2),
                write_level: Some(3)
            }
        );
        assert_eq!(
            parse("AUTH FAILED").unwrap(),
            Reply::Auth {
                ok: false,
                read_level: None,
                write_level: None
            }
        );
        assert_eq!(parse("DISCONNECT OK").unwrap(), Reply::Disconnect);
    }

    #[test]
    fn malformed_lines_are_protocol_errors() {
        for line in [
            "",
            "garbage",
            "x COMMAND OK",
            "3 COMMAND WHATEVER",
            "3 DATA INLINE",
            "99999999999999999999999 COMMAND OK",
            "\u{fffd}\u{fffd}\u{fffd}",
        ] {
            assert!(
                matches!(parse(line), Err(Error::Protocol(_))),
                "expected protocol error for {line:?}"
            );
        }
    }
}
