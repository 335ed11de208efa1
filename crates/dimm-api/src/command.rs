// ── Command objects ──
//
// One in-flight OpenTPL request: identifier, verb, argument, the data
// lines collected so far, and a one-shot completion that the caller
// waits on.

use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Error;

/// First word of a `DATA INLINE` value that marks a device-side failure.
const BAD_DATA_WORDS: &[&str] = &[
    "BUSY", "DENIED", "DIMENSION", "FAILED", "INVALID", "LOCKEDBY", "TYPE", "UNKNOWN",
];

// ── CommandId ────────────────────────────────────────────────────────

/// Session-scoped command identifier. `0` is reserved for unsolicited lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    pub const UNSOLICITED: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_unsolicited(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Verb ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Set,
}

// ── DataValue ────────────────────────────────────────────────────────

/// A single variable as reported by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Value(String),
    /// `NULL`, empty, or acknowledged without a value.
    Unknown,
    /// The device flagged the variable (`DATA ERROR`, `FAILED ...`, `LOCKEDBY ...`).
    Error(String),
}

impl DataValue {
    /// Classify the right-hand side of `DATA INLINE NAME=value`.
    pub fn from_wire(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "NULL" {
            return Self::Unknown;
        }
        let first = raw.split_whitespace().next().unwrap_or_default();
        if BAD_DATA_WORDS.contains(&first) {
            return Self::Error(raw.to_owned());
        }
        Self::Value(unquote(raw).to_owned())
    }
}

pub(crate) fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s)
}

// ── CommandReply ─────────────────────────────────────────────────────

/// Everything the device sent back for a completed command.
#[derive(Debug, Clone, Default)]
pub struct CommandReply {
    pub data: IndexMap<String, DataValue>,
    pub lines: Vec<String>,
}

impl CommandReply {
    /// Raw string value of `name`, or a data-quality error.
    pub fn value(&self, name: &str) -> Result<&str, Error> {
        match self.data.get(name) {
            Some(DataValue::Value(v)) => Ok(v),
            Some(DataValue::Unknown) => Err(bad_data(name, "value unknown")),
            Some(DataValue::Error(reason)) => Err(bad_data(name, reason)),
            None => Err(bad_data(name, "missing from reply")),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, Error> {
        let raw = self.value(name)?;
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(bad_data(name, &format!("not a finite number: {raw}"))),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, Error> {
        let raw = self.value(name)?;
        raw.parse::<i64>()
            .map_err(|_| bad_data(name, &format!("not an integer: {raw}")))
    }

    pub fn text(&self, name: &str) -> Result<String, Error> {
        self.value(name).map(str::to_owned)
    }
}

fn bad_data(name: &str, reason: &str) -> Error {
    Error::DataQuality {
        name: name.to_owned(),
        reason: reason.to_owned(),
    }
}

// ── Command ──────────────────────────────────────────────────────────

type Outcome = Result<CommandReply, Error>;

/// An issued request tracked until the device completes or fails it.
#[derive(Debug)]
pub struct Command {
    id: CommandId,
    verb: Verb,
    arg: String,
    issued_at: Instant,
    acknowledged: bool,
    device_error: Option<String>,
    reply: CommandReply,
    done: Option<oneshot::Sender<Outcome>>,
}

impl Command {
    /// Build a pending command and the handle its caller waits on.
    pub fn new(id: CommandId, verb: Verb, arg: impl Into<String>) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let command = Self {
            id,
            verb,
            arg: arg.into(),
            issued_at: Instant::now(),
            acknowledged: false,
            device_error: None,
            reply: CommandReply::default(),
            done: Some(tx),
        };
        (command, Completion { id, rx })
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn arg(&self) -> &str {
        &self.arg
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.issued_at)
    }

    /// Line to put on the wire, without terminator.
    pub fn wire_line(&self) -> String {
        format!("{} {} {}", self.id, self.verb, self.arg)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn is_done(&self) -> bool {
        self.done.is_none()
    }

    // ── Reply accumulation ───────────────────────────────────────────

    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }

    pub fn record_line(&mut self, line: &str) {
        self.reply.lines.push(line.to_owned());
    }

    pub fn record_data(&mut self, name: impl Into<String>, value: DataValue) {
        self.reply.data.insert(name.into(), value);
    }

    /// `DATA OK NAME`: keep any value already recorded for `name`.
    pub fn record_ack(&mut self, name: impl Into<String>) {
        self.reply
            .data
            .entry(name.into())
            .or_insert(DataValue::Unknown);
    }

    /// Remember a `COMMAND ERROR ...` so a later `FAILED` carries the reason.
    pub fn note_device_error(&mut self, message: impl Into<String>) {
        self.device_error = Some(message.into());
    }

    pub fn device_error(&self) -> Option<&str> {
        self.device_error.as_deref()
    }

    // ── Completion ───────────────────────────────────────────────────

    /// Signal success. Rejected if completion was already signalled.
    pub fn complete(&mut self) -> Result<(), Error> {
        let tx = self.take_sender()?;
        let reply = std::mem::take(&mut self.reply);
        let _ = tx.send(Ok(reply));
        Ok(())
    }

    /// Signal failure. Rejected if completion was already signalled.
    pub fn fail(&mut self, err: Error) -> Result<(), Error> {
        let tx = self.take_sender()?;
        let _ = tx.send(Err(err));
        Ok(())
    }

    fn take_sender(&mut self) -> Result<oneshot::Sender<Outcome>, Error> {
        self.done
            .take()
            .ok_or(Error::AlreadyCompleted { id: self.id })
    }
}

// ── Completion ───────────────────────────────────────────────────────

/// Caller-side handle for a pending command.
#[derive(Debug)]
pub struct Completion {
    id: CommandId,
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Suspend until the command completes, fails, or `timeout` elapses.
    pub async fn wait(self, timeout: Duration) -> Result<CommandReply, Error> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::lost("command dropped before completion")),
            Err(_) => Err(Error::Timeout {
                id: self.id,
                elapsed: timeout,
            }),
        }
    }
}
