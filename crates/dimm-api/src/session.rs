//! Persistent OpenTPL session over TCP.
//!
//! A [`Session`] owns one connection to a device: it performs the
//! welcome/`AUTH` handshake, serializes outbound command lines through a
//! single writer, and runs a background read loop that routes every inbound
//! line to the [`CommandTable`] (correlated replies) or to a broadcast
//! channel (unsolicited events).
//!
//! Connection loss fails every pending command with
//! [`Error::ConnectionLost`] and flips the link state to [`LinkState::Lost`].
//! The session never reconnects on its own; callers build a new one.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite, LinesCodec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::command::{CommandReply, Completion, DataValue, Verb};
use crate::error::Error;
use crate::reply::{self, CommandStatus, Reply};
use crate::table::{CommandTable, DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_PENDING};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Inbound frames stay raw bytes so a line that is not UTF-8 can be dropped
/// on its own instead of failing the stream.
type LineReader = FramedRead<OwnedReadHalf, AnyDelimiterCodec>;
type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

// ── SessionConfig ────────────────────────────────────────────────────

/// Connection parameters for an OpenTPL device.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Device authenticates the connection itself; skip `AUTH PLAIN` and
    /// proceed straight after the welcome banner.
    pub auto_auth: bool,
    pub user: String,
    pub password: SecretString,
    pub connect_timeout: Duration,
    /// Bound on each handshake read.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub command_timeout: Duration,
    pub max_pending: usize,
    pub max_line_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 65432,
            auto_auth: false,
            user: "admin".into(),
            password: SecretString::from("admin"),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
            max_line_length: 8 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Link state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Open,
    /// The peer went away or the socket failed.
    Lost,
    /// [`Session::close`] was called.
    Closed,
}

/// Read/write levels granted by `AUTH OK <read> <write>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessLevels {
    pub read: u8,
    pub write: u8,
}

// ── Session ──────────────────────────────────────────────────────────

/// Handle to a connected device. Cheaply cloneable.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    peer: String,
    access: AccessLevels,
    table: Arc<CommandTable>,
    writer: Mutex<Option<LineWriter>>,
    write_timeout: Duration,
    link: Arc<watch::Sender<LinkState>>,
    events: broadcast::Sender<Reply>,
    cancel: CancellationToken,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Session {
    /// Connect, authenticate, and start the read loop.
    pub async fn connect(config: &SessionConfig) -> Result<Self, Error> {
        let addr = config.addr();
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::Connect {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(Error::Connect {
                    addr,
                    reason: format!("timed out after {:?}", config.connect_timeout),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle");
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(
            read_half,
            AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                config.max_line_length,
            ),
        );
        let mut writer = FramedWrite::new(
            write_half,
            LinesCodec::new_with_max_length(config.max_line_length),
        );

        let access = handshake(&mut reader, &mut writer, config).await?;
        info!(peer = %addr, read = access.read, write = access.write, "session established");

        let table = Arc::new(CommandTable::new(config.command_timeout, config.max_pending));
        let (link, _) = watch::channel(LinkState::Open);
        let link = Arc::new(link);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(read_loop(
            reader,
            Arc::clone(&table),
            Arc::clone(&link),
            events.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            inner: Arc::new(SessionInner {
                peer: addr,
                access,
                table,
                writer: Mutex::new(Some(writer)),
                write_timeout: config.write_timeout,
                link,
                events,
                cancel,
                reader: parking_lot::Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn access_levels(&self) -> AccessLevels {
        self.inner.access
    }

    pub fn table(&self) -> &Arc<CommandTable> {
        &self.inner.table
    }

    pub fn link_state(&self) -> LinkState {
        *self.inner.link.borrow()
    }

    pub fn subscribe_link(&self) -> watch::Receiver<LinkState> {
        self.inner.link.subscribe()
    }

    /// Unsolicited lines (`EVENT`, id `0`) pushed by the device.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Reply> {
        self.inner.events.subscribe()
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Register a command and write it to the device.
    ///
    /// Returns as soon as the line is written; await the returned
    /// [`Completion`] for the outcome.
    pub async fn issue(&self, verb: Verb, arg: &str) -> Result<Completion, Error> {
        if self.link_state() != LinkState::Open {
            return Err(Error::NotConnected);
        }
        let table = &self.inner.table;
        let (id, line, completion) = table.create(verb, arg)?;

        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            table.forget(id);
            return Err(Error::NotConnected);
        };

        trace!(%id, line = %line, "->");
        match tokio::time::timeout(self.inner.write_timeout, writer.send(line)).await {
            Ok(Ok(())) => Ok(completion),
            Ok(Err(e)) => {
                table.forget(id);
                Err(e.into())
            }
            Err(_) => {
                table.forget(id);
                Err(Error::Timeout {
                    id,
                    elapsed: self.inner.write_timeout,
                })
            }
        }
    }

    /// Issue a command and wait up to the command timeout for its outcome.
    pub async fn execute(&self, verb: Verb, arg: &str) -> Result<CommandReply, Error> {
        let completion = self.issue(verb, arg).await?;
        let id = completion.id();
        let result = completion.wait(self.inner.table.command_timeout()).await;
        if matches!(result, Err(Error::Timeout { .. })) {
            self.inner.table.forget(id);
        }
        result
    }

    /// `GET` several variables in one command.
    pub async fn get(&self, names: &[&str]) -> Result<CommandReply, Error> {
        self.execute(Verb::Get, &names.join(";")).await
    }

    /// `SET` several variables in one command.
    pub async fn set(&self, assignments: &[(&str, String)]) -> Result<CommandReply, Error> {
        let arg = assignments
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(";");
        self.execute(Verb::Set, &arg).await
    }

    /// Fail commands that outlived the command timeout.
    pub fn sweep(&self) -> usize {
        self.inner.table.sweep(Instant::now())
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop the read loop, say `DISCONNECT`, and fail everything pending.
    ///
    /// Safe to call repeatedly and concurrently; only the first call touches
    /// the socket and returns `true`.
    pub async fn close(&self) -> bool {
        self.inner.cancel.cancel();

        let writer = self.inner.writer.lock().await.take();
        let closed_here = writer.is_some();
        if let Some(mut writer) = writer {
            let wt = self.inner.write_timeout;
            if let Ok(Err(e)) = tokio::time::timeout(wt, writer.send("DISCONNECT")).await {
                debug!(error = %e, "DISCONNECT not delivered");
            }
            let _ = tokio::time::timeout(wt, SinkExt::<String>::close(&mut writer)).await;
        }

        let reader = self.inner.reader.lock().take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }

        let failed = self.inner.table.fail_all("session closed");
        self.inner.link.send_replace(LinkState::Closed);
        if closed_here {
            info!(peer = %self.inner.peer, failed, "session closed");
        }
        closed_here
    }
}

// ── Handshake ────────────────────────────────────────────────────────

async fn handshake(
    reader: &mut LineReader,
    writer: &mut LineWriter,
    config: &SessionConfig,
) -> Result<AccessLevels, Error> {
    match read_reply(reader, config.read_timeout).await? {
        Reply::Welcome { banner } => debug!(%banner, "device welcome"),
        other => {
            return Err(Error::Protocol(format!(
                "expected welcome banner, got {other:?}"
            )));
        }
    }

    if config.auto_auth {
        return Ok(AccessLevels::default());
    }

    let line = format!(
        "AUTH PLAIN \"{}\" \"{}\"",
        config.user,
        config.password.expose_secret()
    );
    match tokio::time::timeout(config.write_timeout, writer.send(line)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Authentication {
                message: "timed out sending credentials".into(),
            });
        }
    }

    match read_reply(reader, config.read_timeout).await {
        Ok(Reply::Auth {
            ok: true,
            read_level,
            write_level,
        }) => Ok(AccessLevels {
            read: read_level.unwrap_or_default(),
            write: write_level.unwrap_or_default(),
        }),
        Ok(Reply::Auth { ok: false, .. }) => Err(Error::Authentication {
            message: format!("device refused credentials for user '{}'", config.user),
        }),
        Ok(other) => Err(Error::Authentication {
            message: format!("unexpected reply {other:?}"),
        }),
        Err(e) => Err(Error::Authentication {
            message: e.to_string(),
        }),
    }
}

/// Read the next parsable line, skipping noise, within `timeout`.
async fn read_reply(reader: &mut LineReader, timeout: Duration) -> Result<Reply, Error> {
    let read = async {
        loop {
            match reader.next().await {
                Some(Ok(frame)) => match decode_line(&frame).map(reply::parse) {
                    Some(Ok(Reply::Event { .. })) | None => {}
                    Some(Ok(reply)) => return Ok(reply),
                    Some(Err(e)) => warn!(error = %e, "ignoring line during handshake"),
                },
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    warn!("ignoring over-long line during handshake");
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => return Err(Error::Io(e)),
                None => return Err(Error::lost("device closed the connection during handshake")),
            }
        }
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| Error::Protocol(format!("no handshake reply within {timeout:?}")))?
}

// ── Read loop ────────────────────────────────────────────────────────

async fn read_loop(
    mut reader: LineReader,
    table: Arc<CommandTable>,
    link: Arc<watch::Sender<LinkState>>,
    events: broadcast::Sender<Reply>,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = reader.next() => match next {
                Some(Ok(frame)) => {
                    if let Some(line) = decode_line(&frame) {
                        dispatch(&table, &events, line);
                    }
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    warn!("discarding over-long line");
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => break e.to_string(),
                None => break "device closed the connection".to_owned(),
            },
        }
    };

    let failed = table.fail_all(&reason);
    link.send_if_modified(|state| {
        if *state == LinkState::Open {
            *state = LinkState::Lost;
            true
        } else {
            false
        }
    });
    warn!(%reason, failed, "connection lost");
}

/// Text of one inbound frame; frames that are not UTF-8 are logged and
/// dropped.
fn decode_line(frame: &[u8]) -> Option<&str> {
    match std::str::from_utf8(frame) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!(error = %e, line = %String::from_utf8_lossy(frame), "discarding line that is not UTF-8");
            None
        }
    }
}

/// Route one inbound line. Malformed lines are logged and dropped.
fn dispatch(table: &CommandTable, events: &broadcast::Sender<Reply>, line: &str) {
    trace!(line, "<-");
    let reply = match reply::parse(line) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "discarding malformed line");
            return;
        }
    };

    if !reply.is_correlated() {
        match reply {
            Reply::Welcome { .. } | Reply::Auth { .. } | Reply::Disconnect => {
                debug!(line, "ignoring handshake line on open session");
            }
            other => {
                let _ = events.send(other);
            }
        }
        return;
    }

    match reply {
        Reply::Command { id, status } => match status {
            CommandStatus::Ok => {
                table.update(id, |c| {
                    c.record_line(line);
                    c.acknowledge();
                });
            }
            CommandStatus::Complete => {
                if table.update(id, |c| c.record_line(line)) {
                    table.resolve(id, Ok(()));
                }
            }
            CommandStatus::Error { detail } => {
                table.update(id, |c| {
                    c.record_line(line);
                    c.note_device_error(format!("ERROR {detail}"));
                });
            }
            CommandStatus::AbortedBy { detail } => {
                table.update(id, |c| {
                    c.record_line(line);
                    c.note_device_error(format!("ABORTEDBY {detail}"));
                });
            }
            CommandStatus::Failed { message } => {
                let mut prior = None;
                let known = table.update(id, |c| {
                    c.record_line(line);
                    prior = c.device_error().map(str::to_owned);
                });
                if known {
                    let reason = match (prior, message) {
                        (Some(p), Some(m)) => format!("{p}: {m}"),
                        (Some(p), None) => p,
                        (None, Some(m)) => m,
                        (None, None) => "FAILED".to_owned(),
                    };
                    table.resolve(id, Err(Error::Rejected { id, reason }));
                }
            }
        },
        Reply::DataInline { id, name, value } => {
            table.update(id, |c| {
                c.record_line(line);
                c.record_data(name, value);
            });
        }
        Reply::DataOk { id, name } => {
            table.update(id, |c| {
                c.record_line(line);
                c.record_ack(name);
            });
        }
        Reply::DataError { id, name, reason } => {
            table.update(id, |c| {
                c.record_line(line);
                c.record_data(name, DataValue::Error(reason));
            });
        }
        Reply::Event { .. } | Reply::Welcome { .. } | Reply::Auth { .. } | Reply::Disconnect => {}
    }
}
