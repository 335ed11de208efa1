//! TCP server that impersonates an Astelco DIMM.
//!
//! Serves one client at a time. Each client gets the OpenTPL welcome banner,
//! may authenticate with `AUTH PLAIN`, and can `GET`/`SET` variables of the
//! [`Registry`]. While `AMEBA.MODE` is automatic and the weather permits,
//! a background loop slews to random targets and publishes random
//! measurements.
//!
//! Several knobs exist to exercise client robustness: unsolicited status
//! events, randomly garbled lines, variables that are never acknowledged,
//! delayed replies, and forced disconnects.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use regex::Regex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{Registry, Value, code};

const MAX_LINE_LENGTH: usize = 8 * 1024;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 256;

static AUTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^auth\s+(\S+)\s+(.+)$").expect("invalid auth regex"));
static DISCONNECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^disconnect\b").expect("invalid disconnect regex"));
static GET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+)\s+get\s+(.+)$").expect("invalid get regex"));
static SET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+)\s+set\s+(.+)$").expect("invalid set regex"));
static CMDID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*(.*)$").expect("invalid command id regex"));

const GARBAGE: &[&str] = &[
    "#@!% line noise",
    "0 DATA INLINE",
    "x17 COMMAND COMPLETE",
    "99 COMMAND SIDEWAYS",
    "EVENT",
];

// ── MockConfig ───────────────────────────────────────────────────────

/// Behavior of a [`MockDimm`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Port to bind on 127.0.0.1. `0` picks a free port.
    pub port: u16,
    /// Client must `AUTH PLAIN` before issuing commands.
    pub require_auth: bool,
    /// Start with weather that permits automatic operation.
    pub open_weather: bool,
    pub slew_duration: Duration,
    pub measurement_duration: Duration,
    /// Mean and standard deviation of simulated seeing, arcsec.
    pub seeing_mean: f64,
    pub seeing_std: f64,
    /// Cadence of unsolicited `EVENT INFO` status lines.
    pub event_interval: Option<Duration>,
    /// Chance that an emitted event is replaced by a garbled line.
    pub malformed_probability: f64,
    /// Commands touching any of these variables are never answered.
    pub silent_variables: HashSet<String>,
    /// Delay applied to every command reply.
    pub reply_delay: Duration,
    pub seed: Option<u64>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            port: 0,
            require_auth: true,
            open_weather: false,
            slew_duration: Duration::from_secs(1),
            measurement_duration: Duration::from_secs(1),
            seeing_mean: 0.9,
            seeing_std: 0.3,
            event_interval: None,
            malformed_probability: 0.0,
            silent_variables: HashSet::new(),
            reply_delay: Duration::ZERO,
            seed: None,
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────────

/// Snapshot of what the simulator has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub connections: u64,
    pub commands: u64,
    pub gets: u64,
    pub sets: u64,
    pub disconnects: u64,
    pub unanswered: u64,
    pub measurements: u64,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    commands: AtomicU64,
    gets: AtomicU64,
    sets: AtomicU64,
    disconnects: AtomicU64,
    unanswered: AtomicU64,
    measurements: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ── Shared state ─────────────────────────────────────────────────────

struct MockState {
    config: MockConfig,
    registry: Mutex<Registry>,
    rng: Mutex<StdRng>,
    counters: Counters,
    events: broadcast::Sender<String>,
    measured: Notify,
    auto_loop: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    client_cancel: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

// ── MockDimm ─────────────────────────────────────────────────────────

/// Running simulator. Dropping it without [`shutdown`](Self::shutdown)
/// leaves the accept loop running until the runtime exits.
pub struct MockDimm {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockDimm {
    /// Bind and start accepting clients.
    pub async fn start(config: MockConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
        let addr = listener.local_addr()?;

        let mut registry = Registry::new();
        if config.open_weather {
            registry.open_weather();
        }
        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let state = Arc::new(MockState {
            config,
            registry: Mutex::new(registry),
            rng: Mutex::new(rng),
            counters: Counters::default(),
            events,
            measured: Notify::new(),
            auto_loop: Mutex::new(None),
            client_cancel: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        reconcile_auto_loop(&state);
        if let Some(every) = state.config.event_interval {
            tokio::spawn(status_event_loop(Arc::clone(&state), every));
        }
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        info!(%addr, "mock DIMM listening");

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stats(&self) -> MockStats {
        let c = &self.state.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MockStats {
            connections: load(&c.connections),
            commands: load(&c.commands),
            gets: load(&c.gets),
            sets: load(&c.sets),
            disconnects: load(&c.disconnects),
            unanswered: load(&c.unanswered),
            measurements: load(&c.measurements),
        }
    }

    /// Current value of a variable, formatted as it would appear on the wire.
    pub fn variable(&self, name: &str) -> Option<String> {
        self.state
            .registry
            .lock()
            .get(name)
            .ok()
            .map(ToString::to_string)
    }

    /// Write a variable directly, bypassing the read-only flag.
    pub fn put_variable(&self, name: &str, value: Value) {
        self.state.registry.lock().put(&name.to_ascii_uppercase(), value);
    }

    /// Apply a `SET` as a client would, then re-evaluate automatic mode.
    pub fn set_variable(&self, name: &str, raw: &str) -> Result<(), crate::VariableError> {
        self.state.registry.lock().set(name, raw)?;
        reconcile_auto_loop(&self.state);
        Ok(())
    }

    /// Resolves after the next simulated measurement.
    pub async fn next_measurement(&self) {
        self.state.measured.notified().await;
    }

    /// Drop the current client's socket without a `DISCONNECT` exchange.
    pub fn drop_client(&self) {
        if let Some(token) = self.state.client_cancel.lock().take() {
            token.cancel();
        }
    }

    /// Stop accepting, drop any client, and stop the automatic loop.
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        self.drop_client();
        let auto = self.state.auto_loop.lock().take();
        if let Some((token, handle)) = auto {
            token.cancel();
            let _ = handle.await;
        }
        let _ = self.accept_task.await;
    }
}

// ── Accept loop ──────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, state: Arc<MockState>) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                bump(&state.counters.connections);
                let token = state.shutdown.child_token();
                *state.client_cancel.lock() = Some(token.clone());
                debug!(%peer, "client connected");
                serve_client(&state, stream, token).await;
                debug!(%peer, "client gone");
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

// ── Client session ───────────────────────────────────────────────────

enum Action {
    Reply(Vec<String>),
    /// Reply, then close the connection.
    Goodbye(Vec<String>),
    Silent,
}

struct ClientCtx {
    authenticated: bool,
}

async fn serve_client(state: &Arc<MockState>, stream: TcpStream, cancel: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_loop(
        FramedWrite::new(write_half, LinesCodec::new()),
        out_rx,
        cancel.clone(),
    ));

    let banner = if state.config.require_auth {
        "TPL2 2.0 CONN 1 AUTH PLAIN ENC"
    } else {
        "TPL2 2.0 CONN 1 AUTH ENC"
    };
    let _ = out_tx.send(banner.to_owned()).await;

    let mut ctx = ClientCtx {
        authenticated: !state.config.require_auth,
    };
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv(), if ctx.authenticated => {
                if let Ok(line) = event {
                    let _ = out_tx.send(line).await;
                }
            }
            next = reader.next() => {
                let line = match next {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(error = %e, "read failed");
                        break;
                    }
                    None => break,
                };
                match handle_line(state, &mut ctx, line.trim()) {
                    Action::Reply(lines) => send_replies(state, &out_tx, lines).await,
                    Action::Goodbye(lines) => {
                        for line in lines {
                            let _ = out_tx.send(line).await;
                        }
                        break;
                    }
                    Action::Silent => {}
                }
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    state.client_cancel.lock().take();
}

async fn send_replies(state: &MockState, out_tx: &mpsc::Sender<String>, lines: Vec<String>) {
    let delay = state.config.reply_delay;
    if delay.is_zero() {
        for line in lines {
            let _ = out_tx.send(line).await;
        }
        return;
    }
    let tx = out_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        for line in lines {
            let _ = tx.send(line).await;
        }
    });
}

async fn write_loop(
    mut writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, LinesCodec>,
    mut out_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = out_rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        debug!(line = %line, "mock ->");
        if let Err(e) = writer.send(line).await {
            debug!(error = %e, "write failed");
            break;
        }
    }
    let _ = SinkExt::<String>::close(&mut writer).await;
}

// ── Command handling ─────────────────────────────────────────────────

fn handle_line(state: &Arc<MockState>, ctx: &mut ClientCtx, line: &str) -> Action {
    debug!(line, "mock <-");

    if let Some(caps) = AUTH_RE.captures(line) {
        if caps[1].eq_ignore_ascii_case("plain") {
            ctx.authenticated = true;
            return Action::Reply(vec!["AUTH OK 20 20".into()]);
        }
        return Action::Reply(vec!["AUTH UNSUPPORTED".into()]);
    }

    if DISCONNECT_RE.is_match(line) {
        bump(&state.counters.disconnects);
        return Action::Goodbye(vec!["DISCONNECT OK".into()]);
    }

    let (id, body) = CMDID_RE
        .captures(line)
        .map_or(("0".to_owned(), line.to_owned()), |c| {
            (c[1].to_owned(), c[2].to_owned())
        });
    bump(&state.counters.commands);

    let (verb_is_get, arg) = if let Some(c) = GET_RE.captures(line) {
        (true, c[2].to_owned())
    } else if let Some(c) = SET_RE.captures(line) {
        (false, c[2].to_owned())
    } else {
        return Action::Reply(vec![
            command_state(&id, "ERROR UNKNOWN", &body),
            command_state(&id, "FAILED", "Unknown command"),
        ]);
    };

    if !ctx.authenticated {
        return Action::Reply(vec![
            command_state(&id, "ERROR UNAUTHENTICATED", ""),
            command_state(&id, "FAILED", ""),
        ]);
    }

    if touches_silent(&state.config.silent_variables, &arg) {
        bump(&state.counters.unanswered);
        debug!(%id, %arg, "leaving command unanswered");
        return Action::Silent;
    }

    if verb_is_get {
        bump(&state.counters.gets);
        Action::Reply(do_get(state, &id, &arg))
    } else {
        bump(&state.counters.sets);
        let lines = do_set(state, &id, &arg);
        reconcile_auto_loop(state);
        Action::Reply(lines)
    }
}

fn touches_silent(silent: &HashSet<String>, arg: &str) -> bool {
    !silent.is_empty()
        && arg.split(';').any(|item| {
            let name = item.split(['=', '!']).next().unwrap_or_default();
            silent.contains(&name.trim().to_ascii_uppercase())
        })
}

fn do_get(state: &MockState, id: &str, arg: &str) -> Vec<String> {
    let registry = state.registry.lock();
    let mut lines = vec![command_state(id, "OK", "")];
    for item in arg.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, property) = item.split_once('!').unwrap_or((item, ""));
        let upper = name.to_ascii_uppercase();
        match (registry.get(name), property.to_ascii_lowercase().as_str()) {
            (Ok(value), "") => lines.push(format!("{id} DATA INLINE {upper}={value}")),
            (Ok(value), "type") => lines.push(format!(
                "{id} DATA INLINE {upper}!TYPE={}",
                value.type_code()
            )),
            (Ok(_), other) => {
                lines.push(data_error(id, &upper, &format!("unsupported property {other}")));
            }
            (Err(e), _) => lines.push(data_error(id, &upper, &e.to_string())),
        }
    }
    lines.push(command_state(id, "COMPLETE", ""));
    lines
}

fn do_set(state: &MockState, id: &str, arg: &str) -> Vec<String> {
    let mut registry = state.registry.lock();
    let mut lines = vec![command_state(id, "OK", "")];
    for item in arg.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, raw)) = item.split_once('=') else {
            lines.push(data_error(id, &item.to_ascii_uppercase(), "missing '='"));
            continue;
        };
        let upper = name.trim().to_ascii_uppercase();
        match registry.set(name, raw) {
            Ok(()) => lines.push(format!("{id} DATA OK {upper}")),
            Err(e) => lines.push(data_error(id, &upper, &e.to_string())),
        }
    }
    lines.push(command_state(id, "COMPLETE", ""));
    lines
}

fn command_state(id: &str, state: &str, message: &str) -> String {
    if message.is_empty() {
        format!("{id} COMMAND {state}")
    } else {
        format!("{id} COMMAND {state} \"{message}\"")
    }
}

fn data_error(id: &str, name: &str, message: &str) -> String {
    format!("{id} DATA ERROR {name} FAILED 15 \"{message}\"")
}

// ── Events ───────────────────────────────────────────────────────────

/// Broadcast an unsolicited line, occasionally garbled.
fn emit_event(state: &MockState, line: String) {
    let p = state.config.malformed_probability;
    let line = {
        let mut rng = state.rng.lock();
        if p > 0.0 && rng.gen_bool(p.min(1.0)) {
            GARBAGE[rng.gen_range(0..GARBAGE.len())].to_owned()
        } else {
            line
        }
    };
    let _ = state.events.send(line);
}

async fn status_event_loop(state: Arc<MockState>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = state.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let ameba_state = state.registry.lock().get("AMEBA.STATE").map(ToString::to_string);
                if let Ok(value) = ameba_state {
                    emit_event(&state, format!("0 EVENT INFO AMEBA.STATE:1: {value}"));
                }
            }
        }
    }
}

// ── Automatic operation ──────────────────────────────────────────────

fn reconcile_auto_loop(state: &Arc<MockState>) {
    let should_run = {
        let registry = state.registry.lock();
        registry.mode_is_auto() && registry.can_open()
    };
    let mut slot = state.auto_loop.lock();
    let running = slot.as_ref().is_some_and(|(_, h)| !h.is_finished());
    if should_run && !running {
        let token = state.shutdown.child_token();
        let handle = tokio::spawn(auto_loop(Arc::clone(state), token.clone()));
        *slot = Some((token, handle));
    } else if !should_run {
        if let Some((token, _)) = slot.take() {
            token.cancel();
        }
    }
}

async fn auto_loop(state: Arc<MockState>, cancel: CancellationToken) {
    info!("automatic loop begins");
    state.registry.lock().put("SCOPE.POWER_STATE", Value::Int(code::POWER_UP));

    let cfg = &state.config;
    loop {
        {
            let mut rng = state.rng.lock();
            let mut r = state.registry.lock();
            r.put("AMEBA.STATE", Value::Int(code::AMEBA_SLEWING));
            r.put("SCOPE.MOTION_STATE", Value::Int(code::SCOPE_SLEWING));
            r.put("SCOPE.RA", Value::Float(rng.gen_range(0.0..24.0)));
            r.put("SCOPE.DEC", Value::Float(rng.gen_range(-90.0..45.0)));
            r.put("SCOPE.AZ", Value::Float(rng.gen_range(-180.0..180.0)));
            r.put("SCOPE.ALT", Value::Float(rng.gen_range(5.0..85.0)));
        }
        if sleep_or_cancel(cfg.slew_duration, &cancel).await {
            break;
        }
        {
            let mut r = state.registry.lock();
            r.put("AMEBA.STATE", Value::Int(code::AMEBA_MONITORING));
            r.put("SCOPE.MOTION_STATE", Value::Int(code::SCOPE_TRACKING));
        }
        if sleep_or_cancel(cfg.measurement_duration, &cancel).await {
            break;
        }
        let timestamp = record_measurement(&state);
        bump(&state.counters.measurements);
        state.measured.notify_waiters();
        emit_event(&state, format!("0 EVENT INFO DIMM.TIMESTAMP:1: {timestamp}"));
    }

    let mut r = state.registry.lock();
    r.put("AMEBA.STATE", Value::Int(code::AMEBA_INACTIVE));
    r.put("SCOPE.MOTION_STATE", Value::Int(code::SCOPE_PARKED));
    r.put("SCOPE.POWER_STATE", Value::Int(code::POWER_PARKED));
    for field in ["SCOPE.RA", "SCOPE.DEC", "SCOPE.AZ", "SCOPE.ALT"] {
        r.put(field, Value::Float(0.0));
    }
    info!("automatic loop ends");
}

/// Returns `true` if cancelled before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

fn record_measurement(state: &MockState) -> f64 {
    let cfg = &state.config;
    let mut rng = state.rng.lock();
    let mut r = state.registry.lock();

    let seeing = Normal::new(cfg.seeing_mean, cfg.seeing_std)
        .map(|dist| {
            std::iter::repeat_with(|| dist.sample(&mut *rng))
                .take(100)
                .find(|s| *s > 0.0)
                .unwrap_or(cfg.seeing_mean.abs())
        })
        .unwrap_or(cfg.seeing_mean.abs());
    let alt = r
        .get("SCOPE.ALT")
        .ok()
        .and_then(Value::as_f64)
        .unwrap_or(45.0);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64());

    r.put("DIMM.SEEING", Value::Float(seeing));
    r.put("DIMM.SEEING_LOWFREQ", Value::Float(seeing * 0.9));
    for field in ["FLUX_LEFT", "FLUX_RIGHT", "FLUX_RMS_LEFT", "FLUX_RMS_RIGHT"] {
        r.put(&format!("DIMM.{field}"), Value::Float(rng.gen_range(10_000.0..20_000.0)));
    }
    for field in ["STREHL_LEFT", "STREHL_RIGHT"] {
        r.put(&format!("DIMM.{field}"), Value::Float(rng.gen_range(0.1..0.9)));
    }
    r.put("DIMM.AIRMASS", Value::Float(1.0 / alt.to_radians().cos()));
    r.put("DIMM.TIMESTAMP", Value::Float(timestamp));
    timestamp
}
