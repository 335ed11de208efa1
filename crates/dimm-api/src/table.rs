// ── Command table ──
//
// Registry of in-flight commands keyed by identifier. All mutation goes
// through one mutex; completion senders are fired after removal so a
// command can never be resolved twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::command::{Command, CommandId, Completion, Verb};
use crate::error::Error;

/// Default bound on simultaneously pending commands.
pub const DEFAULT_MAX_PENDING: usize = 100;

/// Default per-command timeout enforced by [`CommandTable::sweep`].
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CommandTable {
    pending: Mutex<IndexMap<CommandId, Command>>,
    next_id: AtomicU64,
    command_timeout: Duration,
    max_pending: usize,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_PENDING)
    }
}

impl CommandTable {
    pub fn new(command_timeout: Duration, max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
            command_timeout,
            max_pending: max_pending.max(1),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Allocate the next identifier. Never returns the unsolicited id `0`.
    pub fn next_id(&self) -> CommandId {
        CommandId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Build and register a fresh command in one step.
    pub fn create(
        &self,
        verb: Verb,
        arg: impl Into<String>,
    ) -> Result<(CommandId, String, Completion), Error> {
        let (command, completion) = Command::new(self.next_id(), verb, arg);
        let line = command.wire_line();
        let id = self.register(command)?;
        Ok((id, line, completion))
    }

    /// Track a command until it is resolved, swept, or failed.
    pub fn register(&self, command: Command) -> Result<CommandId, Error> {
        let id = command.id();
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            return Err(Error::TooManyPending {
                limit: self.max_pending,
            });
        }
        if pending.contains_key(&id) {
            return Err(Error::DuplicateId { id });
        }
        pending.insert(id, command);
        Ok(id)
    }

    /// Mutate a pending command in place. Unknown ids are logged and ignored.
    pub fn update<F>(&self, id: CommandId, f: F) -> bool
    where
        F: FnOnce(&mut Command),
    {
        let mut pending = self.pending.lock();
        if let Some(command) = pending.get_mut(&id) {
            f(command);
            true
        } else {
            warn!(%id, "reply for unknown command id, discarding");
            false
        }
    }

    /// Remove a command and signal its outcome.
    ///
    /// Returns `false` (after logging) when no command with `id` is pending,
    /// which happens for late replies to swept or cancelled commands.
    pub fn resolve(&self, id: CommandId, outcome: Result<(), Error>) -> bool {
        let Some(mut command) = self.pending.lock().shift_remove(&id) else {
            warn!(%id, "completion for unknown command id, discarding");
            return false;
        };
        let signalled = match outcome {
            Ok(()) => command.complete(),
            Err(err) => command.fail(err),
        };
        if let Err(e) = signalled {
            warn!(error = %e, "command resolved twice");
        }
        true
    }

    /// Drop a command without notifying its waiter.
    pub fn forget(&self, id: CommandId) -> bool {
        self.pending.lock().shift_remove(&id).is_some()
    }

    /// Fail every command older than the command timeout. Returns the count.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Command> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CommandId> = pending
                .values()
                .filter(|c| c.age(now) >= self.command_timeout)
                .map(Command::id)
                .collect();
            ids.iter()
                .filter_map(|id| pending.shift_remove(id))
                .collect()
        };

        let count = expired.len();
        for mut command in expired {
            let id = command.id();
            let elapsed = command.age(now);
            warn!(%id, ?elapsed, arg = command.arg(), "command timed out");
            let _ = command.fail(Error::Timeout { id, elapsed });
        }
        count
    }

    /// Fail everything still pending with `ConnectionLost`. Returns the count.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<Command> = self.pending.lock().drain(..).map(|(_, c)| c).collect();
        let count = drained.len();
        for mut command in drained {
            let _ = command.fail(Error::lost(reason));
        }
        if count > 0 {
            debug!(count, reason, "failed all pending commands");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Pending identifiers in issue order.
    pub fn pending_ids(&self) -> Vec<CommandId> {
        self.pending.lock().keys().copied().collect()
    }
}
