use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_store::PresenceStore;
use parley_types::models::PresenceStatus;

/// How long without an activity signal before `online` decays to `idle`.
pub const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub idle_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { idle_after: DEFAULT_IDLE_AFTER }
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    /// Pointer movement, key press, scroll, touch.
    Activity,
    /// Tab/window became hidden.
    Hidden,
    /// Tab/window became visible again.
    Visible,
    /// Manual status selection (including `dnd`).
    Set(PresenceStatus),
}

/// Explicit presence state machine for the local session.
///
/// Automatic transitions cycle between `online` and `idle`; `offline` is
/// written once at teardown. `dnd` is a manual override: while it is set,
/// activity signals, visibility changes and the idle timer are all ignored,
/// and only another manual `set_status` leaves it.
///
/// Only the local user's presence row is ever written. Writes are
/// idempotent overwrites keyed by user id; a failed write is logged and the
/// machine keeps going.
pub struct PresenceTracker<S> {
    store: Arc<S>,
    user_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<PresenceStatus>,
    task: JoinHandle<()>,
}

impl<S> PresenceTracker<S>
where
    S: PresenceStore + Send + Sync + 'static,
{
    /// Write `online`, arm the idle timer, and start listening for signals.
    pub async fn start(store: Arc<S>, user_id: Uuid, config: PresenceConfig) -> Self {
        write_presence(store.as_ref(), user_id, PresenceStatus::Online).await;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PresenceStatus::Online);
        let task = tokio::spawn(run(store.clone(), user_id, config, command_rx, status_tx));

        Self { store, user_id, commands, status, task }
    }

    /// An activity signal: rearms the idle timer and resumes `online` when
    /// the machine is `idle`.
    pub fn activity(&self) {
        let _ = self.commands.send(Command::Activity);
    }

    /// The tab went hidden: `idle` immediately, without waiting for the timer.
    pub fn hidden(&self) {
        let _ = self.commands.send(Command::Hidden);
    }

    /// The tab became visible: back to `online`, timer rearmed.
    pub fn visible(&self) {
        let _ = self.commands.send(Command::Visible);
    }

    /// Manual status selection. `Set(Online)` resumes the automatic cycle
    /// after a `dnd` override.
    pub fn set_status(&self, status: PresenceStatus) {
        let _ = self.commands.send(Command::Set(status));
    }

    pub fn status(&self) -> PresenceStatus {
        *self.status.borrow()
    }

    /// Observe transitions as they are applied.
    pub fn watch(&self) -> watch::Receiver<PresenceStatus> {
        self.status.clone()
    }

    /// Session teardown: stop the machine and attempt one final `offline`
    /// write. Best-effort — the session may not outlive it by much.
    pub async fn shutdown(self) {
        self.task.abort();
        write_presence(self.store.as_ref(), self.user_id, PresenceStatus::Offline).await;
    }
}

async fn run<S: PresenceStore>(
    store: Arc<S>,
    user_id: Uuid,
    config: PresenceConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<PresenceStatus>,
) {
    let mut status = PresenceStatus::Online;
    let mut deadline = Instant::now() + config.idle_after;
    let mut timer_armed = true;

    let mut apply = |next: PresenceStatus, status: &mut PresenceStatus| -> bool {
        if *status == next {
            return false;
        }
        debug!(from = status.as_str(), to = next.as_str(), "presence transition");
        *status = next;
        status_tx.send_replace(next);
        true
    };

    loop {
        tokio::select! {
            _ = time::sleep_until(deadline), if timer_armed => {
                // Timer expired with no intervening activity.
                timer_armed = false;
                if apply(PresenceStatus::Idle, &mut status) {
                    write_presence(store.as_ref(), user_id, status).await;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { break };

                // A manual dnd suspends the automatic cycle entirely.
                if status == PresenceStatus::Dnd && !matches!(command, Command::Set(_)) {
                    continue;
                }

                match command {
                    Command::Activity | Command::Visible => {
                        deadline = Instant::now() + config.idle_after;
                        timer_armed = true;
                        if apply(PresenceStatus::Online, &mut status) {
                            write_presence(store.as_ref(), user_id, status).await;
                        }
                    }
                    Command::Hidden => {
                        timer_armed = false;
                        if apply(PresenceStatus::Idle, &mut status) {
                            write_presence(store.as_ref(), user_id, status).await;
                        }
                    }
                    Command::Set(next) => {
                        timer_armed = next == PresenceStatus::Online;
                        if timer_armed {
                            deadline = Instant::now() + config.idle_after;
                        }
                        if apply(next, &mut status) {
                            write_presence(store.as_ref(), user_id, status).await;
                        }
                    }
                }
            }
        }
    }
}

async fn write_presence<S: PresenceStore>(store: &S, user_id: Uuid, status: PresenceStatus) {
    if let Err(e) = store.set_presence(user_id, status, Utc::now()).await {
        warn!(status = status.as_str(), error = %e, "presence write failed");
    }
}
