//! PID 1 child reaping.
//!
//! The helper is init of its PID namespace, so every orphaned process
//! re-parents to it. One reaper owns all `waitpid` calls; tasks that
//! need an exit status subscribe by PID before the status can arrive
//! (the unclaimed map covers the spawn/exit race).

use std::collections::HashMap;
use std::sync::Mutex;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
struct State {
    /// Subscribed PIDs awaiting an exit status.
    waiting: HashMap<i32, oneshot::Sender<i32>>,
    /// Statuses reaped before anyone subscribed.
    unclaimed: HashMap<i32, i32>,
}

static STATE: Mutex<Option<State>> = Mutex::new(None);

fn with_state<R>(f: impl FnOnce(&mut State) -> R) -> R {
    let mut guard = STATE.lock().expect("reaper state poisoned");
    f(guard.get_or_insert_with(State::default))
}

/// Subscribes to the exit status of `pid`.
///
/// The receiver resolves with the exit code, or `-1` for a
/// signal-killed child.
pub fn subscribe(pid: i32) -> oneshot::Receiver<i32> {
    let (tx, rx) = oneshot::channel();
    with_state(|state| {
        if let Some(code) = state.unclaimed.remove(&pid) {
            let _ = tx.send(code);
        } else {
            state.waiting.insert(pid, tx);
        }
    });
    rx
}

/// Reaps every currently-waitable child.
pub fn drain() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => resolve(pid.as_raw(), code),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                debug!(pid = pid.as_raw(), ?signal, "child killed by signal");
                resolve(pid.as_raw(), -1);
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            // ECHILD: nothing left to reap.
            Err(_) => break,
        }
    }
}

fn resolve(pid: i32, code: i32) {
    with_state(|state| {
        if let Some(tx) = state.waiting.remove(&pid) {
            let _ = tx.send(code);
        } else {
            debug!(pid, code, "reaped orphan");
            state.unclaimed.insert(pid, code);
        }
    });
}

/// Reaper task: drains on every SIGCHLD.
pub async fn task() {
    let mut sigchld = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!("cannot install SIGCHLD handler: {e}");
            return;
        }
    };
    // Children may have exited before the handler was installed.
    drain();
    while sigchld.recv().await.is_some() {
        drain();
    }
}
