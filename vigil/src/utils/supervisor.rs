//! Child-process supervision for command-running front-ends.

use std::process::{Child, Command};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::{Error, Result};

const EXIT_POLL: Duration = Duration::from_millis(50);
const TERM_GRACE: Duration = Duration::from_secs(2);

struct State {
    child: Option<Child>,
    running: bool,
    restart_requested: bool,
    restarts: usize,
}

struct Inner {
    program: String,
    args: Vec<String>,
    auto_restart: bool,
    state: Mutex<State>,
    cond: Condvar,
}

/// Runs a child command and keeps it alive.
///
/// A monitor thread watches for the child's exit. With `auto_restart`, an
/// exited child is respawned; otherwise the supervisor just records the
/// exit and waits. [`restart`](ProcessSupervisor::restart) bounces the
/// child on demand — the piece an auto-restart front-end calls from its
/// event handler.
///
/// On unix the child is asked to leave with `SIGTERM` and killed only
/// after a grace period; elsewhere it is killed directly.
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Spawns the command and the monitor thread.
    pub fn spawn(program: &str, args: &[&str], auto_restart: bool) -> Result<Self> {
        let child = Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| Error::io(e).add_path(program.into()))?;

        let inner = Arc::new(Inner {
            program: program.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            auto_restart,
            state: Mutex::new(State {
                child: Some(child),
                running: true,
                restart_requested: false,
                restarts: 0,
            }),
            cond: Condvar::new(),
        });

        let monitor = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("vigil process supervisor".to_string())
            .spawn(move || monitor_loop(&monitor))
            .map_err(Error::io)?;

        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// Asks the monitor thread to terminate and respawn the child.
    pub fn restart(&self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        state.restart_requested = true;
        self.inner.cond.notify_one();
    }

    /// How many times the child has been (re)spawned after the initial
    /// launch.
    pub fn restarts(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .restarts
    }

    /// Whether a child process is currently alive.
    pub fn is_alive(&self) -> bool {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match state.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Forwards a signal to the child.
    #[cfg(unix)]
    pub fn signal(&self, signum: i32) {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(child) = state.child.as_ref() {
            unsafe {
                libc::kill(child.id() as libc::pid_t, signum);
            }
        }
    }

    /// Terminates the child and joins the monitor thread.
    pub fn stop(mut self) {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            state.running = false;
            self.inner.cond.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            state.running = false;
            self.inner.cond.notify_one();
        }
    }
}

fn monitor_loop(inner: &Inner) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if !state.running {
            if let Some(child) = state.child.take() {
                terminate(child);
            }
            return;
        }

        let mut respawn_now = false;
        if state.restart_requested {
            state.restart_requested = false;
            respawn_now = true;
            if let Some(child) = state.child.take() {
                terminate(child);
            }
        }

        match state.child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => {
                log::debug!(
                    "supervised process `{}` exited with {status}",
                    inner.program
                );
                state.child = None;
            }
            Some(Ok(None)) => {}
            Some(Err(err)) => {
                log::error!("failed to poll supervised process: {err}");
                state.child = None;
            }
            None => {}
        }

        if state.child.is_none() && (inner.auto_restart || respawn_now) {
            match Command::new(&inner.program).args(&inner.args).spawn() {
                Ok(child) => {
                    state.child = Some(child);
                    state.restarts += 1;
                }
                Err(err) => {
                    log::error!("failed to respawn `{}`: {err}", inner.program);
                }
            }
        }

        let (guard, _) = inner
            .cond
            .wait_timeout(state, EXIT_POLL)
            .unwrap_or_else(|e| e.into_inner());
        state = guard;
    }
}

#[cfg(unix)]
fn terminate(mut child: Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(EXIT_POLL),
            Err(_) => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn long_running_child_stays_alive_and_stops() {
        let supervisor = ProcessSupervisor::spawn("sleep", &["30"], false).expect("spawn");
        assert!(supervisor.is_alive());
        assert_eq!(supervisor.restarts(), 0);
        supervisor.stop();
    }

    #[test]
    fn exited_child_is_respawned() {
        let supervisor = ProcessSupervisor::spawn("true", &[], true).expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.restarts() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(supervisor.restarts() >= 1, "child was never respawned");
        supervisor.stop();
    }

    #[test]
    fn restart_bounces_a_running_child() {
        let supervisor = ProcessSupervisor::spawn("sleep", &["30"], false).expect("spawn");
        supervisor.restart();

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.restarts() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(supervisor.restarts(), 1);
        assert!(supervisor.is_alive());
        supervisor.stop();
    }
}
