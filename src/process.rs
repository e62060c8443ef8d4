//! `ProcessWatcher`: a one-shot child-exit notifier. It carries no fd of its own — it
//! rides a handleless `Notifier` purely so it still participates in the parent/child tree like
//! any other notifier — but its wakeup comes from the `Loop`'s child-watch table, driven by
//! `waitpid`, rather than from fd readiness.

use std::cell::RefCell;
use std::rc::Rc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{Error, ExitStatus, Result};
use crate::notifier::Notifier;
use crate::reactor::Loop;

struct WatcherState {
    fired: bool,
}

/// A one-shot watch on a child process's exit.
pub struct ProcessWatcher<L: Loop + Clone + 'static> {
    notifier: Notifier,
    pid: Pid,
    lp: L,
    state: Rc<RefCell<WatcherState>>,
}

impl<L: Loop + Clone + 'static> ProcessWatcher<L> {
    /// Registers a watch for `pid`'s exit on `lp`. Fails if `pid` is zero.
    pub fn new(lp: L, pid: Pid, on_exit: impl FnMut(ExitStatus) + 'static) -> Result<ProcessWatcher<L>> {
        if pid.as_raw() == 0 {
            return Err(Error::configuration("ProcessWatcher requires a nonzero pid"));
        }

        let notifier = Notifier::new_handleless();
        lp.add(&notifier)?;

        let watcher = ProcessWatcher {
            notifier,
            pid,
            lp,
            state: Rc::new(RefCell::new(WatcherState { fired: false })),
        };
        watcher.install_watch(on_exit);
        Ok(watcher)
    }

    fn install_watch(&self, mut on_exit: impl FnMut(ExitStatus) + 'static) {
        let lp = self.lp.clone();
        let notifier = self.notifier.clone();
        let state = self.state.clone();
        let pid = self.pid;
        self.lp.watch_child(self.pid, move |status| {
            debug!(?pid, ?status, "process watcher fired");
            state.borrow_mut().fired = true;
            on_exit(status);
            lp.remove(&notifier);
        });
    }

    /// Replaces the exit callback. The watch is torn down and reinstalled so that the new
    /// callback, not the old one, is what actually fires.
    pub fn set_on_exit(&self, on_exit: impl FnMut(ExitStatus) + 'static) {
        self.lp.unwatch_child(self.pid);
        self.install_watch(on_exit);
    }

    /// Whether the watched process has already been reaped and `on_exit` invoked.
    pub fn fired(&self) -> bool {
        self.state.borrow().fired
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Sends `signal` to the watched process.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        kill(self.pid, signal)?;
        Ok(())
    }

    /// The underlying (handleless) notifier, for composing into a parent/child tree.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll_loop::PollLoop;
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::{fork, ForkResult};
    use std::time::Duration;

    #[test]
    fn rejects_zero_pid() {
        let lp = PollLoop::new().unwrap();
        let err = ProcessWatcher::new(lp, Pid::from_raw(0), |_| {});
        assert!(err.is_err());
    }

    #[test]
    fn fires_once_on_exit() {
        let lp = PollLoop::new().unwrap();
        // SAFETY: single-threaded test process, child immediately exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                std::process::exit(7);
            }
            ForkResult::Parent { child } => {
                let fired = Rc::new(RefCell::new(None));
                let f = fired.clone();
                let watcher = ProcessWatcher::new(lp.clone(), child, move |status| {
                    *f.borrow_mut() = Some(status);
                })
                .unwrap();

                let deadline = std::time::Instant::now() + Duration::from_secs(2);
                while fired.borrow().is_none() && std::time::Instant::now() < deadline {
                    lp.loop_once(Some(Duration::from_millis(50))).unwrap();
                }

                let status = fired.borrow().expect("child exit was observed");
                assert_eq!(status.exit_code(), Some(7));
                assert!(watcher.fired());
                let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
            }
        }
    }
}
