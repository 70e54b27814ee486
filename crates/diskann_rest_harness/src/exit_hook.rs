//! Last-resort termination of launched servers.
//!
//! Every launched server registers its pid here until it is torn down. If the test binary exits
//! without tearing a fixture down (a fixture held in a static, `std::process::exit`, or Ctrl-C),
//! the handlers installed on first registration kill whatever is still registered.

use std::sync::{
    Mutex,
    Once,
};

use tracing::{
    debug,
    warn,
};

static REGISTERED: Mutex<Vec<u32>> = Mutex::new(Vec::new());
static INSTALL_HANDLERS: Once = Once::new();

/// Exit code used after killing servers on SIGINT, SIGTERM or SIGHUP, matching a shell's 128 + SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

pub fn register(pid: u32) {
    install_handlers();
    let mut registered = REGISTERED.lock().unwrap_or_else(|e| e.into_inner());
    if !registered.contains(&pid) {
        registered.push(pid);
    }
}

pub fn unregister(pid: u32) {
    REGISTERED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|registered| *registered != pid);
}

pub fn is_registered(pid: u32) -> bool {
    REGISTERED.lock().unwrap_or_else(|e| e.into_inner()).contains(&pid)
}

/// Kills and forgets every registered pid, returning how many were signalled.
pub fn kill_registered() -> usize {
    // A poisoned or contended lock at exit is not worth blocking on.
    let pids = match REGISTERED.try_lock() {
        Ok(mut registered) => std::mem::take(&mut *registered),
        Err(std::sync::TryLockError::Poisoned(poisoned)) => std::mem::take(&mut *poisoned.into_inner()),
        Err(std::sync::TryLockError::WouldBlock) => return 0,
    };
    kill_pids(&pids)
}

/// Sends SIGKILL to each pid. Pids that no longer exist are ignored.
pub fn kill_pids(pids: &[u32]) -> usize {
    pids.iter().filter(|pid| kill_pid(**pid)).count()
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> bool {
    use nix::sys::signal::{
        Signal,
        kill,
    };
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> bool {
    warn!(pid, "Killing servers at exit is only supported on unix");
    false
}

extern "C" fn kill_registered_at_exit() {
    kill_registered();
}

fn install_handlers() {
    INSTALL_HANDLERS.call_once(|| {
        // SAFETY: the handler is a plain `extern "C" fn` that neither unwinds nor calls `exit`.
        if unsafe { libc::atexit(kill_registered_at_exit) } != 0 {
            warn!("Failed to register the exit handler for launched servers");
        }

        #[allow(clippy::exit)]
        let result = ctrlc::set_handler(|| {
            let killed = kill_registered();
            debug!(killed, "Interrupted, killed launched servers");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        });
        if let Err(err) = result {
            warn!(%err, "Failed to set the interrupt handler for launched servers");
        }
    });
}
