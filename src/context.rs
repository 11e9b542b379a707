//! Process-wide runtime state that used to be a handful of C globals
//! (`verbose`, `background`, `pidfile`, `configfile`,
//! `program_subname`, `use_syslog`). Bundled into one struct so each
//! forked role (supervisor / intermediate child / container init) gets
//! its own copy instead of sharing mutable statics across `fork()`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct RuntimeContext {
    pub verbose: u8,
    pub background: bool,
    pub use_syslog: AtomicBool,
    pub pidfile_path: PathBuf,
    pub configfile: PathBuf,
}

impl RuntimeContext {
    pub fn new(configfile: PathBuf) -> Self {
        RuntimeContext {
            verbose: 0,
            background: false,
            use_syslog: AtomicBool::new(false),
            pidfile_path: PathBuf::new(),
            configfile,
        }
    }

    pub fn set_syslog(&self, on: bool) {
        self.use_syslog.store(on, Ordering::Relaxed);
    }

    pub fn use_syslog(&self) -> bool {
        self.use_syslog.load(Ordering::Relaxed)
    }
}

/// Label attached to log lines once per process, immediately after
/// each `fork()`, so a shared log stream (or syslog) can tell which of
/// the three roles in the double-fork handshake produced a given line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Intermediate,
    Init,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Supervisor => "supervisor",
            Role::Intermediate => "intermediate",
            Role::Init => "init",
        }
    }
}

std::thread_local! {
    static ROLE: std::cell::Cell<Role> = std::cell::Cell::new(Role::Supervisor);
}

pub fn set_role(role: Role) {
    ROLE.with(|r| r.set(role));
}

pub fn current_role() -> Role {
    ROLE.with(|r| r.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_role_is_supervisor() {
        assert_eq!(current_role(), Role::Supervisor);
    }

    #[test]
    fn role_changes_are_visible_on_this_thread() {
        set_role(Role::Init);
        assert_eq!(current_role(), Role::Init);
        set_role(Role::Supervisor);
    }
}
