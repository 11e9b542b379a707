//! isolate - run a command confined by Linux namespaces, cgroups, and
//! capabilities, supervised across a double `fork()` handshake.

pub mod err;
pub use err::{Error, Result};

mod sys;

pub mod capability;
pub mod namespace;
pub mod mapfile;

pub mod context;
pub mod spec;
pub mod config;

pub mod cgroup;
pub mod mount;
pub mod device;
pub mod fds;
pub mod seccomp;
pub mod handshake;

pub mod net;
mod user;
pub mod util;

pub mod pidfile;
pub mod init;
pub mod supervisor;

pub mod logging;
