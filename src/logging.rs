/// Really simple logger: stderr by default, switched to syslog once
/// the supervisor daemonizes (after which stderr no longer reaches
/// anyone).
use log::{self, LevelFilter, Log, SetLoggerError};
use std::ffi::CString;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use libc;

use super::context::current_role;

static USE_SYSLOG: AtomicBool = AtomicBool::new(false);

/// Switch subsequent log records to `syslog(3)`. The caller is
/// responsible for having already called `openlog()`.
pub fn enable_syslog() {
    USE_SYSLOG.store(true, Ordering::Relaxed);
}

struct Logger;

fn syslog_level(level: log::Level) -> libc::c_int {
    match level {
        log::Level::Error => libc::LOG_ERR,
        log::Level::Warn => libc::LOG_WARNING,
        log::Level::Info => libc::LOG_INFO,
        log::Level::Debug | log::Level::Trace => libc::LOG_DEBUG,
    }
}

impl Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true // log::set_max_level() is sufficient
    }

    fn log(&self, record: &log::Record) {
        let role = current_role().as_str();
        let line = format!("[{}] {}", role, record.args());

        if USE_SYSLOG.load(Ordering::Relaxed) {
            if let Ok(cline) = CString::new(line.as_str()) {
                unsafe {
                    libc::syslog(syslog_level(record.level()), b"%s\0".as_ptr() as *const _, cline.as_ptr());
                }
            }
            return;
        }

        let lvl = record.level().to_string();
        eprintln!("{lvl:<5} {line}");
    }

    fn flush(&self) {}
}

/// Map a `-v` repeat count (or `[global] verbose=`) onto a level: 0 is
/// the default `Warn`, each further step walks down to `Trace`.
fn level_for_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the logger. `RUST_LOG`, when set, always wins over the
/// computed `-v` level -- handy for getting trace output out of a
/// single run without touching the config file.
pub fn setup(verbose: u8) -> Result<(), SetLoggerError> {
    let lvl = std::env::var("RUST_LOG")
        .ok()
        .as_deref()
        .map(LevelFilter::from_str)
        .and_then(Result::ok)
        .unwrap_or_else(|| level_for_verbosity(verbose));

    log::set_max_level(lvl);
    log::set_logger(&Logger {})
}
