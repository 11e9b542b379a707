use std::path::{Path, PathBuf};
use std::{error, fmt, io};

#[derive(Debug)]
pub enum Error {
    File {
        op: String,
        name: PathBuf,
        io: io::Error,
    },
    OS {
        op: String,
        io: io::Error,
    },
    TooLong,
    NotIPv4,
    BadStr,
    ParseError {
        msg: String,
        name: PathBuf,
    },
    /// A config/CLI value is malformed or a required section is absent.
    Config(String),
    /// A handshake message violated the protocol (wrong kind, short read,
    /// length mismatch).
    Protocol(String),
    /// A capability name is not recognized.
    UnknownCapability(String),
    /// A namespace token is not recognized.
    UnknownNamespace(String),
    /// The pidfile lock is already held by a running instance.
    AlreadyRunning,
    /// No instance holds the pidfile lock.
    NotRunning,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Annotate I/O error
    pub fn file<S: AsRef<str>, P: AsRef<Path>>(desc: S, path: P, err: io::Error) -> Self {
        Error::File {
            op: desc.as_ref().to_string(),
            name: path.as_ref().to_path_buf(),
            io: err,
        }
    }

    /// Annotate Error::last_os_error()
    pub fn last_file_error<S: AsRef<str>, P: AsRef<Path>>(desc: S, path: P) -> Self {
        Self::file(desc, path, io::Error::last_os_error())
    }

    pub fn os<S: AsRef<str>>(desc: S, err: io::Error) -> Self {
        Self::OS {
            op: desc.as_ref().to_string(),
            io: err,
        }
    }

    /// Annotate Error::last_os_error()
    pub fn last_os_error<S: AsRef<str>>(desc: S) -> Self {
        Self::os(desc, io::Error::last_os_error())
    }

    pub fn parse<M: AsRef<str>, P: AsRef<Path>>(msg: M, path: P) -> Self {
        Self::ParseError {
            msg: msg.as_ref().to_string(),
            name: path.as_ref().to_path_buf(),
        }
    }

    /// True when this error wraps an `io::Error` of the given kind.
    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        match self {
            Self::File { io, .. } => io.kind() == kind,
            Self::OS { io, .. } => io.kind() == kind,
            _ => false,
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::File { io, .. } => Some(io),
            Self::OS { io, .. } => Some(io),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { op, name, io } => {
                write!(f, "{} {} : {}", op, name.display(), io)
            }
            Self::OS { op, io } => write!(f, "{} : {}", op, io),
            Self::TooLong => write!(f, "value too long"),
            Self::NotIPv4 => write!(f, "interface address not IPv4"),
            Self::BadStr => write!(f, "string can not contain nil"),
            Self::ParseError { msg, name } => {
                write!(f, "{} while parsing {}", msg, name.display())
            }
            Self::Config(msg) => write!(f, "{}", msg),
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Self::UnknownCapability(name) => write!(f, "unknown capability: {}", name),
            Self::UnknownNamespace(name) => write!(f, "unknown unshare flag: {}", name),
            Self::AlreadyRunning => write!(f, "container is already running"),
            Self::NotRunning => write!(f, "container is not running"),
        }
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(_inp: std::ffi::NulError) -> Self {
        Error::BadStr
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(_inp: std::num::ParseIntError) -> Self {
        Error::BadStr
    }
}

impl From<io::Error> for Error {
    fn from(inp: io::Error) -> Self {
        Error::os("io", inp)
    }
}
