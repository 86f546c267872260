//! Error taxonomy shared by the multiplexer, the copy protocol, and every
//! transport adapter.
//!
//! Errors are joined rather than overwritten. A caller can always recover the
//! remote exit code through [`TransportError::exec_error`] while the rendered
//! message still lists every auxiliary cause.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::context::ContextError;

/// Boxed cause stored inside an [`ExecError`].
pub type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// Base cause recorded when a remote process exits with a non-zero status.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("remote command exited with status {code}")]
pub struct RemoteExit {
    /// Exit status reported by the remote process.
    pub code: i32,
}

/// Every cause recorded on an [`ExecError`], rendered one per line.
///
/// Returned as the error source once an exec error holds more than one
/// cause.
#[derive(Debug)]
pub struct CauseList(Vec<Cause>);

impl CauseList {
    /// Returns the causes in insertion order.
    #[must_use]
    pub fn causes(&self) -> &[Cause] {
        &self.0
    }
}

impl fmt::Display for CauseList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cause in &self.0 {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{cause}")?;
        }
        Ok(())
    }
}

impl StdError for CauseList {}

/// A remote process exit code together with the errors that explain it.
///
/// With one cause the error is a transparent wrapper; with several it renders
/// every cause on its own line and exposes them as a [`CauseList`] source.
/// Two exec errors compare equal when their exit codes match, regardless of
/// message text.
#[derive(Debug)]
pub struct ExecError {
    exit_code: i32,
    causes: CauseList,
}

impl ExecError {
    /// Wraps `cause` with the remote `exit_code`.
    pub fn new(cause: impl Into<Cause>, exit_code: i32) -> Self {
        Self {
            exit_code,
            causes: CauseList(vec![cause.into()]),
        }
    }

    /// Builds the error recorded when a remote command exits with `code`.
    #[must_use]
    pub fn from_exit(code: i32) -> Self {
        Self::new(RemoteExit { code }, code)
    }

    /// Returns the remote process exit code.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Adds an auxiliary cause while keeping the exit code.
    pub fn append(&mut self, cause: impl Into<Cause>) {
        self.causes.0.push(cause.into());
    }

    /// Returns every recorded cause in insertion order.
    #[must_use]
    pub fn causes(&self) -> &[Cause] {
        self.causes.causes()
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.causes() {
            [] => write!(f, "remote command exited with status {}", self.exit_code),
            [single] => write!(f, "{single}"),
            _ => write!(f, "{}", self.causes),
        }
    }
}

impl StdError for ExecError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self.causes() {
            [] => None,
            [single] => Some(single.as_ref()),
            _ => Some(&self.causes),
        }
    }
}

impl PartialEq for ExecError {
    fn eq(&self, other: &Self) -> bool {
        self.exit_code == other.exit_code
    }
}

impl Eq for ExecError {}

/// Names the captured stream an I/O failure belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamKind {
    /// Remote standard output.
    Stdout,
    /// Remote standard error.
    Stderr,
    /// Remote standard input.
    Stdin,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Stdin => "stdin",
        })
    }
}

/// Several errors folded into one value, each kept intact.
#[derive(Debug)]
pub struct JoinedErrors(Vec<TransportError>);

impl JoinedErrors {
    /// Returns the joined errors in the order they were recorded.
    #[must_use]
    pub fn errors(&self) -> &[TransportError] {
        &self.0
    }
}

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Errors surfaced by transports and the primitives they are built on.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The caller's context was cancelled or expired before work started.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// Raised when configuration is missing a required value.
    #[error("missing {field}: set {env_var} or add {field} to tether.toml")]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
        /// Environment variable that supplies the field.
        env_var: String,
    },
    /// Raised when the native client binary cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Client binary that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the backend cannot be reached at all.
    #[error("failed to connect to {target}: {message}")]
    Connection {
        /// Human readable description of the backend endpoint.
        target: String,
        /// Description of the failure.
        message: String,
    },
    /// Raised when a pod or allocation cannot be resolved to a single,
    /// running target.
    #[error("failed to resolve {resource}: {message}")]
    Resolve {
        /// Resource being resolved (for example `pod web-0`).
        resource: String,
        /// Description of the failure.
        message: String,
    },
    /// Raised when a copy destination has no usable file name.
    #[error("invalid copy destination {path}: {message}")]
    InvalidDestination {
        /// Destination supplied by the caller.
        path: Utf8PathBuf,
        /// Description of the problem.
        message: String,
    },
    /// The remote command ran and exited with a non-zero status.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// The native client terminated without reporting an exit status.
    #[error("{program} terminated without an exit status")]
    MissingExitStatus {
        /// Client binary that was running the remote command.
        program: String,
    },
    /// Capturing or forwarding one of the exec streams failed.
    #[error("{stream} stream failed: {source}")]
    Stream {
        /// Stream that failed.
        stream: StreamKind,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The archive writer feeding a copy failed.
    #[error("failed to stream archive for {path}: {source}")]
    Archive {
        /// Remote destination of the copy.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The remote unarchiver wrote diagnostics during a copy.
    #[error("copy to {path} reported: {stderr}")]
    RemoteStderr {
        /// Remote destination of the copy.
        path: Utf8PathBuf,
        /// Stderr captured from the unarchiver.
        stderr: String,
    },
    /// The exec pipeline ended without delivering its terminal result.
    #[error("exec finished without reporting a result")]
    Aborted,
    /// The transport was closed before the call.
    #[error("transport is closed")]
    Closed,
    /// Several independent failures.
    #[error("{0}")]
    Joined(JoinedErrors),
}

impl TransportError {
    /// Folds `errors` into a single value.
    ///
    /// Nested joins are flattened. Returns `None` when the iterator is empty
    /// and the bare error when it holds exactly one.
    pub fn join(errors: impl IntoIterator<Item = Self>) -> Option<Self> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Self::Joined(JoinedErrors(inner)) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::Joined(JoinedErrors(flat))),
        }
    }

    /// Finds the remote exit error, searching inside joined errors.
    #[must_use]
    pub fn exec_error(&self) -> Option<&ExecError> {
        match self {
            Self::Exec(exec) => Some(exec),
            Self::Joined(joined) => joined.errors().iter().find_map(Self::exec_error),
            _ => None,
        }
    }

    /// Returns the remote exit code when one is recorded.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exec_error().map(ExecError::exit_code)
    }

    /// Iterates over this error and, for joined errors, every member.
    pub fn flatten(&self) -> Box<dyn Iterator<Item = &Self> + '_> {
        match self {
            Self::Joined(joined) => Box::new(joined.errors().iter().flat_map(Self::flatten)),
            other => Box::new(std::iter::once(other)),
        }
    }
}

/// Folds the terminal exec result with stream-capture failures.
///
/// The terminal error comes first. When it is an [`ExecError`] the capture
/// failures are appended to it so the exit code stays attached; otherwise all
/// errors are joined. A capture failure on its own still yields an error.
pub(crate) fn combine(
    terminal: Result<(), TransportError>,
    capture: Vec<TransportError>,
) -> Result<(), TransportError> {
    match terminal {
        Err(TransportError::Exec(mut exec)) => {
            for err in capture {
                exec.append(err);
            }
            Err(TransportError::Exec(exec))
        }
        Err(err) => Err(TransportError::join(std::iter::once(err).chain(capture))
            .unwrap_or(TransportError::Aborted)),
        Ok(()) => TransportError::join(capture).map_or(Ok(()), Err),
    }
}
