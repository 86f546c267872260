//! Core library for the Tether remote execution tool.
//!
//! The crate runs shell commands, streams their output, and copies files to
//! one remote compute unit (an SSH host, a pod, or a scheduler allocation)
//! through the uniform [`Transport`] contract. Adapters launch the native
//! client binaries (`ssh`, `kubectl`, `nomad`) and wire their stdio into the
//! exec stream multiplexer. Files travel as single-entry tar archives piped
//! into a remote `tar -xf -`. The [`retry`] loop wraps any fallible
//! operation with fixed, exponential, or Fibonacci backoff.

pub mod command;
pub mod config;
pub mod context;
pub mod copy;
pub mod exec;
pub mod retry;
pub mod test_support;
pub mod transport;

pub use command::{Command, Copyable, CopyableBytes, CopyableFile, InvalidArgument, ShellCommand};
pub use config::{AllocationConfig, ConfigError, PodConfig, SshConfig};
pub use context::{Context, ContextError};
pub use exec::{
    CauseList, ExecError, ExecOutput, ExecResponse, ExecResult, ExecStreams, Invocation, Launcher,
    ProcessLauncher, StreamKind, TransportError,
};
pub use retry::{
    IntervalFn, Retrier, RetryError, interval_exponential, interval_fibonacci, interval_fixed,
    retry,
};
pub use transport::{
    AllocationTransport, MockCall, MockOutcome, MockTransport, PodTransport, SshTransport, Target,
    Transport, connect,
};
