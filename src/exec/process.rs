//! Launching native client processes and pumping their stdio into the
//! multiplexer.
//!
//! Every backend reaches its remote unit through a local client binary
//! (`ssh`, `kubectl`, `nomad`). The [`Launcher`] trait abstracts process
//! creation so tests can substitute a double that runs the remote command
//! locally.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::process::{Child, Command};
use tracing::debug;

use super::{ExecError, ExecStreams, StreamKind, TransportError};

/// Future returned by [`Launcher::output`].
pub type LaunchFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// A native client invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    /// Client binary to execute.
    pub program: String,
    /// Arguments passed to the client.
    pub args: Vec<OsString>,
    /// Shell command destined for the remote unit, when the invocation
    /// carries one.
    pub remote_command: Option<String>,
}

impl Invocation {
    /// Creates an invocation with no remote command attached.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            remote_command: None,
        }
    }

    /// Records the remote shell command this invocation executes.
    #[must_use]
    pub fn with_remote_command(mut self, command: impl Into<String>) -> Self {
        self.remote_command = Some(command.into());
        self
    }

    /// Returns a shell-like command string for diagnostics and assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Result of running a client command to completion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over client process creation to support test doubles.
pub trait Launcher: Send + Sync {
    /// Starts `invocation` with piped stdout and stderr, and piped stdin when
    /// `stdin` is set.
    ///
    /// # Errors
    ///
    /// Returns the operating system error when the process cannot start.
    fn spawn(&self, invocation: &Invocation, stdin: bool) -> io::Result<Child>;

    /// Runs `invocation` to completion, capturing its output.
    fn output<'a>(&'a self, invocation: &'a Invocation) -> LaunchFuture<'a, CommandOutput>;
}

/// Launcher that starts the real client binaries on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn spawn(&self, invocation: &Invocation, stdin: bool) -> io::Result<Child> {
        Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn output<'a>(&'a self, invocation: &'a Invocation) -> LaunchFuture<'a, CommandOutput> {
        Box::pin(async move {
            let output = Command::new(&invocation.program)
                .args(&invocation.args)
                .stdin(Stdio::null())
                .output()
                .await?;
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Starts `invocation` and wires its stdio into `streams`.
///
/// Spawn failures are delivered as the terminal result. Otherwise a
/// background task forwards the child's output, feeds its stdin, and sends
/// the exit status once the child has finished.
pub(crate) fn spawn_exec<L>(launcher: &L, invocation: &Invocation, streams: ExecStreams)
where
    L: Launcher + ?Sized,
{
    let wants_stdin = streams.stdin.is_some();
    debug!(
        program = %invocation.program,
        stdin = wants_stdin,
        "launching remote exec"
    );
    match launcher.spawn(invocation, wants_stdin) {
        Ok(child) => {
            tokio::spawn(pump(child, invocation.program.clone(), streams));
        }
        Err(err) => streams.finish(Err(TransportError::Spawn {
            program: invocation.program.clone(),
            message: err.to_string(),
        })),
    }
}

async fn pump(mut child: Child, program: String, mut streams: ExecStreams) {
    let stdout_pipe = streams.take_stdout();
    let stderr_pipe = streams.take_stderr();
    let stdin_task = match (streams.take_stdin(), child.stdin.take()) {
        (Some(source), Some(target)) => Some(tokio::spawn(forward_stdin(source, target))),
        _ => None,
    };
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    let (stdout_result, stderr_result, status) = tokio::join!(
        forward(child_stdout, stdout_pipe, StreamKind::Stdout),
        forward(child_stderr, stderr_pipe, StreamKind::Stderr),
        child.wait(),
    );

    let mut aux = Vec::new();
    aux.extend(stdout_result.err());
    aux.extend(stderr_result.err());
    if let Some(task) = stdin_task {
        if task.is_finished() {
            if let Ok(Err(err)) = task.await {
                aux.push(err);
            }
        } else {
            // The child is gone; nothing will consume further input.
            task.abort();
        }
    }

    let result = exit_result(&program, status, aux);
    debug!(program = %program, ok = result.is_ok(), "remote exec finished");
    streams.finish(result);
}

fn exit_result(
    program: &str,
    status: io::Result<ExitStatus>,
    aux: Vec<TransportError>,
) -> Result<(), TransportError> {
    let terminal = match status {
        Ok(status) => match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(TransportError::Exec(ExecError::from_exit(code))),
            None => Err(TransportError::MissingExitStatus {
                program: program.to_owned(),
            }),
        },
        Err(err) => Err(TransportError::Connection {
            target: program.to_owned(),
            message: err.to_string(),
        }),
    };
    super::combine(terminal, aux)
}

/// Forwards a child output handle into a pipe write end, then closes it.
///
/// When the pipe reader has gone away the rest of the output is discarded so
/// the child never blocks writing to a full pipe.
async fn forward<R>(
    child_output: Option<R>,
    pipe: Option<DuplexStream>,
    stream: StreamKind,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = child_output else {
        return Ok(());
    };
    let Some(mut writer) = pipe else {
        return tokio::io::copy(&mut reader, &mut tokio::io::sink())
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Stream {
                stream,
                source: err,
            });
    };

    let outcome = match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(_) => writer.shutdown().await,
        Err(err) => {
            drop(writer);
            tokio::io::copy(&mut reader, &mut tokio::io::sink()).await.ok();
            Err(err)
        }
    };
    match outcome {
        Ok(()) => Ok(()),
        // Nobody is reading this stream any more; that is the caller's choice.
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(TransportError::Stream {
            stream,
            source: err,
        }),
    }
}

/// Feeds the caller's stdin pipe into the child until either side closes.
async fn forward_stdin<W>(mut pipe: DuplexStream, mut child_stdin: W) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut pipe, &mut child_stdin).await.map(|_| ());
    let closed = child_stdin.shutdown().await;
    match copied.and(closed) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(TransportError::Stream {
            stream: StreamKind::Stdin,
            source: err,
        }),
    }
}
