//! Exec stream multiplexer shared by every transport adapter.
//!
//! An exec invocation is split into two halves. The adapter keeps
//! [`ExecStreams`], writing remote output into pipe write ends and sending
//! exactly one terminal result. The caller keeps [`ExecResponse`], draining
//! the pipe read ends and awaiting that result. Both stream drains run
//! concurrently with the result wait, so remote output can never fill a pipe
//! while the caller is blocked on completion.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::oneshot;

mod error;
pub(crate) mod process;

pub use error::{
    Cause, CauseList, ExecError, JoinedErrors, RemoteExit, StreamKind, TransportError,
};
pub(crate) use error::combine;
pub use process::{CommandOutput, Invocation, LaunchFuture, Launcher, ProcessLauncher};

/// Capacity of each in-memory pipe between adapter and caller.
pub const PIPE_CAPACITY: usize = 64 * 1024;

const DRAIN_CHUNK: usize = 8 * 1024;

/// Terminal value of an exec: `Ok(())` on success or the failure.
pub type ExecResult = Result<(), TransportError>;

/// Adapter half of an exec: pipe write ends plus the result sender.
///
/// Write ends are closed at most once. Dropping the value without calling
/// [`ExecStreams::finish`] delivers [`TransportError::Aborted`] so a waiting
/// caller never blocks forever.
#[derive(Debug)]
pub struct ExecStreams {
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    stdin: Option<DuplexStream>,
    result: Option<oneshot::Sender<ExecResult>>,
}

/// Caller half of an exec: pipe read ends plus the result receiver.
#[derive(Debug)]
pub struct ExecResponse {
    /// Remote standard output.
    pub stdout: DuplexStream,
    /// Remote standard error.
    pub stderr: DuplexStream,
    /// Receives exactly one terminal value.
    pub result: oneshot::Receiver<ExecResult>,
}

/// Outcome of a completed exec: captured output and the combined error.
#[derive(Debug)]
pub struct ExecOutput {
    /// Captured stdout with one trailing newline removed.
    pub stdout: String,
    /// Captured stderr with one trailing newline removed.
    pub stderr: String,
    /// Terminal error joined with any capture failures.
    pub result: ExecResult,
}

impl ExecOutput {
    /// Converts the outcome into `(stdout, stderr)` or the error.
    ///
    /// # Errors
    ///
    /// Returns the combined exec error; captured output is discarded.
    pub fn into_result(self) -> Result<(String, String), TransportError> {
        self.result.map(|()| (self.stdout, self.stderr))
    }

    /// Reports whether the exec succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

impl ExecStreams {
    /// Creates a fresh set of pipes. When `with_stdin` is set, the returned
    /// writer feeds the remote process's standard input.
    #[must_use]
    pub fn new(with_stdin: bool) -> (Self, ExecResponse, Option<DuplexStream>) {
        let (stdout_writer, stdout_reader) = duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = duplex(PIPE_CAPACITY);
        let (stdin_writer, stdin_reader) = if with_stdin {
            let (writer, reader) = duplex(PIPE_CAPACITY);
            (Some(writer), Some(reader))
        } else {
            (None, None)
        };
        let (sender, receiver) = oneshot::channel();

        let streams = Self {
            stdout: Some(stdout_writer),
            stderr: Some(stderr_writer),
            stdin: stdin_reader,
            result: Some(sender),
        };
        let response = ExecResponse {
            stdout: stdout_reader,
            stderr: stderr_reader,
            result: receiver,
        };
        (streams, response, stdin_writer)
    }

    /// Builds a response that already failed with `err`.
    #[must_use]
    pub fn failed(err: TransportError) -> ExecResponse {
        let (streams, response, _) = Self::new(false);
        streams.finish(Err(err));
        response
    }

    /// Takes the stdout write end.
    pub fn take_stdout(&mut self) -> Option<DuplexStream> {
        self.stdout.take()
    }

    /// Takes the stderr write end.
    pub fn take_stderr(&mut self) -> Option<DuplexStream> {
        self.stderr.take()
    }

    /// Takes the stdin read end, present only when requested at creation.
    pub fn take_stdin(&mut self) -> Option<DuplexStream> {
        self.stdin.take()
    }

    /// Closes every pipe end still held. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.stdout = None;
        self.stderr = None;
        self.stdin = None;
    }

    /// Closes the pipes and delivers the terminal result.
    pub fn finish(mut self, result: ExecResult) {
        self.close();
        if let Some(sender) = self.result.take() {
            // The caller may have stopped listening; the result is then moot.
            sender.send(result).ok();
        }
    }
}

impl Drop for ExecStreams {
    fn drop(&mut self) {
        self.close();
        if let Some(sender) = self.result.take() {
            sender.send(Err(TransportError::Aborted)).ok();
        }
    }
}

impl ExecResponse {
    /// Drains both streams into strings and waits for the terminal result.
    ///
    /// Exactly one trailing newline is trimmed from each captured string.
    pub async fn wait_for_results(self) -> ExecOutput {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = self.wait_into(&mut stdout, &mut stderr).await;
        ExecOutput {
            stdout: trim_trailing_newline(String::from_utf8_lossy(&stdout).into_owned()),
            stderr: trim_trailing_newline(String::from_utf8_lossy(&stderr).into_owned()),
            result,
        }
    }

    /// Drains both streams into the supplied sinks and waits for the terminal
    /// result.
    ///
    /// # Errors
    ///
    /// Returns the terminal error first, then any failure writing into the
    /// sinks. Sink failures are appended to an [`ExecError`] when the remote
    /// command also failed.
    pub async fn wait_into<O, E>(self, stdout_sink: &mut O, stderr_sink: &mut E) -> ExecResult
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        let Self {
            stdout,
            stderr,
            result,
        } = self;

        let (stdout_drain, stderr_drain, terminal) = tokio::join!(
            drain(stdout, stdout_sink, StreamKind::Stdout),
            drain(stderr, stderr_sink, StreamKind::Stderr),
            async { result.await.unwrap_or(Err(TransportError::Aborted)) },
        );

        let capture = [stdout_drain, stderr_drain]
            .into_iter()
            .filter_map(Result::err)
            .collect();
        combine(terminal, capture)
    }
}

/// Copies `reader` into `sink` byte-for-byte until end of stream.
///
/// A failing sink does not stop the drain: the remaining bytes are still read
/// and discarded so the producer is never blocked on a full pipe.
async fn drain<R, W>(mut reader: R, sink: &mut W, stream: StreamKind) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0_u8; DRAIN_CHUNK];
    let mut failure = None;
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(source) => {
                failure.get_or_insert(source);
                break;
            }
        };
        if failure.is_some() {
            continue;
        }
        let Some(chunk) = buffer.get(..read) else {
            continue;
        };
        if let Err(source) = sink.write_all(chunk).await {
            failure = Some(source);
        }
    }
    if failure.is_none()
        && let Err(source) = sink.flush().await
    {
        failure = Some(source);
    }
    failure.map_or(Ok(()), |source| {
        Err(TransportError::Stream { stream, source })
    })
}

fn trim_trailing_newline(mut text: String) -> String {
    if text.ends_with('\n') {
        text.pop();
    }
    text
}
