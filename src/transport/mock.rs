//! In-memory transport for callers' tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{RunFuture, Transport, TransportFuture};
use crate::command::{Command, Copyable};
use crate::context::Context;
use crate::exec::{ExecError, ExecResponse, ExecStreams, TransportError};

/// A call observed by [`MockTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MockCall {
    /// `run` with the rendered command.
    Run(String),
    /// `stream` with the rendered command.
    Stream(String),
    /// `copy` with the destination and every byte read from the source.
    Copy {
        /// Remote destination requested by the caller.
        destination: Utf8PathBuf,
        /// Source contents.
        contents: Vec<u8>,
    },
    /// `close`.
    Close,
}

/// Scripted result of one `run` or `stream` call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MockOutcome {
    /// Bytes written to the stdout pipe.
    pub stdout: String,
    /// Bytes written to the stderr pipe.
    pub stderr: String,
    /// Exit code; anything but zero yields an [`ExecError`].
    pub exit_code: i32,
}

impl MockOutcome {
    /// Successful outcome printing `stdout`.
    #[must_use]
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            ..Self::default()
        }
    }

    /// Failed outcome with `exit_code` and `stderr`.
    #[must_use]
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    outcomes: VecDeque<MockOutcome>,
    copy_failures: VecDeque<i32>,
}

/// Transport that records calls and replays queued outcomes in order.
///
/// With nothing queued every command succeeds with empty output and every
/// copy succeeds.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    closed: AtomicBool,
}

impl MockTransport {
    /// Creates a mock with no queued outcomes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of the next `run` or `stream` call.
    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.lock().outcomes.push_back(outcome);
    }

    /// Makes the next `copy` fail with `exit_code`.
    pub fn push_copy_failure(&self, exit_code: i32) {
        self.lock().copy_failures.push_back(exit_code);
    }

    /// Returns every call observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, ctx: &Context) -> Result<(), TransportError> {
        ctx.check()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn next_outcome(&self, call: MockCall) -> MockOutcome {
        let mut state = self.lock();
        state.calls.push(call);
        state.outcomes.pop_front().unwrap_or_default()
    }

    fn replay(outcome: MockOutcome) -> ExecResponse {
        let (mut streams, response, _) = ExecStreams::new(false);
        let stdout = streams.take_stdout();
        let stderr = streams.take_stderr();
        tokio::spawn(async move {
            tokio::join!(
                write_pipe(stdout, outcome.stdout),
                write_pipe(stderr, outcome.stderr),
            );
            let result = if outcome.exit_code == 0 {
                Ok(())
            } else {
                Err(ExecError::from_exit(outcome.exit_code).into())
            };
            streams.finish(result);
        });
        response
    }
}

async fn write_pipe(pipe: Option<tokio::io::DuplexStream>, text: String) {
    if let Some(mut pipe) = pipe {
        // A reader that went away simply misses the scripted bytes.
        pipe.write_all(text.as_bytes()).await.ok();
        pipe.shutdown().await.ok();
    }
}

impl Transport for MockTransport {
    fn copy<'a>(
        &'a self,
        ctx: &'a Context,
        mut source: Box<dyn Copyable>,
        destination: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.admit(ctx)?;
            let mut contents = Vec::new();
            source
                .rewind()
                .await
                .map_err(|err| archive_error(destination, err))?;
            source
                .read_to_end(&mut contents)
                .await
                .map_err(|err| archive_error(destination, err))?;
            let mut state = self.lock();
            state.calls.push(MockCall::Copy {
                destination: destination.to_path_buf(),
                contents,
            });
            match state.copy_failures.pop_front() {
                Some(code) => Err(ExecError::from_exit(code).into()),
                None => Ok(()),
            }
        })
    }

    fn stream(&self, ctx: &Context, command: &dyn Command) -> ExecResponse {
        if let Err(err) = self.admit(ctx) {
            return ExecStreams::failed(err);
        }
        Self::replay(self.next_outcome(MockCall::Stream(command.render())))
    }

    fn run<'a>(&'a self, ctx: &'a Context, command: &'a dyn Command) -> RunFuture<'a> {
        let response = match self.admit(ctx) {
            Ok(()) => Self::replay(self.next_outcome(MockCall::Run(command.render()))),
            Err(err) => ExecStreams::failed(err),
        };
        Box::pin(response.wait_for_results())
    }

    fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.lock().calls.push(MockCall::Close);
        }
        Ok(())
    }
}

fn archive_error(destination: &Utf8Path, err: std::io::Error) -> TransportError {
    TransportError::Archive {
        path: destination.to_path_buf(),
        source: err,
    }
}
