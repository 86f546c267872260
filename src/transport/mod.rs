//! Transport contract and the backend adapters implementing it.
//!
//! A [`Transport`] runs shell commands on exactly one remote unit and copies
//! files onto it. The SSH, pod, and allocation adapters drive the native
//! client binaries; [`MockTransport`] replays scripted outcomes for callers'
//! tests. [`Target`] selects a backend at runtime and [`connect`] builds the
//! matching adapter behind a trait object.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8Path;
use tracing::debug;

use crate::command::{Command, Copyable};
use crate::config::{AllocationConfig, PodConfig, SshConfig};
use crate::context::Context;
use crate::copy::copy_with;
use crate::exec::process::spawn_exec;
use crate::exec::{ExecOutput, ExecResponse, ExecStreams, Invocation, Launcher, TransportError};

mod allocation;
mod mock;
mod pod;
mod ssh;

pub use allocation::AllocationTransport;
pub use mock::{MockCall, MockOutcome, MockTransport};
pub use pod::PodTransport;
pub use ssh::SshTransport;

/// Future returned by fallible transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Future returned by [`Transport::run`].
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = ExecOutput> + Send + 'a>>;

/// Uniform operations against one remote compute unit.
pub trait Transport: Send + Sync {
    /// Copies `source` to the remote file `destination`, overwriting it.
    fn copy<'a>(
        &'a self,
        ctx: &'a Context,
        source: Box<dyn Copyable>,
        destination: &'a Utf8Path,
    ) -> TransportFuture<'a, ()>;

    /// Starts `command` and returns the caller half of its streams without
    /// waiting. Failures, including a cancelled context, arrive on the
    /// response's result channel.
    fn stream(&self, ctx: &Context, command: &dyn Command) -> ExecResponse;

    /// Runs `command` to completion and captures its output.
    fn run<'a>(&'a self, ctx: &'a Context, command: &'a dyn Command) -> RunFuture<'a> {
        let response = self.stream(ctx, command);
        Box::pin(response.wait_for_results())
    }

    /// Releases the transport. Later operations fail with
    /// [`TransportError::Closed`]; closing again is a no-op.
    ///
    /// # Errors
    ///
    /// Adapters report failures releasing backend resources.
    fn close(&self) -> Result<(), TransportError>;
}

/// Backend selection for [`connect`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    /// A host reached through `ssh`.
    Ssh(SshConfig),
    /// A pod reached through `kubectl exec`.
    Pod(PodConfig),
    /// A scheduler allocation reached through `nomad alloc exec`.
    Allocation(AllocationConfig),
}

impl Target {
    /// Short backend name used in diagnostics.
    #[must_use]
    pub const fn backend_name(&self) -> &'static str {
        match self {
            Self::Ssh(_) => "ssh",
            Self::Pod(_) => "pod",
            Self::Allocation(_) => "allocation",
        }
    }
}

/// Connects to `target` with the real client binaries.
///
/// # Errors
///
/// Returns configuration, connection, or resolution errors from the chosen
/// adapter.
pub async fn connect(target: Target) -> Result<Box<dyn Transport>, TransportError> {
    debug!(backend = target.backend_name(), "connecting transport");
    Ok(match target {
        Target::Ssh(config) => Box::new(SshTransport::connect(config).await?),
        Target::Pod(config) => Box::new(PodTransport::connect(config).await?),
        Target::Allocation(config) => Box::new(AllocationTransport::connect(config).await?),
    })
}

/// Shared plumbing for adapters that launch one client process per call.
#[derive(Debug)]
pub(crate) struct ClientDriver<L> {
    launcher: L,
    closed: AtomicBool,
}

impl<L: Launcher> ClientDriver<L> {
    pub(crate) const fn new(launcher: L) -> Self {
        Self {
            launcher,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) const fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Fails when the context no longer permits work or the transport is
    /// closed.
    pub(crate) fn admit(&self, ctx: &Context) -> Result<(), TransportError> {
        ctx.check()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn stream<B>(&self, ctx: &Context, command: &dyn Command, build: B) -> ExecResponse
    where
        B: FnOnce(&str, bool) -> Invocation,
    {
        if let Err(err) = self.admit(ctx) {
            return ExecStreams::failed(err);
        }
        let (streams, response, _) = ExecStreams::new(false);
        spawn_exec(&self.launcher, &build(&command.render(), false), streams);
        response
    }

    pub(crate) async fn copy<B>(
        &self,
        ctx: &Context,
        source: Box<dyn Copyable>,
        destination: &Utf8Path,
        build: B,
    ) -> Result<(), TransportError>
    where
        B: FnOnce(&str, bool) -> Invocation,
    {
        self.admit(ctx)?;
        copy_with(source, destination, |command| {
            let (streams, response, stdin) = ExecStreams::new(true);
            spawn_exec(&self.launcher, &build(command, true), streams);
            (response, stdin)
        })
        .await
    }
}

#[cfg(test)]
mod tests;
