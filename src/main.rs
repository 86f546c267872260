//! Binary entry point for the Tether CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use tether::{
    AllocationConfig, ConfigError, Context, CopyableFile, InvalidArgument, PodConfig, Retrier,
    RetryError, ShellCommand, SshConfig, Target, Transport, TransportError, connect,
    interval_exponential, interval_fibonacci, interval_fixed, retry,
};

mod cli;

use cli::{BackendKind, BackoffKind, Cli, CopyCommand, RunCommand, TargetArgs};

const LOG_ENV: &str = "TETHER_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(#[from] InvalidArgument),
    #[error("cannot read {path}: {source}")]
    Source {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Retry(RetryError<TransportError>),
}

impl CliError {
    /// Exit status for the process: the remote exit code when one is known.
    fn exit_code(&self) -> i32 {
        let transport = match self {
            Self::Transport(err) => Some(err),
            Self::Retry(err) => err.last(),
            _ => None,
        };
        transport
            .and_then(TransportError::exit_code)
            .filter(|code| *code != 0)
            .unwrap_or(1)
    }
}

impl From<RetryError<TransportError>> for CliError {
    fn from(err: RetryError<TransportError>) -> Self {
        // A single attempt reads better without the attempt prefix.
        if err.attempts().len() == 1 && err.context().is_none() {
            if let Some((_, only)) = err.into_attempts().pop() {
                return Self::Transport(only);
            }
            return Self::Transport(TransportError::Aborted);
        }
        Self::Retry(err)
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
        Cli::Copy(command) => copy_command(command).await,
    }
}

async fn run_command(args: RunCommand) -> Result<(), CliError> {
    let command = ShellCommand::new(args.command)?;
    let ctx = context_for(&args.target);
    let connected = connect(load_target(args.target.backend)?).await?;
    let transport = connected.as_ref();

    let mut retrier = retrier_for(&args.target, || {
        let response = transport.stream(&ctx, &command);
        async move {
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            response.wait_into(&mut stdout, &mut stderr).await
        }
    });
    let outcome = retry(&ctx, &mut retrier).await;
    close_quietly(transport);
    outcome.map_err(CliError::from)
}

async fn copy_command(args: CopyCommand) -> Result<(), CliError> {
    let source = Utf8PathBuf::from(&args.source);
    let destination = Utf8PathBuf::from(&args.destination);
    // Fail fast on an unreadable source before touching the backend.
    CopyableFile::open(&source)
        .await
        .map_err(|err| CliError::Source {
            path: source.clone(),
            source: err,
        })?;

    let ctx = context_for(&args.target);
    let connected = connect(load_target(args.target.backend)?).await?;
    let transport = connected.as_ref();

    let mut retrier = retrier_for(&args.target, || {
        copy_once(transport, &ctx, &source, &destination)
    });
    let outcome = retry(&ctx, &mut retrier).await;
    close_quietly(transport);
    outcome.map_err(CliError::from)
}

async fn copy_once(
    transport: &dyn Transport,
    ctx: &Context,
    source: &Utf8Path,
    destination: &Utf8Path,
) -> Result<(), TransportError> {
    let file = CopyableFile::open(source)
        .await
        .map_err(|err| TransportError::Archive {
            path: destination.to_path_buf(),
            source: err,
        })?;
    transport.copy(ctx, Box::new(file), destination).await
}

fn close_quietly(transport: &dyn Transport) {
    if let Err(err) = transport.close() {
        tracing::debug!(error = %err, "closing transport failed");
    }
}

fn load_target(backend: BackendKind) -> Result<Target, CliError> {
    Ok(match backend {
        BackendKind::Ssh => Target::Ssh(SshConfig::load_without_cli_args()?),
        BackendKind::Pod => Target::Pod(PodConfig::load_without_cli_args()?),
        BackendKind::Allocation => Target::Allocation(AllocationConfig::load_without_cli_args()?),
    })
}

fn context_for(args: &TargetArgs) -> Context {
    let background = Context::background();
    match args.timeout {
        Some(seconds) => background.with_timeout(Duration::from_secs(seconds)),
        None => background,
    }
}

fn retrier_for<F>(args: &TargetArgs, operation: F) -> Retrier<TransportError, F> {
    let base = Duration::from_millis(args.backoff_ms);
    let interval = match args.backoff {
        BackoffKind::Fixed => interval_fixed(base),
        BackoffKind::Exponential => interval_exponential(base),
        BackoffKind::Fibonacci => interval_fibonacci(base),
    };
    Retrier::new(operation)
        .max_retries(args.attempts)
        .interval(interval)
        .retry_on(is_retryable)
}

/// Local mistakes are not worth another attempt.
fn is_retryable(err: &TransportError) -> bool {
    !matches!(
        err,
        TransportError::InvalidConfig { .. }
            | TransportError::InvalidDestination { .. }
            | TransportError::Closed
            | TransportError::Context(_)
    )
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tether::ExecError;

    #[rstest]
    fn exit_code_prefers_remote_status() {
        let err = CliError::Transport(ExecError::from_exit(42).into());
        assert_eq!(err.exit_code(), 42);
        assert_eq!(CliError::Transport(TransportError::Closed).exit_code(), 1);
    }

    #[tokio::test]
    async fn single_attempt_retry_error_is_unwrapped() {
        let mut retrier = Retrier::new(|| std::future::ready(Err::<(), _>(TransportError::Aborted)))
            .max_retries(1);
        let err = retry(&Context::background(), &mut retrier)
            .await
            .expect_err("always fails");

        let cli = CliError::from(err);
        assert!(matches!(cli, CliError::Transport(TransportError::Aborted)));
    }

    #[rstest]
    #[case(TransportError::Closed, false)]
    #[case(TransportError::Aborted, true)]
    #[case(ExecError::from_exit(255).into(), true)]
    fn retry_policy_skips_local_mistakes(#[case] err: TransportError, #[case] expected: bool) {
        assert_eq!(is_retryable(&err), expected);
    }

    #[rstest]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Transport(TransportError::Closed);
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(rendered, "transport is closed\n");
    }

    #[rstest]
    fn invalid_arguments_are_reported() {
        let err = ShellCommand::new(["echo", "a\nb"]).map_err(CliError::from);
        assert!(
            matches!(err, Err(CliError::InvalidCommand(_))),
            "unexpected result: {err:?}"
        );
    }
}
