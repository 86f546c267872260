//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, MutexGuard};

use crate::exec::{CommandOutput, Invocation, LaunchFuture, Launcher};

#[derive(Debug, Default)]
struct LauncherState {
    invocations: Vec<Invocation>,
    outputs: VecDeque<CommandOutput>,
}

/// Launcher that runs each invocation's remote command on the local host.
///
/// `spawn` executes `sh -c <remote command>` instead of the native client, so
/// adapters can be exercised end to end without a remote unit. `output`
/// returns pre-seeded captured outputs in FIFO order. Every invocation is
/// recorded; clones share the recording.
#[derive(Clone, Debug, Default)]
pub struct LocalLauncher {
    state: Arc<StdMutex<LauncherState>>,
    unavailable: bool,
}

impl LocalLauncher {
    /// Creates a launcher with no queued outputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a launcher whose processes never start, as if the client
    /// binary were missing.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    /// Queues the captured output returned by the next `output` call.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.lock().outputs.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, invocation: &Invocation) -> io::Result<()> {
        self.lock().invocations.push(invocation.clone());
        if self.unavailable {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", invocation.program),
            ));
        }
        Ok(())
    }
}

impl Launcher for LocalLauncher {
    fn spawn(&self, invocation: &Invocation, stdin: bool) -> io::Result<Child> {
        self.record(invocation)?;
        let mut command = match invocation.remote_command {
            Some(ref remote) => {
                let mut local = Command::new("sh");
                local.arg("-c").arg(remote);
                local
            }
            None => {
                let mut local = Command::new(&invocation.program);
                local.args(&invocation.args);
                local
            }
        };
        command
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn output<'a>(&'a self, invocation: &'a Invocation) -> LaunchFuture<'a, CommandOutput> {
        Box::pin(async move {
            self.record(invocation)?;
            self.lock().outputs.pop_front().ok_or_else(|| {
                io::Error::other(format!(
                    "no scripted output for {}",
                    invocation.command_string()
                ))
            })
        })
    }
}

/// Produces a minimal JSON payload matching `kubectl get pod -o json`.
#[must_use]
pub fn json_pod(phase: &str, containers: &[&str]) -> String {
    let containers_json = containers
        .iter()
        .map(|name| format!("{{\"name\":\"{name}\",\"image\":\"busybox\"}}"))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{{\"kind\":\"Pod\",\"spec\":{{\"containers\":[{containers_json}]}},\
         \"status\":{{\"phase\":\"{phase}\"}}}}"
    )
}

/// Produces a minimal JSON payload matching the allocations list API.
#[must_use]
pub fn json_allocations(allocations: &[(&str, &str, &[&str])]) -> String {
    let items = allocations
        .iter()
        .map(|(id, status, tasks)| {
            let tasks_json = tasks
                .iter()
                .map(|task| format!("\"{task}\":{{\"State\":\"running\"}}"))
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "{{\"ID\":\"{id}\",\"ClientStatus\":\"{status}\",\
                 \"TaskStates\":{{{tasks_json}}}}}"
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("[{items}]")
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
