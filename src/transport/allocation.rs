//! Allocation adapter driving `nomad alloc exec`.

use std::collections::BTreeMap;
use std::ffi::OsString;

use camino::Utf8Path;
use serde::Deserialize;
use tracing::debug;

use super::{ClientDriver, Transport, TransportFuture};
use crate::command::{Command, Copyable};
use crate::config::AllocationConfig;
use crate::context::Context;
use crate::exec::{ExecResponse, Invocation, Launcher, ProcessLauncher, TransportError};

const RUNNING_STATUS: &str = "running";

/// Runs commands inside one task of a scheduler allocation as
/// `sh -c <command>`.
#[derive(Debug)]
pub struct AllocationTransport<L: Launcher = ProcessLauncher> {
    config: AllocationConfig,
    driver: ClientDriver<L>,
}

#[derive(Debug, Deserialize)]
struct AllocationStub {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "ClientStatus", default)]
    client_status: String,
    #[serde(rename = "TaskStates", default)]
    task_states: Option<BTreeMap<String, serde_json::Value>>,
}

impl AllocationTransport<ProcessLauncher> {
    /// Resolves the configured allocation with the real `nomad` binary.
    ///
    /// # Errors
    ///
    /// See [`AllocationTransport::connect_with`].
    pub async fn connect(config: AllocationConfig) -> Result<Self, TransportError> {
        Self::connect_with(config, ProcessLauncher).await
    }
}

impl<L: Launcher> AllocationTransport<L> {
    /// Creates an adapter that treats the configured allocation as a full ID
    /// and does not query the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] when validation fails.
    pub fn new(config: AllocationConfig, launcher: L) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            driver: ClientDriver::new(launcher),
        })
    }

    /// Expands the configured ID prefix through the allocations API,
    /// requires the allocation to be running, and pins the task (the only
    /// task unless configured).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] when `nomad` cannot start and
    /// [`TransportError::Resolve`] when the prefix is unknown or ambiguous,
    /// the allocation is not running, or the task cannot be chosen.
    pub async fn connect_with(
        config: AllocationConfig,
        launcher: L,
    ) -> Result<Self, TransportError> {
        let mut transport = Self::new(config, launcher)?;
        let (id, task) = transport.resolve().await?;
        debug!(allocation = %id, task = %task, "resolved allocation");
        transport.config.allocation = id;
        transport.config.task = Some(task);
        Ok(transport)
    }

    /// Returns the adapter configuration, including any resolved ID and
    /// task.
    #[must_use]
    pub const fn config(&self) -> &AllocationConfig {
        &self.config
    }

    /// Returns the launcher used to start `nomad`.
    #[must_use]
    pub const fn launcher(&self) -> &L {
        self.driver.launcher()
    }

    async fn resolve(&self) -> Result<(String, String), TransportError> {
        let mut args = vec![OsString::from("operator"), OsString::from("api")];
        args.extend(self.global_args());
        args.push(OsString::from(format!(
            "/v1/allocations?prefix={}",
            self.config.allocation
        )));
        let lookup = Invocation::new(self.config.nomad_bin.clone(), args);
        let output = self
            .driver
            .launcher()
            .output(&lookup)
            .await
            .map_err(|err| TransportError::Spawn {
                program: self.config.nomad_bin.clone(),
                message: err.to_string(),
            })?;
        if !output.is_success() {
            return Err(self.resolve_error(output.stderr.trim().to_owned()));
        }

        let matches: Vec<AllocationStub> = serde_json::from_str(&output.stdout)
            .map_err(|err| self.resolve_error(format!("unreadable allocation list: {err}")))?;
        let allocation = self.pick_allocation(matches)?;
        if allocation.client_status != RUNNING_STATUS {
            return Err(self.resolve_error(format!(
                "allocation {} is {:?}, expected {RUNNING_STATUS}",
                allocation.id, allocation.client_status
            )));
        }
        let task = self.pick_task(&allocation)?;
        Ok((allocation.id, task))
    }

    fn pick_allocation(
        &self,
        mut matches: Vec<AllocationStub>,
    ) -> Result<AllocationStub, TransportError> {
        let wanted = self.config.allocation.as_str();
        if matches.len() > 1 {
            return matches
                .into_iter()
                .find(|candidate| candidate.id == wanted)
                .ok_or_else(|| {
                    self.resolve_error(String::from("prefix matches several allocations"))
                });
        }
        matches
            .pop()
            .ok_or_else(|| self.resolve_error(String::from("no allocation matches")))
    }

    fn pick_task(&self, allocation: &AllocationStub) -> Result<String, TransportError> {
        let tasks: Vec<&String> = allocation
            .task_states
            .as_ref()
            .map(BTreeMap::keys)
            .into_iter()
            .flatten()
            .collect();
        match (self.config.task.as_deref(), tasks.as_slice()) {
            (Some(wanted), []) => Ok(wanted.to_owned()),
            (Some(wanted), known) => known
                .iter()
                .find(|name| name.as_str() == wanted)
                .map(|name| (*name).clone())
                .ok_or_else(|| self.resolve_error(format!("task {wanted} not found"))),
            (None, [only]) => Ok((*only).clone()),
            (None, []) => Err(self.resolve_error(String::from("allocation has no tasks"))),
            (None, several) => Err(self.resolve_error(format!(
                "allocation has {} tasks; set TETHER_ALLOC_TASK",
                several.len()
            ))),
        }
    }

    fn resolve_error(&self, message: String) -> TransportError {
        TransportError::Resolve {
            resource: format!("allocation {}", self.config.allocation),
            message,
        }
    }

    fn global_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(ref address) = self.config.address {
            args.push(OsString::from(format!("-address={address}")));
        }
        if let Some(ref namespace) = self.config.namespace {
            args.push(OsString::from(format!("-namespace={namespace}")));
        }
        args
    }

    /// Builds the `nomad alloc exec` invocation running
    /// `sh -c remote_command`. Interactive input is enabled only when
    /// `stdin` is forwarded; a TTY is never requested.
    #[must_use]
    pub fn invocation(&self, remote_command: &str, stdin: bool) -> Invocation {
        let mut args = vec![OsString::from("alloc"), OsString::from("exec")];
        args.extend(self.global_args());
        args.push(OsString::from(format!("-i={stdin}")));
        args.push(OsString::from("-t=false"));
        if let Some(ref task) = self.config.task {
            args.push(OsString::from("-task"));
            args.push(OsString::from(task));
        }
        args.push(OsString::from(&self.config.allocation));
        args.extend(["sh", "-c", remote_command].map(OsString::from));
        Invocation::new(self.config.nomad_bin.clone(), args).with_remote_command(remote_command)
    }
}

impl<L: Launcher> Transport for AllocationTransport<L> {
    fn copy<'a>(
        &'a self,
        ctx: &'a Context,
        source: Box<dyn Copyable>,
        destination: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.driver.copy(ctx, source, destination, |command, stdin| {
            self.invocation(command, stdin)
        }))
    }

    fn stream(&self, ctx: &Context, command: &dyn Command) -> ExecResponse {
        self.driver.stream(ctx, command, |rendered, stdin| {
            self.invocation(rendered, stdin)
        })
    }

    fn close(&self) -> Result<(), TransportError> {
        self.driver.close();
        Ok(())
    }
}
