//! Pod adapter driving `kubectl exec`.

use std::ffi::OsString;

use camino::Utf8Path;
use serde::Deserialize;
use tracing::debug;

use super::{ClientDriver, Transport, TransportFuture};
use crate::command::{Command, Copyable};
use crate::config::PodConfig;
use crate::context::Context;
use crate::exec::{ExecResponse, Invocation, Launcher, ProcessLauncher, TransportError};

const RUNNING_PHASE: &str = "Running";

/// Runs commands inside one container of a pod as `sh -c <command>`.
#[derive(Debug)]
pub struct PodTransport<L: Launcher = ProcessLauncher> {
    config: PodConfig,
    driver: ClientDriver<L>,
}

#[derive(Debug, Default, Deserialize)]
struct PodResource {
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
struct ContainerSpec {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
}

impl PodTransport<ProcessLauncher> {
    /// Resolves the configured pod with the real `kubectl` binary.
    ///
    /// # Errors
    ///
    /// See [`PodTransport::connect_with`].
    pub async fn connect(config: PodConfig) -> Result<Self, TransportError> {
        Self::connect_with(config, ProcessLauncher).await
    }
}

impl<L: Launcher> PodTransport<L> {
    /// Creates an adapter without querying the cluster. When no container is
    /// configured `kubectl` picks the pod's default container.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] when validation fails.
    pub fn new(config: PodConfig, launcher: L) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            driver: ClientDriver::new(launcher),
        })
    }

    /// Looks the pod up with `kubectl get pod -o json`, requires it to be
    /// running, and pins the container (the first one unless configured).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] when `kubectl` cannot start and
    /// [`TransportError::Resolve`] when the lookup fails, the pod is not
    /// running, or the container does not exist.
    pub async fn connect_with(config: PodConfig, launcher: L) -> Result<Self, TransportError> {
        let mut transport = Self::new(config, launcher)?;
        let container = transport.resolve_container().await?;
        debug!(
            pod = %transport.config.pod,
            namespace = %transport.config.namespace,
            container = %container,
            "resolved pod"
        );
        transport.config.container = Some(container);
        Ok(transport)
    }

    /// Returns the adapter configuration, including any resolved container.
    #[must_use]
    pub const fn config(&self) -> &PodConfig {
        &self.config
    }

    /// Returns the launcher used to start `kubectl`.
    #[must_use]
    pub const fn launcher(&self) -> &L {
        self.driver.launcher()
    }

    async fn resolve_container(&self) -> Result<String, TransportError> {
        let mut args = self.global_args();
        args.extend(
            [
                "get",
                "pod",
                self.config.pod.as_str(),
                "-n",
                self.config.namespace.as_str(),
                "-o",
                "json",
            ]
            .map(OsString::from),
        );
        let lookup = Invocation::new(self.config.kubectl_bin.clone(), args);
        let output = self
            .driver
            .launcher()
            .output(&lookup)
            .await
            .map_err(|err| TransportError::Spawn {
                program: self.config.kubectl_bin.clone(),
                message: err.to_string(),
            })?;
        if !output.is_success() {
            return Err(self.resolve_error(output.stderr.trim().to_owned()));
        }

        let pod: PodResource = serde_json::from_str(&output.stdout)
            .map_err(|err| self.resolve_error(format!("unreadable pod description: {err}")))?;
        self.select_container(pod)
    }

    fn select_container(&self, pod: PodResource) -> Result<String, TransportError> {
        let phase = pod.status.phase.unwrap_or_default();
        if phase != RUNNING_PHASE {
            return Err(self.resolve_error(format!("pod is {phase:?}, expected {RUNNING_PHASE}")));
        }
        let mut names = pod.spec.containers.into_iter().map(|container| container.name);
        match self.config.container.as_deref() {
            Some(wanted) => names
                .find(|name| name == wanted)
                .ok_or_else(|| self.resolve_error(format!("container {wanted} not found"))),
            None => names
                .next()
                .ok_or_else(|| self.resolve_error(String::from("pod has no containers"))),
        }
    }

    fn resolve_error(&self, message: String) -> TransportError {
        TransportError::Resolve {
            resource: format!("pod {}/{}", self.config.namespace, self.config.pod),
            message,
        }
    }

    fn global_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(ref kubeconfig) = self.config.kubeconfig {
            args.push(OsString::from("--kubeconfig"));
            args.push(OsString::from(kubeconfig));
        }
        if let Some(ref context) = self.config.kube_context {
            args.push(OsString::from("--context"));
            args.push(OsString::from(context));
        }
        args
    }

    /// Builds the `kubectl exec` invocation running `sh -c remote_command`.
    /// `-i` is passed only when `stdin` is forwarded.
    #[must_use]
    pub fn invocation(&self, remote_command: &str, stdin: bool) -> Invocation {
        let mut args = self.global_args();
        args.push(OsString::from("exec"));
        if stdin {
            args.push(OsString::from("-i"));
        }
        args.push(OsString::from("-n"));
        args.push(OsString::from(&self.config.namespace));
        args.push(OsString::from(&self.config.pod));
        if let Some(ref container) = self.config.container {
            args.push(OsString::from("-c"));
            args.push(OsString::from(container));
        }
        args.extend(["--", "sh", "-c", remote_command].map(OsString::from));
        Invocation::new(self.config.kubectl_bin.clone(), args).with_remote_command(remote_command)
    }
}

impl<L: Launcher> Transport for PodTransport<L> {
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
