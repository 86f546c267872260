//! SSH adapter driving the system `ssh` client.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8Path;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{ClientDriver, Transport, TransportFuture};
use crate::command::{Command, Copyable};
use crate::config::SshConfig;
use crate::context::Context;
use crate::exec::{ExecResponse, Invocation, Launcher, ProcessLauncher, TransportError};

/// Runs commands on a host through `ssh user@host <command>`.
///
/// Every operation starts its own `ssh` process; no connection is shared
/// between calls.
#[derive(Debug)]
pub struct SshTransport<L: Launcher = ProcessLauncher> {
    config: SshConfig,
    driver: ClientDriver<L>,
}

impl SshTransport<ProcessLauncher> {
    /// Validates `config` and waits until the SSH port accepts TCP
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] for invalid settings and
    /// [`TransportError::Connection`] when the port cannot be reached within
    /// the configured timeout.
    pub async fn connect(config: SshConfig) -> Result<Self, TransportError> {
        let transport = Self::new(config, ProcessLauncher)?;
        transport.probe().await?;
        Ok(transport)
    }
}

impl<L: Launcher> SshTransport<L> {
    /// Creates an adapter using `launcher` without probing the host.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] when validation fails.
    pub fn new(config: SshConfig, launcher: L) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            driver: ClientDriver::new(launcher),
        })
    }

    /// Returns the adapter configuration.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Returns the launcher used to start `ssh`.
    #[must_use]
    pub const fn launcher(&self) -> &L {
        self.driver.launcher()
    }

    /// Opens and drops one TCP connection to the configured host and port.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] when the connection is refused
    /// or does not complete within `connect_timeout_secs`.
    pub async fn probe(&self) -> Result<(), TransportError> {
        let address = (self.config.host.as_str(), self.config.port);
        let limit = Duration::from_secs(self.config.connect_timeout_secs);
        match timeout(limit, TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                debug!(host = %self.config.host, port = self.config.port, "ssh port reachable");
                Ok(())
            }
            Ok(Err(err)) => Err(self.connection_error(err.to_string())),
            Err(_) => Err(self.connection_error(format!(
                "no response within {}s",
                self.config.connect_timeout_secs
            ))),
        }
    }

    fn connection_error(&self, message: String) -> TransportError {
        TransportError::Connection {
            target: self.destination(),
            message,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}:{}", self.config.user, self.config.host, self.config.port)
    }

    /// Builds the `ssh` invocation that runs `remote_command` on the host.
    #[must_use]
    pub fn invocation(&self, remote_command: &str) -> Invocation {
        let mut args = self.ssh_options();
        args.push(OsString::from(format!(
            "{}@{}",
            self.config.user, self.config.host
        )));
        args.push(OsString::from(remote_command));
        Invocation::new(self.config.ssh_bin.clone(), args).with_remote_command(remote_command)
    }

    fn ssh_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.port.to_string()),
        ];

        if let Some(ref identity_file) = self.config.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.uses_batch_mode() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.connect_timeout_secs
        )));
        args
    }
}

impl<L: Launcher> Transport for SshTransport<L> {
    fn copy<'a>(
        &'a self,
        ctx: &'a Context,
        source: Box<dyn Copyable>,
        destination: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(
            self.driver
                .copy(ctx, source, destination, |command, _| self.invocation(command)),
        )
    }

    fn stream(&self, ctx: &Context, command: &dyn Command) -> ExecResponse {
        self.driver
            .stream(ctx, command, |rendered, _| self.invocation(rendered))
    }

    fn close(&self) -> Result<(), TransportError> {
        self.driver.close();
        Ok(())
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The path is returned unchanged when `HOME` is unset.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
