//! Backend configuration loaded via `ortho-config`.
//!
//! Each backend has its own configuration struct. Values merge defaults,
//! configuration files (`tether.toml`, `.tether.toml`, or the file named by
//! `TETHER_CONFIG_PATH`), and environment variables, in that order of
//! precedence.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::exec::TransportError;

/// Errors raised when loading configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

/// Settings for reaching a host through the system `ssh` client.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TETHER_SSH",
    discovery(
        app_name = "tether",
        env_var = "TETHER_CONFIG_PATH",
        config_file_name = "tether.toml",
        dotfile_name = ".tether.toml",
        project_file_name = "tether.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Host name or address to connect to.
    pub host: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub user: String,
    /// TCP port of the SSH daemon.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Path to the private key. Supports tilde expansion; when absent the
    /// client falls back to its default key locations.
    pub identity_file: Option<String>,
    /// Whether to force batch mode to avoid password prompts. Unset means
    /// enabled; see [`SshConfig::uses_batch_mode`].
    pub batch_mode: Option<bool>,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Seconds allowed for the TCP connection to be established.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
}

/// Settings for executing inside a pod through `kubectl exec`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TETHER_POD",
    discovery(
        app_name = "tether",
        env_var = "TETHER_CONFIG_PATH",
        config_file_name = "tether.toml",
        dotfile_name = ".tether.toml",
        project_file_name = "tether.toml"
    )
)]
pub struct PodConfig {
    /// Path to the `kubectl` executable.
    #[ortho_config(default = "kubectl".to_owned())]
    pub kubectl_bin: String,
    /// Namespace holding the pod.
    #[ortho_config(default = "default".to_owned())]
    pub namespace: String,
    /// Pod name.
    pub pod: String,
    /// Container name; defaults to the pod's first container.
    pub container: Option<String>,
    /// Kubeconfig context to use instead of the current one.
    pub kube_context: Option<String>,
    /// Kubeconfig file to use instead of the default lookup.
    pub kubeconfig: Option<String>,
}

/// Settings for executing inside a scheduler allocation through
/// `nomad alloc exec`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TETHER_ALLOC",
    discovery(
        app_name = "tether",
        env_var = "TETHER_CONFIG_PATH",
        config_file_name = "tether.toml",
        dotfile_name = ".tether.toml",
        project_file_name = "tether.toml"
    )
)]
pub struct AllocationConfig {
    /// Path to the `nomad` executable.
    #[ortho_config(default = "nomad".to_owned())]
    pub nomad_bin: String,
    /// Allocation ID or unique ID prefix.
    pub allocation: String,
    /// Task to execute in; defaults to the allocation's only task.
    pub task: Option<String>,
    /// Scheduler API address passed as `-address`.
    pub address: Option<String>,
    /// Scheduler namespace passed as `-namespace`.
    pub namespace: Option<String>,
}

fn require_value(value: &str, field: &str, prefix: &str) -> Result<(), TransportError> {
    require_optional_value(Some(value), field, prefix)
}

fn require_optional_value(
    value: Option<&str>,
    field: &str,
    prefix: &str,
) -> Result<(), TransportError> {
    match value {
        None => Ok(()), // Not configured; the client uses its defaults
        Some(v) if !v.trim().is_empty() => Ok(()),
        Some(_) => Err(TransportError::InvalidConfig {
            field: field.to_owned(),
            env_var: format!("{prefix}_{}", field.to_uppercase()),
        }),
    }
}

macro_rules! layered_loaders {
    ($config:ty) => {
        impl $config {
            /// Loads configuration from defaults, configuration files, and
            /// environment variables without parsing CLI arguments.
            ///
            /// # Errors
            ///
            /// Returns [`ConfigError::Parse`] when merging sources fails.
            pub fn load_without_cli_args() -> Result<Self, ConfigError> {
                Self::load_from_iter([std::ffi::OsString::from("tether")])
                    .map_err(|err| ConfigError::Parse(err.to_string()))
            }
        }
    };
}

layered_loaders!(SshConfig);
layered_loaders!(PodConfig);
layered_loaders!(AllocationConfig);

impl SshConfig {
    /// Builds a configuration for `host` with every other field at its
    /// default.
    #[must_use]
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            host: host.into(),
            user: String::from("root"),
            port: 22,
            identity_file: None,
            batch_mode: None,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            connect_timeout_secs: 10,
        }
    }

    /// Reports whether `ssh` runs with `BatchMode=yes`; true unless batch
    /// mode was switched off explicitly.
    #[must_use]
    pub const fn uses_batch_mode(&self) -> bool {
        !matches!(self.batch_mode, Some(false))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] naming the first blank field.
    pub fn validate(&self) -> Result<(), TransportError> {
        const PREFIX: &str = "TETHER_SSH";
        require_value(&self.ssh_bin, "ssh_bin", PREFIX)?;
        require_value(&self.host, "host", PREFIX)?;
        require_value(&self.user, "user", PREFIX)?;
        require_optional_value(self.identity_file.as_deref(), "identity_file", PREFIX)?;
        if self.port == 0 {
            return Err(TransportError::InvalidConfig {
                field: String::from("port"),
                env_var: format!("{PREFIX}_PORT"),
            });
        }
        Ok(())
    }
}

impl PodConfig {
    /// Builds a configuration for `pod` in the default namespace.
    #[must_use]
    pub fn for_pod(pod: impl Into<String>) -> Self {
        Self {
            kubectl_bin: String::from("kubectl"),
            namespace: String::from("default"),
            pod: pod.into(),
            container: None,
            kube_context: None,
            kubeconfig: None,
        }
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] naming the first blank field.
    pub fn validate(&self) -> Result<(), TransportError> {
        const PREFIX: &str = "TETHER_POD";
        require_value(&self.kubectl_bin, "kubectl_bin", PREFIX)?;
        require_value(&self.namespace, "namespace", PREFIX)?;
        require_value(&self.pod, "pod", PREFIX)?;
        require_optional_value(self.container.as_deref(), "container", PREFIX)?;
        require_optional_value(self.kube_context.as_deref(), "kube_context", PREFIX)?;
        require_optional_value(self.kubeconfig.as_deref(), "kubeconfig", PREFIX)
    }
}

impl AllocationConfig {
    /// Builds a configuration for the allocation ID or prefix `allocation`.
    #[must_use]
    pub fn for_allocation(allocation: impl Into<String>) -> Self {
        Self {
            nomad_bin: String::from("nomad"),
            allocation: allocation.into(),
            task: None,
            address: None,
            namespace: None,
        }
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] naming the first blank field.
    pub fn validate(&self) -> Result<(), TransportError> {
        const PREFIX: &str = "TETHER_ALLOC";
        require_value(&self.nomad_bin, "nomad_bin", PREFIX)?;
        require_value(&self.allocation, "allocation", PREFIX)?;
        require_optional_value(self.task.as_deref(), "task", PREFIX)?;
        require_optional_value(self.address.as_deref(), "address", PREFIX)?;
        require_optional_value(self.namespace.as_deref(), "namespace", PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use rstest::rstest;

    #[rstest]
    fn ssh_defaults_validate() {
        assert!(SshConfig::for_host("example.org").validate().is_ok());
    }

    #[rstest]
    #[case::blank_host(
        SshConfig { host: String::from("  "), ..SshConfig::for_host("h") },
        "host",
        "TETHER_SSH_HOST"
    )]
    #[case::blank_user(
        SshConfig { user: String::new(), ..SshConfig::for_host("h") },
        "user",
        "TETHER_SSH_USER"
    )]
    #[case::blank_identity(
        SshConfig { identity_file: Some(String::from(" ")), ..SshConfig::for_host("h") },
        "identity_file",
        "TETHER_SSH_IDENTITY_FILE"
    )]
    #[case::zero_port(
        SshConfig { port: 0, ..SshConfig::for_host("h") },
        "port",
        "TETHER_SSH_PORT"
    )]
    fn ssh_validation_names_field_and_env_var(
        #[case] config: SshConfig,
        #[case] field: &str,
        #[case] env_var: &str,
    ) {
        let err = config.validate().expect_err("invalid config");
        assert!(
            matches!(
                &err,
                TransportError::InvalidConfig { field: f, env_var: e }
                    if f == field && e == env_var
            ),
            "unexpected error: {err:?}"
        );
        assert!(err.to_string().contains(env_var));
    }

    #[rstest]
    fn pod_validation_rejects_blank_pod() {
        let err = PodConfig::for_pod(" ").validate().expect_err("blank pod");
        assert_eq!(
            err.to_string(),
            "missing pod: set TETHER_POD_POD or add pod to tether.toml"
        );
    }

    #[rstest]
    fn pod_validation_rejects_blank_container() {
        let config = PodConfig {
            container: Some(String::new()),
            ..PodConfig::for_pod("web-0")
        };
        assert!(config.validate().is_err());
    }

    #[rstest]
    fn allocation_validation_rejects_blank_allocation() {
        let err = AllocationConfig::for_allocation("")
            .validate()
            .expect_err("blank allocation");
        assert!(err.to_string().contains("TETHER_ALLOC_ALLOCATION"));
    }

    #[rstest]
    fn allocation_defaults_validate() {
        assert!(AllocationConfig::for_allocation("9f3c").validate().is_ok());
    }

    #[tokio::test]
    async fn ssh_config_loads_from_environment() {
        let home = tempfile::tempdir().expect("temp home");
        let home_path = home.path().to_string_lossy().into_owned();
        let _guard = EnvGuard::set_vars(&[
            ("HOME", home_path.as_str()),
            ("TETHER_SSH_HOST", "10.0.0.5"),
            ("TETHER_SSH_PORT", "2222"),
            ("TETHER_SSH_USER", "deploy"),
        ])
        .await;

        let config = SshConfig::load_without_cli_args().expect("load ssh config");

        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 2222);
        assert_eq!(config.user, "deploy");
        assert_eq!(config.ssh_bin, "ssh");
        assert!(config.uses_batch_mode());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn pod_config_defaults_namespace() {
        let home = tempfile::tempdir().expect("temp home");
        let home_path = home.path().to_string_lossy().into_owned();
        let _guard = EnvGuard::set_vars(&[
            ("HOME", home_path.as_str()),
            ("TETHER_POD_POD", "web-0"),
            ("TETHER_POD_CONTAINER", "app"),
        ])
        .await;

        let config = PodConfig::load_without_cli_args().expect("load pod config");

        assert_eq!(config.pod, "web-0");
        assert_eq!(config.namespace, "default");
        assert_eq!(config.container.as_deref(), Some("app"));
        assert_eq!(config.kubectl_bin, "kubectl");
    }

    #[tokio::test]
    async fn loaded_ssh_defaults_match_for_host() {
        let home = tempfile::tempdir().expect("temp home");
        let home_path = home.path().to_string_lossy().into_owned();
        let _guard = EnvGuard::set_vars(&[
            ("HOME", home_path.as_str()),
            ("TETHER_SSH_HOST", "h"),
        ])
        .await;

        let config = SshConfig::load_without_cli_args().expect("load ssh config");

        assert_eq!(config, SshConfig::for_host("h"));
        assert!(config.uses_batch_mode());
    }

    #[tokio::test]
    async fn batch_mode_can_be_switched_off() {
        let home = tempfile::tempdir().expect("temp home");
        let home_path = home.path().to_string_lossy().into_owned();
        let _guard = EnvGuard::set_vars(&[
            ("HOME", home_path.as_str()),
            ("TETHER_SSH_HOST", "h"),
            ("TETHER_SSH_BATCH_MODE", "false"),
        ])
        .await;

        let config = SshConfig::load_without_cli_args().expect("load ssh config");

        assert_eq!(config.batch_mode, Some(false));
        assert!(!config.uses_batch_mode());
    }
}
