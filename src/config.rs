//! Tool settings loaded via `ortho-config`.
//!
//! [`ClientSettings`] covers how kiln talks to the outside world (API endpoint,
//! HTTP timeout, polling cadence, and the SSH tooling on the host). What to
//! build comes from the template file and is resolved separately by
//! [`crate::resolve`].

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default SoftLayer REST endpoint.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.softlayer.com/rest/v3";

/// Host-side settings for API access and SSH tooling.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct ClientSettings {
    /// Base URL of the SoftLayer REST API.
    #[ortho_config(default = DEFAULT_API_ENDPOINT.to_owned())]
    pub api_endpoint: String,
    /// Per-request HTTP timeout in seconds.
    #[ortho_config(default = 30)]
    pub http_timeout_secs: u64,
    /// Delay between instance status polls in seconds.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// Known hosts file override; defaults to `/dev/null` for throwaway
    /// build instances.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_ENDPOINT.to_owned(),
            http_timeout_secs: 30,
            poll_interval_secs: 5,
            ssh_bin: String::from("ssh"),
            ssh_keygen_bin: String::from("ssh-keygen"),
            ssh_known_hosts_file: String::from("/dev/null"),
        }
    }
}

/// Errors raised while loading or validating [`ClientSettings`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Raised when a field is empty or zero.
    #[error("missing {field}: set KILN_{env_suffix} or add {field} to kiln.toml", env_suffix = field.to_uppercase())]
    InvalidField {
        /// Field that failed validation.
        field: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("settings parsing failed: {0}")]
    Parse(String),
}

impl ClientSettings {
    /// Loads settings from defaults, configuration files, and environment
    /// variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails, or
    /// [`SettingsError::InvalidField`] when validation fails.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        let settings = Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| SettingsError::Parse(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Ensures string fields are non-blank and intervals are non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidField`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        Self::require_value(&self.api_endpoint, "api_endpoint")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.ssh_keygen_bin, "ssh_keygen_bin")?;
        Self::require_value(&self.ssh_known_hosts_file, "ssh_known_hosts_file")?;
        Self::require_positive(self.http_timeout_secs, "http_timeout_secs")?;
        Self::require_positive(self.poll_interval_secs, "poll_interval_secs")?;
        Ok(())
    }

    /// Returns the HTTP timeout as a [`Duration`].
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Returns the status poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn require_value(value: &str, field: &str) -> Result<(), SettingsError> {
        if value.trim().is_empty() {
            return Err(SettingsError::InvalidField {
                field: field.to_owned(),
            });
        }
        Ok(())
    }

    fn require_positive(value: u64, field: &str) -> Result<(), SettingsError> {
        if value == 0 {
            return Err(SettingsError::InvalidField {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}
