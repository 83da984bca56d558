//! Error types for configuration resolution.

use std::fmt;

use thiserror::Error;

use super::{DurationError, InterpolateError};

/// A single problem found while resolving builder configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the raw input cannot be decoded into typed fields.
    #[error("failed to decode configuration: {0}")]
    Decode(String),
    /// Raised for every key outside the recognised set.
    #[error("unknown configuration key: '{0}'")]
    UnknownField(String),
    /// Raised when a template action in a string field fails to expand.
    #[error("Error processing {field}: {source}")]
    Template {
        /// Configuration key being expanded.
        field: &'static str,
        /// Expansion failure.
        source: InterpolateError,
    },
    /// Raised when a credential is neither configured nor in the environment.
    #[error("{field} or the {env_var} environment variable must be specified")]
    MissingCredential {
        /// Configuration key of the credential.
        field: &'static str,
        /// Environment variable consulted as a fallback.
        env_var: &'static str,
    },
    /// Raised when a required field is empty.
    #[error("{0} must be specified")]
    MissingField(&'static str),
    /// Raised when `image_type` is outside the closed set.
    #[error("Unknown image_type '{0}'. Must be one of 'flex' (the default) or 'standard'.")]
    UnknownImageType(String),
    /// Raised when neither base image source is configured.
    #[error("please specify base_image_id or base_os_code")]
    BaseImageMissing,
    /// Raised when both base image sources are configured.
    #[error("please specify only one of base_image_id or base_os_code")]
    BaseImageConflict,
    /// Raised when booting from an image template without a private key.
    #[error(
        "when using base_image_id, you must specify ssh_private_key_file since automatic ssh \
         key config for custom images isn't supported by SoftLayer API"
    )]
    PrivateKeyRequired,
    /// Raised when a timeout field is not a valid duration.
    #[error("Failed parsing {field}: {source}")]
    Duration {
        /// Configuration key of the timeout.
        field: &'static str,
        /// Parse failure.
        source: DurationError,
    },
}

/// Every problem found during one resolution, in discovery order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigErrors {
    errors: Vec<ConfigError>,
}

impl ConfigErrors {
    pub(super) const fn new(errors: Vec<ConfigError>) -> Self {
        Self { errors }
    }

    /// Returns the individual errors.
    #[must_use]
    pub fn errors(&self) -> &[ConfigError] {
        &self.errors
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `true` when no error was recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Consumes the collection, returning the individual errors.
    #[must_use]
    pub fn into_inner(self) -> Vec<ConfigError> {
        self.errors
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(formatter, "{} error(s) occurred:", self.errors.len())?;
        for error in &self.errors {
            write!(formatter, "\n* {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}
