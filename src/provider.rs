//! Provider abstraction for provisioning instances and capturing images.

use std::fmt::Debug;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

use crate::resolve::{BaseImage, ImageType, ResolvedConfig};

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Hostname assigned to the instance.
    pub hostname: String,
    /// DNS domain assigned to the instance.
    pub domain: String,
    /// Datacenter short name (for example `ams01`).
    pub datacenter: String,
    /// Number of virtual CPUs.
    pub cpus: u32,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Maximum network port speed in Mbps.
    pub network_speed: u32,
    /// Boot disk capacity in gigabytes. Ignored when booting from an image.
    pub disk_capacity_gb: u32,
    /// Image or operating system the instance boots from.
    pub boot: BaseImage,
    /// Provider SSH key identifiers injected into the instance.
    pub ssh_key_ids: Vec<i64>,
}

impl InstanceRequest {
    /// Builds a request from resolved configuration and the SSH keys that
    /// should be authorised on the instance.
    #[must_use]
    pub fn from_config(config: &ResolvedConfig, ssh_key_ids: Vec<i64>) -> Self {
        Self {
            hostname: config.instance_name.clone(),
            domain: config.instance_domain.clone(),
            datacenter: config.datacenter_name.clone(),
            cpus: config.instance_cpu,
            memory_mb: config.instance_memory,
            network_speed: config.instance_network_speed,
            disk_capacity_gb: config.instance_disk_capacity,
            boot: config.base.clone(),
            ssh_key_ids,
        }
    }
}

/// Handle returned by a provider once an instance has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: i64,
    /// Datacenter in which the instance was created.
    pub datacenter: String,
}

/// Point-in-time view of an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceStatus {
    /// Power state key reported by the provider (for example `RUNNING`).
    pub power_state: Option<String>,
    /// Number of provider transactions still running against the instance.
    pub active_transactions: u32,
    /// Primary public address, once assigned.
    pub primary_ip: Option<String>,
}

impl InstanceStatus {
    /// Returns `true` when the instance is powered on.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.power_state
            .as_deref()
            .is_some_and(|state| state.eq_ignore_ascii_case("running"))
    }

    /// Returns `true` when no provider transaction is in flight.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.active_transactions == 0
    }

    /// Returns the parsed public address when the instance is running,
    /// idle, and addressed.
    #[must_use]
    pub fn ready_address(&self) -> Option<IpAddr> {
        if !self.is_running() || !self.is_idle() {
            return None;
        }
        self.primary_ip
            .as_deref()
            .and_then(|ip| ip.trim().parse().ok())
    }
}

/// Connection details for reaching an instance once it is ready.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceNetworking {
    /// Public address assigned by the provider.
    pub public_ip: IpAddr,
    /// TCP port for SSH.
    pub ssh_port: u16,
}

/// Parameters for capturing an instance into a reusable image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageCapture {
    /// Name of the resulting image template.
    pub name: String,
    /// Free-form description stored with the image.
    pub description: String,
    /// Kind of image to produce.
    pub image_type: ImageType,
}

impl ImageCapture {
    /// Builds capture parameters from resolved configuration.
    #[must_use]
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            name: config.image_name.clone(),
            description: config.image_description.clone(),
            image_type: config.image_type,
        }
    }
}

/// Errors raised by providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the client cannot be constructed.
    #[error("client configuration error: {0}")]
    Config(String),
    /// Raised when the HTTP exchange itself fails.
    #[error("transport error: {message}")]
    Transport {
        /// Message returned by the HTTP client.
        message: String,
    },
    /// Raised when the API rejects a request.
    #[error("API returned status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider error code, when supplied.
        code: Option<String>,
        /// Provider error message.
        message: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("failed to decode {what}: {message}")]
    Decode {
        /// Payload being decoded.
        what: String,
        /// Decoder error message.
        message: String,
    },
    /// Raised when an identifier is not in the provider's format.
    #[error("invalid identifier '{value}'")]
    InvalidIdentifier {
        /// Identifier that failed to parse.
        value: String,
    },
}

impl From<reqwest::Error> for ProviderError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Operations the build steps and the artifact need from a cloud provider.
pub trait Provider: Debug + Send + Sync {
    /// Uploads a public key and returns its provider identifier.
    fn create_ssh_key<'a>(
        &'a self,
        label: &'a str,
        public_key: &'a str,
    ) -> ProviderFuture<'a, i64>;

    /// Deletes a previously uploaded key.
    fn delete_ssh_key(&self, key_id: i64) -> ProviderFuture<'_, ()>;

    /// Orders a new instance.
    fn create_instance<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, InstanceHandle>;

    /// Reads the current status of an instance.
    fn instance_status<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> ProviderFuture<'a, InstanceStatus>;

    /// Starts capturing the instance's disks into an image.
    fn capture_image<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        capture: &'a ImageCapture,
    ) -> ProviderFuture<'a, ()>;

    /// Looks up an image by name, returning its identifier.
    fn find_image<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<String>>;

    /// Cancels an instance.
    fn delete_instance<'a>(&'a self, handle: &'a InstanceHandle) -> ProviderFuture<'a, ()>;

    /// Deletes an image.
    fn delete_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ()>;
}
