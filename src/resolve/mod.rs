//! Resolution of raw builder configuration into a validated [`ResolvedConfig`].
//!
//! Resolution is a pure function of the raw JSON input and a
//! [`ResolveContext`] snapshot (environment fallbacks, user variables, and the
//! build timestamp). Every discoverable problem is collected before
//! returning, so callers see all configuration errors at once.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

mod duration;
mod error;
mod interpolate;

pub use duration::{DurationError, parse_duration};
pub use error::{ConfigError, ConfigErrors};
pub use interpolate::{InterpolateError, interpolate};

/// Environment variable consulted when `api_key` is unset.
pub const API_KEY_ENV: &str = "SOFTLAYER_API_KEY";
/// Environment variable consulted when `username` is unset.
pub const USERNAME_ENV: &str = "SOFTLAYER_USER_NAME";

const DEFAULT_DATACENTER: &str = "ams01";
const DEFAULT_INSTANCE_DOMAIN: &str = "defaultdomain.com";
const DEFAULT_IMAGE_DESCRIPTION: &str = "Instance snapshot. Generated by kiln";
const DEFAULT_INSTANCE_CPU: u32 = 1;
const DEFAULT_INSTANCE_MEMORY: u64 = 1024;
const DEFAULT_NETWORK_SPEED: u32 = 10;
const DEFAULT_DISK_CAPACITY: u32 = 25;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SSH_USERNAME: &str = "root";
const DEFAULT_SSH_TIMEOUT: &str = "5m";
const DEFAULT_STATE_TIMEOUT: &str = "10m";
const FILTERED: &str = "<Filtered>";

/// Keys accepted in the raw configuration object.
pub const RECOGNISED_KEYS: [&str; 19] = [
    "api_key",
    "base_image_id",
    "base_os_code",
    "datacenter_name",
    "image_description",
    "image_name",
    "image_type",
    "instance_cpu",
    "instance_disk_capacity",
    "instance_domain",
    "instance_memory",
    "instance_name",
    "instance_network_speed",
    "instance_state_timeout",
    "ssh_port",
    "ssh_private_key_file",
    "ssh_timeout",
    "ssh_username",
    "username",
];

/// Kind of image produced by the capture step.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ImageType {
    /// Flex image, bootable on both virtual and bare metal servers.
    #[default]
    Flex,
    /// Standard archive image of the instance's disks.
    Standard,
}

impl ImageType {
    /// Returns the configuration spelling of the image type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flex => "flex",
            Self::Standard => "standard",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "flex" => Ok(Self::Flex),
            "standard" => Ok(Self::Standard),
            other => Err(ConfigError::UnknownImageType(other.to_owned())),
        }
    }
}

/// Source the build instance boots from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BaseImage {
    /// Global identifier of an existing image template.
    Image(String),
    /// Operating system reference code (for example `UBUNTU_LATEST`).
    OsCode(String),
}

impl BaseImage {
    /// Returns the image template identifier, if booting from one.
    #[must_use]
    pub fn image_id(&self) -> Option<&str> {
        match self {
            Self::Image(id) => Some(id),
            Self::OsCode(_) => None,
        }
    }

    /// Returns the operating system reference code, if booting from one.
    #[must_use]
    pub fn os_code(&self) -> Option<&str> {
        match self {
            Self::Image(_) => None,
            Self::OsCode(code) => Some(code),
        }
    }
}

/// Snapshot of everything resolution reads besides the raw input.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResolveContext {
    env: BTreeMap<String, String>,
    user_vars: BTreeMap<String, String>,
    timestamp: u64,
}

impl ResolveContext {
    /// Creates an empty context with the given build timestamp (Unix seconds).
    #[must_use]
    pub const fn new(timestamp: u64) -> Self {
        Self {
            env: BTreeMap::new(),
            user_vars: BTreeMap::new(),
            timestamp,
        }
    }

    /// Captures the credential fallbacks from the process environment and the
    /// current time.
    #[must_use]
    pub fn from_process_env() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        [API_KEY_ENV, USERNAME_ENV]
            .into_iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key, value)))
            .fold(Self::new(timestamp), |context, (key, value)| {
                context.with_env(key, value)
            })
    }

    /// Adds an environment entry to the snapshot.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds a user variable available to `{{user `name`}}`.
    #[must_use]
    pub fn with_user_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_vars.insert(name.into(), value.into());
        self
    }

    /// Adds several user variables at once.
    #[must_use]
    pub fn with_user_vars<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        vars.into_iter()
            .fold(self, |context, (name, value)| context.with_user_var(name, value))
    }

    /// Returns the build timestamp in Unix seconds.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Looks up a user variable.
    #[must_use]
    pub fn user_var(&self, name: &str) -> Option<&str> {
        self.user_vars.get(name).map(String::as_str)
    }

    fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

/// Fully validated builder configuration.
#[derive(Clone, Eq, PartialEq)]
pub struct ResolvedConfig {
    /// SoftLayer account user name.
    pub username: String,
    /// SoftLayer API key.
    pub api_key: String,
    /// Datacenter the instance is created in.
    pub datacenter_name: String,
    /// Name of the produced image.
    pub image_name: String,
    /// Description stored with the produced image.
    pub image_description: String,
    /// Kind of image produced.
    pub image_type: ImageType,
    /// Image or operating system the build instance boots from.
    pub base: BaseImage,
    /// Hostname of the build instance.
    pub instance_name: String,
    /// DNS domain of the build instance.
    pub instance_domain: String,
    /// Number of CPUs of the build instance.
    pub instance_cpu: u32,
    /// Memory of the build instance in megabytes.
    pub instance_memory: u64,
    /// Network port speed of the build instance in Mbps.
    pub instance_network_speed: u32,
    /// Boot disk capacity of the build instance in gigabytes.
    pub instance_disk_capacity: u32,
    /// SSH port on the build instance.
    pub ssh_port: u16,
    /// SSH user on the build instance.
    pub ssh_username: String,
    /// Private key used for SSH; a temporary key is generated when unset.
    pub ssh_private_key_file: Option<Utf8PathBuf>,
    /// Upper bound on waiting for SSH to become available.
    pub ssh_timeout: Duration,
    /// Upper bound on waiting for instance state transitions.
    pub state_timeout: Duration,
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ResolvedConfig")
            .field("username", &FILTERED)
            .field("api_key", &FILTERED)
            .field("datacenter_name", &self.datacenter_name)
            .field("image_name", &self.image_name)
            .field("image_description", &self.image_description)
            .field("image_type", &self.image_type)
            .field("base", &self.base)
            .field("instance_name", &self.instance_name)
            .field("instance_domain", &self.instance_domain)
            .field("instance_cpu", &self.instance_cpu)
            .field("instance_memory", &self.instance_memory)
            .field("instance_network_speed", &self.instance_network_speed)
            .field("instance_disk_capacity", &self.instance_disk_capacity)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_username", &self.ssh_username)
            .field("ssh_private_key_file", &self.ssh_private_key_file)
            .field("ssh_timeout", &self.ssh_timeout)
            .field("state_timeout", &self.state_timeout)
            .finish()
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    username: String,
    api_key: String,
    datacenter_name: String,
    image_name: String,
    image_description: String,
    image_type: String,
    base_image_id: String,
    base_os_code: String,
    instance_name: String,
    instance_domain: String,
    instance_cpu: u32,
    instance_memory: u64,
    instance_network_speed: u32,
    instance_disk_capacity: u32,
    ssh_port: u16,
    ssh_username: String,
    ssh_private_key_file: String,
    ssh_timeout: String,
    instance_state_timeout: String,
}

impl RawConfig {
    fn decode(raw: &Value, errors: &mut Vec<ConfigError>) -> Option<Self> {
        let Some(object) = raw.as_object() else {
            errors.push(ConfigError::Decode(format!(
                "expected a configuration object, found {}",
                json_kind(raw)
            )));
            return None;
        };

        let mut recognised = Map::new();
        for (key, value) in object {
            if RECOGNISED_KEYS.contains(&key.as_str()) {
                recognised.insert(key.clone(), value.clone());
            } else {
                errors.push(ConfigError::UnknownField(key.clone()));
            }
        }

        match serde_json::from_value(Value::Object(recognised)) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                errors.push(ConfigError::Decode(err.to_string()));
                None
            }
        }
    }

    fn apply_defaults(&mut self, context: &ResolveContext) {
        default_string(&mut self.api_key, || {
            context.env_var(API_KEY_ENV).unwrap_or_default().to_owned()
        });
        default_string(&mut self.username, || {
            context.env_var(USERNAME_ENV).unwrap_or_default().to_owned()
        });
        default_string(&mut self.datacenter_name, || DEFAULT_DATACENTER.to_owned());
        default_string(&mut self.instance_name, || {
            format!("kiln-{}", context.timestamp())
        });
        default_string(&mut self.instance_domain, || {
            DEFAULT_INSTANCE_DOMAIN.to_owned()
        });
        default_string(&mut self.image_description, || {
            DEFAULT_IMAGE_DESCRIPTION.to_owned()
        });
        default_string(&mut self.image_type, || ImageType::Flex.as_str().to_owned());
        default_string(&mut self.ssh_username, || DEFAULT_SSH_USERNAME.to_owned());
        default_string(&mut self.ssh_timeout, || DEFAULT_SSH_TIMEOUT.to_owned());
        default_string(&mut self.instance_state_timeout, || {
            DEFAULT_STATE_TIMEOUT.to_owned()
        });

        if self.instance_cpu == 0 {
            self.instance_cpu = DEFAULT_INSTANCE_CPU;
        }
        if self.instance_memory == 0 {
            self.instance_memory = DEFAULT_INSTANCE_MEMORY;
        }
        if self.instance_network_speed == 0 {
            self.instance_network_speed = DEFAULT_NETWORK_SPEED;
        }
        if self.instance_disk_capacity == 0 {
            self.instance_disk_capacity = DEFAULT_DISK_CAPACITY;
        }
        if self.ssh_port == 0 {
            self.ssh_port = DEFAULT_SSH_PORT;
        }
    }

    fn interpolate_fields(&mut self, context: &ResolveContext, errors: &mut Vec<ConfigError>) {
        let fields: [(&'static str, &mut String); 14] = [
            ("api_key", &mut self.api_key),
            ("base_image_id", &mut self.base_image_id),
            ("base_os_code", &mut self.base_os_code),
            ("datacenter_name", &mut self.datacenter_name),
            ("image_description", &mut self.image_description),
            ("image_name", &mut self.image_name),
            ("image_type", &mut self.image_type),
            ("instance_domain", &mut self.instance_domain),
            ("instance_name", &mut self.instance_name),
            ("instance_state_timeout", &mut self.instance_state_timeout),
            ("ssh_private_key_file", &mut self.ssh_private_key_file),
            ("ssh_timeout", &mut self.ssh_timeout),
            ("ssh_username", &mut self.ssh_username),
            ("username", &mut self.username),
        ];

        for (field, value) in fields {
            match interpolate(value, context) {
                Ok(expanded) => *value = expanded,
                Err(source) => errors.push(ConfigError::Template { field, source }),
            }
        }
    }

    fn validate_base(&self, errors: &mut Vec<ConfigError>) -> Option<BaseImage> {
        if !self.base_image_id.is_empty() && self.ssh_private_key_file.is_empty() {
            errors.push(ConfigError::PrivateKeyRequired);
        }

        match (self.base_image_id.is_empty(), self.base_os_code.is_empty()) {
            (false, true) => Some(BaseImage::Image(self.base_image_id.clone())),
            (true, false) => Some(BaseImage::OsCode(self.base_os_code.clone())),
            (true, true) => {
                errors.push(ConfigError::BaseImageMissing);
                None
            }
            (false, false) => {
                errors.push(ConfigError::BaseImageConflict);
                None
            }
        }
    }

}

impl fmt::Debug for RawConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RawConfig")
            .field("username", &FILTERED)
            .field("api_key", &FILTERED)
            .field("datacenter_name", &self.datacenter_name)
            .field("image_name", &self.image_name)
            .field("image_description", &self.image_description)
            .field("image_type", &self.image_type)
            .field("base_image_id", &self.base_image_id)
            .field("base_os_code", &self.base_os_code)
            .field("instance_name", &self.instance_name)
            .field("instance_domain", &self.instance_domain)
            .field("instance_cpu", &self.instance_cpu)
            .field("instance_memory", &self.instance_memory)
            .field("instance_network_speed", &self.instance_network_speed)
            .field("instance_disk_capacity", &self.instance_disk_capacity)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_username", &self.ssh_username)
            .field("ssh_private_key_file", &self.ssh_private_key_file)
            .field("ssh_timeout", &self.ssh_timeout)
            .field("instance_state_timeout", &self.instance_state_timeout)
            .finish()
    }
}

impl ResolvedConfig {
    /// Resolves raw builder configuration.
    ///
    /// Defaults are applied before template expansion; credentials fall back
    /// to [`API_KEY_ENV`] and [`USERNAME_ENV`] from the context. The
    /// configuration, with credentials filtered, is logged at debug level.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigErrors`] carrying every problem found: unknown keys,
    /// decode failures, template failures, missing or conflicting fields, and
    /// malformed timeouts.
    pub fn resolve(raw: &Value, context: &ResolveContext) -> Result<Self, ConfigErrors> {
        let mut errors = Vec::new();
        let Some(mut raw_config) = RawConfig::decode(raw, &mut errors) else {
            return Err(ConfigErrors::new(errors));
        };

        raw_config.apply_defaults(context);
        raw_config.interpolate_fields(context, &mut errors);

        if raw_config.api_key.is_empty() {
            errors.push(ConfigError::MissingCredential {
                field: "api_key",
                env_var: API_KEY_ENV,
            });
        }
        if raw_config.username.is_empty() {
            errors.push(ConfigError::MissingCredential {
                field: "username",
                env_var: USERNAME_ENV,
            });
        }
        if raw_config.image_name.is_empty() {
            errors.push(ConfigError::MissingField("image_name"));
        }

        let image_type = raw_config
            .image_type
            .parse::<ImageType>()
            .map_err(|err| errors.push(err))
            .ok();
        let base = raw_config.validate_base(&mut errors);
        let ssh_timeout = parse_timeout("ssh_timeout", &raw_config.ssh_timeout, &mut errors);
        let state_timeout = parse_timeout(
            "instance_state_timeout",
            &raw_config.instance_state_timeout,
            &mut errors,
        );

        debug!(config = ?raw_config, "builder configuration");

        match (image_type, base, ssh_timeout, state_timeout) {
            (Some(image_type), Some(base), Some(ssh_timeout), Some(state_timeout))
                if errors.is_empty() =>
            {
                Ok(raw_config.into_resolved(image_type, base, ssh_timeout, state_timeout))
            }
            _ => Err(ConfigErrors::new(errors)),
        }
    }
}

impl RawConfig {
    fn into_resolved(
        self,
        image_type: ImageType,
        base: BaseImage,
        ssh_timeout: Duration,
        state_timeout: Duration,
    ) -> ResolvedConfig {
        let ssh_private_key_file = Some(self.ssh_private_key_file)
            .filter(|path| !path.is_empty())
            .map(Utf8PathBuf::from);
        ResolvedConfig {
            username: self.username,
            api_key: self.api_key,
            datacenter_name: self.datacenter_name,
            image_name: self.image_name,
            image_description: self.image_description,
            image_type,
            base,
            instance_name: self.instance_name,
            instance_domain: self.instance_domain,
            instance_cpu: self.instance_cpu,
            instance_memory: self.instance_memory,
            instance_network_speed: self.instance_network_speed,
            instance_disk_capacity: self.instance_disk_capacity,
            ssh_port: self.ssh_port,
            ssh_username: self.ssh_username,
            ssh_private_key_file,
            ssh_timeout,
            state_timeout,
        }
    }
}

fn default_string(value: &mut String, fallback: impl FnOnce() -> String) {
    if value.is_empty() {
        *value = fallback();
    }
}

fn parse_timeout(
    field: &'static str,
    raw: &str,
    errors: &mut Vec<ConfigError>,
) -> Option<Duration> {
    parse_duration(raw)
        .map_err(|source| errors.push(ConfigError::Duration { field, source }))
        .ok()
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
