//! Build template files.
//!
//! A template is a JSON document with three sections:
//!
//! ```json
//! {
//!   "variables": {"image": "web-base", "api_key": null},
//!   "builders": [{"type": "softlayer", "image_name": "{{user `image`}}"}],
//!   "provisioners": [{"type": "shell", "inline": ["apt-get update"]}]
//! }
//! ```
//!
//! Exactly one builder of type `softlayer` is accepted; its `type` and
//! `name` keys are stripped and the rest is handed to
//! [`ResolvedConfig::resolve`]. A variable declared `null` must be supplied
//! with `--var`.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::hook::{ProvisionHook, ShellProvisioner};
use crate::local_fs;
use crate::resolve::{
    ConfigErrors, InterpolateError, ResolveContext, ResolvedConfig, interpolate,
};

/// Builder type handled by this tool.
pub const BUILDER_TYPE: &str = "softlayer";

/// Provisioner type handled by this tool.
pub const PROVISIONER_TYPE: &str = "shell";

/// Errors raised while loading a template or preparing its variables.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TemplateFileError {
    /// Raised when the template file cannot be read.
    #[error("failed to read template {path}: {message}")]
    Read {
        /// Template path.
        path: Utf8PathBuf,
        /// I/O error message.
        message: String,
    },
    /// Raised when the template is not valid JSON of the expected shape.
    #[error("failed to parse template: {0}")]
    Parse(String),
    /// Raised when a builder or provisioner has no string `type`.
    #[error("{section} entry {index} has no type")]
    MissingType {
        /// Section holding the entry.
        section: &'static str,
        /// Zero-based position in the section.
        index: usize,
    },
    /// Raised for builder types other than `softlayer`.
    #[error("unsupported builder type '{0}'")]
    UnsupportedBuilder(String),
    /// Raised when the template does not hold exactly one builder.
    #[error("expected exactly one softlayer builder, found {0}")]
    BuilderCount(usize),
    /// Raised for provisioner types other than `shell`.
    #[error("unsupported provisioner type '{0}'")]
    UnsupportedProvisioner(String),
    /// Raised when a shell provisioner has unknown or mistyped keys.
    #[error("provisioner {index} is invalid: {message}")]
    Provisioner {
        /// Zero-based position in the section.
        index: usize,
        /// Decoder error message.
        message: String,
    },
    /// Raised when a provisioner string fails to interpolate.
    #[error("provisioner {index}: {source}")]
    ProvisionerTemplate {
        /// Zero-based position in the section.
        index: usize,
        /// Interpolation failure.
        #[source]
        source: InterpolateError,
    },
    /// Raised when a `--var` argument is not `KEY=VALUE`.
    #[error("invalid variable '{0}': expected KEY=VALUE")]
    InvalidOverride(String),
    /// Raised when a `--var` names a variable the template does not declare.
    #[error("variable '{0}' is not declared in the template")]
    UndeclaredVariable(String),
    /// Raised when a variable declared without a default is not supplied.
    #[error("required variable '{0}' was not set")]
    MissingVariable(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTemplate {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, Option<String>>,
    #[serde(default)]
    builders: Vec<Map<String, Value>>,
    #[serde(default)]
    provisioners: Vec<Map<String, Value>>,
}

/// Parsed and shape-checked template.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    description: Option<String>,
    variables: BTreeMap<String, Option<String>>,
    builder: Value,
    provisioners: Vec<ShellProvisioner>,
}

impl Template {
    /// Reads and parses the template at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateFileError::Read`] when the file cannot be read and
    /// every error of [`Template::parse`].
    pub fn load(path: &Utf8Path) -> Result<Self, TemplateFileError> {
        let source = local_fs::read_to_string(path).map_err(|err| TemplateFileError::Read {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::parse(&source)
    }

    /// Parses template JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateFileError`] describing the first shape problem.
    pub fn parse(source: &str) -> Result<Self, TemplateFileError> {
        let raw: RawTemplate =
            serde_json::from_str(source).map_err(|err| TemplateFileError::Parse(err.to_string()))?;

        let mut builders = Vec::new();
        for (index, mut builder) in raw.builders.into_iter().enumerate() {
            let kind = take_type(&mut builder, "builder", index)?;
            if kind != BUILDER_TYPE {
                return Err(TemplateFileError::UnsupportedBuilder(kind));
            }
            builder.remove("name");
            builders.push(Value::Object(builder));
        }
        let count = builders.len();
        let builder = match builders.pop() {
            Some(builder) if count == 1 => builder,
            _ => return Err(TemplateFileError::BuilderCount(count)),
        };

        let provisioners = raw
            .provisioners
            .into_iter()
            .enumerate()
            .map(|(index, mut entry)| {
                let kind = take_type(&mut entry, "provisioner", index)?;
                if kind != PROVISIONER_TYPE {
                    return Err(TemplateFileError::UnsupportedProvisioner(kind));
                }
                serde_json::from_value(Value::Object(entry)).map_err(|err| {
                    TemplateFileError::Provisioner {
                        index,
                        message: err.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<ShellProvisioner>, _>>()?;

        Ok(Self {
            description: raw.description,
            variables: raw.variables,
            builder,
            provisioners,
        })
    }

    /// Returns the template description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the builder section with `type` and `name` removed.
    #[must_use]
    pub const fn builder(&self) -> &Value {
        &self.builder
    }

    /// Returns the shell provisioners in order.
    #[must_use]
    pub fn provisioners(&self) -> &[ShellProvisioner] {
        &self.provisioners
    }

    /// Computes user variables: declared defaults overlaid with `overrides`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateFileError::UndeclaredVariable`] for overrides the
    /// template does not declare and [`TemplateFileError::MissingVariable`]
    /// for required variables left unset.
    pub fn user_variables(
        &self,
        overrides: &[(String, String)],
    ) -> Result<BTreeMap<String, String>, TemplateFileError> {
        let mut values: BTreeMap<String, Option<String>> = self.variables.clone();
        for (name, value) in overrides {
            let slot = values
                .get_mut(name)
                .ok_or_else(|| TemplateFileError::UndeclaredVariable(name.clone()))?;
            *slot = Some(value.clone());
        }

        values
            .into_iter()
            .map(|(name, value)| match value {
                Some(value) => Ok((name, value)),
                None => Err(TemplateFileError::MissingVariable(name)),
            })
            .collect()
    }

    /// Resolves the builder section against `context`.
    ///
    /// # Errors
    ///
    /// Returns every configuration problem found.
    pub fn resolve(&self, context: &ResolveContext) -> Result<ResolvedConfig, ConfigErrors> {
        ResolvedConfig::resolve(&self.builder, context)
    }

    /// Builds the provisioning hook, interpolating every inline command and
    /// environment entry against `context`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateFileError::ProvisionerTemplate`] for the first
    /// string that fails to interpolate.
    pub fn provision_hook(
        &self,
        context: &ResolveContext,
    ) -> Result<ProvisionHook, TemplateFileError> {
        let provisioners = self
            .provisioners
            .iter()
            .enumerate()
            .map(|(index, provisioner)| {
                let expand = |values: &[String]| {
                    values
                        .iter()
                        .map(|value| interpolate(value, context))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|source| TemplateFileError::ProvisionerTemplate { index, source })
                };
                Ok(ShellProvisioner {
                    inline: expand(&provisioner.inline)?,
                    environment_vars: expand(&provisioner.environment_vars)?,
                })
            })
            .collect::<Result<Vec<_>, TemplateFileError>>()?;
        Ok(ProvisionHook::new(provisioners))
    }
}

fn take_type(
    entry: &mut Map<String, Value>,
    section: &'static str,
    index: usize,
) -> Result<String, TemplateFileError> {
    match entry.remove("type") {
        Some(Value::String(kind)) => Ok(kind),
        _ => Err(TemplateFileError::MissingType { section, index }),
    }
}

/// Splits a `--var KEY=VALUE` argument.
///
/// # Errors
///
/// Returns [`TemplateFileError::InvalidOverride`] when there is no `=` or the
/// key is empty.
pub fn parse_override(argument: &str) -> Result<(String, String), TemplateFileError> {
    argument
        .split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_owned(), value.to_owned()))
        .ok_or_else(|| TemplateFileError::InvalidOverride(argument.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    const TEMPLATE: &str = r#"{
        "description": "web base image",
        "variables": {"image": "web-base", "region": null},
        "builders": [{
            "type": "softlayer",
            "name": "primary",
            "image_name": "{{user `image`}}",
            "datacenter_name": "{{user `region`}}",
            "base_os_code": "UBUNTU_LATEST"
        }],
        "provisioners": [{
            "type": "shell",
            "environment_vars": ["IMAGE={{user `image`}}"],
            "inline": ["echo building {{user `image`}}"]
        }]
    }"#;

    fn template() -> Template {
        Template::parse(TEMPLATE).expect("template should parse")
    }

    #[test]
    fn strips_builder_type_and_name() {
        let template = template();

        assert_eq!(template.description(), Some("web base image"));
        assert_eq!(
            template.builder(),
            &json!({
                "image_name": "{{user `image`}}",
                "datacenter_name": "{{user `region`}}",
                "base_os_code": "UBUNTU_LATEST"
            })
        );
        assert_eq!(template.provisioners().len(), 1);
    }

    #[rstest]
    #[case(r#"{"builders": []}"#, TemplateFileError::BuilderCount(0))]
    #[case(
        r#"{"builders": [{"type": "softlayer"}, {"type": "softlayer"}]}"#,
        TemplateFileError::BuilderCount(2)
    )]
    #[case(
        r#"{"builders": [{"type": "amazon-ebs"}]}"#,
        TemplateFileError::UnsupportedBuilder(String::from("amazon-ebs"))
    )]
    #[case(
        r#"{"builders": [{"name": "x"}]}"#,
        TemplateFileError::MissingType { section: "builder", index: 0 }
    )]
    #[case(
        r#"{"builders": [{"type": "softlayer"}], "provisioners": [{"type": "file"}]}"#,
        TemplateFileError::UnsupportedProvisioner(String::from("file"))
    )]
    fn rejects_unsupported_shapes(#[case] source: &str, #[case] expected: TemplateFileError) {
        assert_eq!(Template::parse(source), Err(expected));
    }

    #[test]
    fn rejects_unknown_top_level_keys_and_provisioner_keys() {
        assert!(matches!(
            Template::parse(r#"{"builders": [{"type": "softlayer"}], "post-processors": []}"#),
            Err(TemplateFileError::Parse(_))
        ));
        assert!(matches!(
            Template::parse(
                r#"{"builders": [{"type": "softlayer"}],
                    "provisioners": [{"type": "shell", "script": "x.sh"}]}"#
            ),
            Err(TemplateFileError::Provisioner { index: 0, .. })
        ));
    }

    #[test]
    fn overrides_fill_declared_variables() {
        let template = template();
        let overrides = vec![
            (String::from("region"), String::from("dal05")),
            (String::from("image"), String::from("api-base")),
        ];

        let variables = template.user_variables(&overrides).expect("variables");

        assert_eq!(variables.get("image").map(String::as_str), Some("api-base"));
        assert_eq!(variables.get("region").map(String::as_str), Some("dal05"));
    }

    #[rstest]
    #[case(Vec::new(), TemplateFileError::MissingVariable(String::from("region")))]
    #[case(
        vec![(String::from("zone"), String::from("x"))],
        TemplateFileError::UndeclaredVariable(String::from("zone"))
    )]
    fn variable_problems_are_reported(
        #[case] overrides: Vec<(String, String)>,
        #[case] expected: TemplateFileError,
    ) {
        assert_eq!(template().user_variables(&overrides), Err(expected));
    }

    #[test]
    fn resolves_builder_and_provisioners_with_user_variables() {
        let template = template();
        let variables = template
            .user_variables(&[(String::from("region"), String::from("dal05"))])
            .expect("variables");
        let context = ResolveContext::new(1_700_000_000)
            .with_env("SOFTLAYER_USER_NAME", "alice")
            .with_env("SOFTLAYER_API_KEY", "key")
            .with_user_vars(variables);

        let config = template.resolve(&context).expect("config should resolve");
        let hook = template.provision_hook(&context).expect("hook should build");

        assert_eq!(config.image_name, "web-base");
        assert_eq!(config.datacenter_name, "dal05");
        assert_eq!(
            hook,
            ProvisionHook::new(vec![ShellProvisioner {
                inline: vec![String::from("echo building web-base")],
                environment_vars: vec![String::from("IMAGE=web-base")],
            }])
        );
    }

    #[test]
    fn provisioner_interpolation_errors_name_the_entry() {
        let template = template();

        let err = template
            .provision_hook(&ResolveContext::new(0))
            .expect_err("undefined variable should fail");

        assert_eq!(
            err,
            TemplateFileError::ProvisionerTemplate {
                index: 0,
                source: InterpolateError::UndefinedVariable(String::from("image")),
            }
        );
    }

    #[rstest]
    #[case("image=web", Ok((String::from("image"), String::from("web"))))]
    #[case("url=http://x?a=b", Ok((String::from("url"), String::from("http://x?a=b"))))]
    #[case("empty=", Ok((String::from("empty"), String::new())))]
    #[case("novalue", Err(TemplateFileError::InvalidOverride(String::from("novalue"))))]
    #[case("=value", Err(TemplateFileError::InvalidOverride(String::from("=value"))))]
    fn parses_overrides(
        #[case] argument: &str,
        #[case] expected: Result<(String, String), TemplateFileError>,
    ) {
        assert_eq!(parse_override(argument), expected);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Template::load(Utf8Path::new("/nonexistent/kiln/template.json"))
            .expect_err("missing file should fail");
        assert!(matches!(err, TemplateFileError::Read { .. }));
    }
}
