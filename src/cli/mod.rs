//! Command-line interface definitions for the `kiln` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `kiln` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Build SoftLayer virtual server images from a JSON template",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create an instance, provision it, and capture it as an image.
    #[command(
        name = "build",
        about = "Create an instance, provision it, and capture it as an image"
    )]
    Build(TemplateArgs),
    /// Check a template and its builder configuration without building.
    #[command(
        name = "validate",
        about = "Check a template and its builder configuration without building"
    )]
    Validate(TemplateArgs),
}

/// Arguments shared by the `build` and `validate` subcommands.
#[derive(Debug, Parser)]
pub(crate) struct TemplateArgs {
    /// Set a template variable, overriding its default. May be repeated.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub(crate) vars: Vec<String>,
    /// Path to the JSON build template.
    #[arg(value_name = "TEMPLATE")]
    pub(crate) template: String,
}
