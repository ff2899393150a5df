//! Command-line interface definitions for the `skyforge` binary.
//!
//! This module centralises the clap parser structure so both the main binary
//! and the build script can reuse it when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `skyforge` binary.
#[derive(Debug, Parser)]
#[command(
    name = "skyforge",
    about = "Provision a throwaway cloud VM, run the build there, and bring the artifact home"
)]
pub(crate) struct Cli {
    /// Build profile selecting the artifact variant (for example `preview` or
    /// `production`).
    #[arg(value_name = "PROFILE", default_value = "preview")]
    pub(crate) profile: String,
    /// Directory of `KEY=VALUE` env files loaded before the run.
    ///
    /// Files are read in name-sorted order; variables already present in the
    /// process environment are never overridden.
    #[arg(long, value_name = "DIR")]
    pub(crate) env_dir: Option<String>,
    /// Override the server type for this run.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Override the boot image for this run.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Override the datacentre location for this run.
    #[arg(long, value_name = "LOCATION")]
    pub(crate) location: Option<String>,
}
