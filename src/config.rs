//! Application configuration
//!
//! CLI-first: the pipeline settings come straight from the parsed
//! command line. Multi-module runs are described in a TOML document
//! with one `[[module]]` table per module instance.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::cli::Cli;
use crate::error::{GrabError, Result};
use crate::modules::{BannerFlags, RdpFlags, TelnetFlags};
use crate::pipeline::PipelineConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub senders: usize,
    pub nmap_matchers: usize,
    pub connections_per_host: u32,
    pub continue_on_error: bool,
    pub break_on_success: bool,
    pub input_file: String,
    pub output_file: String,
    pub metadata_file: String,
    pub service_probes: PathBuf,
    pub verbose: bool,
}

impl AppConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let config = Self {
            senders: cli.senders,
            nmap_matchers: cli.nmap_matchers,
            connections_per_host: cli.connections_per_host,
            continue_on_error: cli.continue_on_error,
            break_on_success: cli.break_on_success,
            input_file: cli.input_file.clone(),
            output_file: cli.output_file.clone(),
            metadata_file: cli.metadata_file.clone(),
            service_probes: cli.service_probes.clone(),
            verbose: cli.verbose,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.senders == 0 {
            return Err(GrabError::config("--senders must be greater than 0"));
        }
        if self.nmap_matchers == 0 {
            return Err(GrabError::config("--nmap-matchers must be greater than 0"));
        }
        if self.connections_per_host == 0 {
            return Err(GrabError::config(
                "--connections-per-host must be greater than 0",
            ));
        }
        debug!("configuration validated");
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            senders: self.senders,
            nmap_matchers: self.nmap_matchers,
            connections_per_host: self.connections_per_host,
            continue_on_error: self.continue_on_error,
            break_on_success: self.break_on_success,
            include_debug: self.verbose,
        }
    }
}

/// The `multi` subcommand's module file.
#[derive(Debug, Deserialize)]
pub struct MultiConfig {
    #[serde(rename = "module", default)]
    pub modules: Vec<ModuleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModuleSpec {
    Banner(BannerFlags),
    Telnet(TelnetFlags),
    Rdp(RdpFlags),
}

impl MultiConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GrabError::config(format!("cannot read module config {}: {}", path.display(), e))
        })?;
        let config: MultiConfig = toml::from_str(&text).map_err(|e| {
            GrabError::config(format!("cannot parse module config {}: {}", path.display(), e))
        })?;
        if config.modules.is_empty() {
            return Err(GrabError::config(format!(
                "module config {} defines no modules",
                path.display()
            )));
        }
        Ok(config)
    }
}
