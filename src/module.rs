//! The scan-module contract
//!
//! Every protocol module honors the same capability set: typed flags
//! with fail-fast validation, construction against the loaded matcher
//! set, per-sender initialization, the scan itself, and product
//! attachment for the fingerprint stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GrabError, Result};
use crate::grab::{ScanOutcome, ScanTarget};
use crate::nmap::MatcherSet;

/// Flags shared by every scan module.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct BaseFlags {
    /// Name for this module's entry in the output data map
    #[arg(long)]
    #[serde(default)]
    pub name: Option<String>,

    /// Routing tag a target must carry for this module to run
    #[arg(long, default_value = "")]
    #[serde(default)]
    pub trigger: String,

    /// Port to connect to; a per-target port overrides this
    #[arg(long)]
    #[serde(default)]
    pub port: Option<u16>,

    /// Connection and read deadline in seconds
    #[arg(long = "timeout", default_value_t = 10)]
    #[serde(rename = "timeout", default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum number of banner bytes to read
    #[arg(long = "max-read-size", default_value_t = 65536)]
    #[serde(default = "default_max_read_size")]
    pub max_read_size: usize,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_read_size() -> usize {
    65536
}

impl Default for BaseFlags {
    fn default() -> Self {
        Self {
            name: None,
            trigger: String::new(),
            port: None,
            timeout_secs: default_timeout_secs(),
            max_read_size: default_max_read_size(),
        }
    }
}

impl BaseFlags {
    /// Fill in the module-type defaults that were not given explicitly.
    pub fn resolve(&mut self, module_type: &str, default_port: u16) {
        if self.name.is_none() {
            self.name = Some(module_type.to_string());
        }
        if self.port.is_none() {
            self.port = Some(default_port);
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(0)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// TLS options shared by the modules that can speak TLS.
#[derive(Debug, Clone, Default, clap::Args, Serialize, Deserialize)]
pub struct TlsFlags {
    /// Do not verify the server certificate
    #[arg(long = "tls-skip-verify")]
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Override the SNI server name (defaults to the target domain)
    #[arg(long = "tls-server-name")]
    #[serde(default)]
    pub tls_server_name: Option<String>,
}

/// Contract every protocol module honors.
#[async_trait]
pub trait ScanModule: Send + Sync {
    /// The key this module's responses are stored under in the grab.
    fn name(&self) -> &str;

    /// The tag a target must carry for this module to be invoked.
    fn trigger(&self) -> &str;

    /// Protocol identifier recorded on every response.
    fn protocol(&self) -> &'static str;

    /// The `<probe>/<service>` glob selecting this module's matchers.
    fn product_matchers_glob(&self) -> &str;

    /// Invoked once per scan worker before the worker starts draining
    /// targets.
    async fn init_per_sender(&self, _sender_id: usize) -> Result<()> {
        Ok(())
    }

    /// Perform the protocol exchange against one target.
    async fn scan(&self, target: &ScanTarget) -> ScanOutcome;

    /// Run the given matcher subset over the module's banner field and
    /// attach the extraction results in place. Idempotent.
    fn attach_products(&self, matchers: &MatcherSet, result: &mut serde_json::Value);
}

/// The registered modules, in a stable configured order.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn ScanModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Names key the output map, so duplicates are a
    /// configuration error.
    pub fn register(&mut self, module: Arc<dyn ScanModule>) -> Result<()> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(GrabError::config(format!(
                "duplicate module name: {:?}",
                module.name()
            )));
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ScanModule>> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
