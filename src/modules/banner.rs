//! Raw banner module
//!
//! Sends a configurable probe (default `\n`) over TCP, TLS or UDP and
//! grabs whatever comes back. The result can be gated on a regex and
//! the banner checked against the module's product matchers.

use std::path::PathBuf;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::conn;
use crate::error::{GrabError, Result};
use crate::grab::{ScanOutcome, ScanTarget};
use crate::module::{BaseFlags, ScanModule, TlsFlags};
use crate::nmap::probes::unescape_c_string;
use crate::nmap::{promote_bytes, ExtractResult, MatcherSet};

pub const DEFAULT_PORT: u16 = 80;
const DEFAULT_PROBE: &str = "\\n";

#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct BannerFlags {
    #[command(flatten)]
    #[serde(flatten)]
    pub base: BaseFlags,

    /// Probe to send, as an escaped literal (e.g. "GET / HTTP/1.0\r\n\r\n").
    /// Mutually exclusive with --probe-file
    #[arg(long, default_value = DEFAULT_PROBE)]
    #[serde(default = "default_probe")]
    pub probe: String,

    /// Read the probe from a file of hex-encoded bytes. Mutually
    /// exclusive with --probe
    #[arg(long = "probe-file")]
    #[serde(default)]
    pub probe_file: Option<PathBuf>,

    /// Regex the banner must match for the scan to succeed
    #[arg(long)]
    #[serde(default)]
    pub pattern: Option<String>,

    /// Send the probe over a TLS connection
    #[arg(long)]
    #[serde(default)]
    pub tls: bool,

    /// Send the probe as a UDP datagram instead of over TCP
    #[arg(long)]
    #[serde(default)]
    pub udp: bool,

    /// Tries for timeouts and connection errors before giving up
    #[arg(long = "max-tries", default_value_t = 1)]
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Store the banner as lowercase hex
    #[arg(long)]
    #[serde(default)]
    pub hex: bool,

    /// Matchers from the service-probes corpus used to detect product
    /// info. Format: <probe>/<service>[,...] (wildcards supported)
    #[arg(long = "product-matchers", default_value = "")]
    #[serde(default)]
    pub product_matchers: String,

    #[command(flatten)]
    #[serde(flatten)]
    pub tls_flags: TlsFlags,
}

fn default_probe() -> String {
    DEFAULT_PROBE.to_string()
}

fn default_max_tries() -> u32 {
    1
}

impl Default for BannerFlags {
    fn default() -> Self {
        Self {
            base: BaseFlags::default(),
            probe: default_probe(),
            probe_file: None,
            pattern: None,
            tls: false,
            udp: false,
            max_tries: default_max_tries(),
            hex: false,
            product_matchers: String::new(),
            tls_flags: TlsFlags::default(),
        }
    }
}

impl BannerFlags {
    pub fn validate(&self) -> Result<()> {
        if self.probe != DEFAULT_PROBE && self.probe_file.is_some() {
            return Err(GrabError::config("cannot set both --probe and --probe-file"));
        }
        if self.tls && self.udp {
            return Err(GrabError::config("cannot set both --tls and --udp"));
        }
        Ok(())
    }
}

/// The module's result record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BannerResults {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub banner: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub length: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<ExtractResult>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[derive(Debug)]
pub struct BannerModule {
    config: BannerFlags,
    probe: Vec<u8>,
    pattern: Option<Regex>,
}

impl BannerModule {
    pub fn new(mut flags: BannerFlags, matchers: &MatcherSet) -> Result<Self> {
        flags.validate()?;
        flags.base.resolve("banner", DEFAULT_PORT);

        let probe = match &flags.probe_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    GrabError::config(format!("cannot read probe file {}: {}", path.display(), e))
                })?;
                hex::decode(text.trim()).map_err(|e| {
                    GrabError::config(format!("probe file is not valid hex: {}", e))
                })?
            }
            None => unescape_c_string(&flags.probe)
                .map_err(|e| GrabError::config(format!("bad probe escape: {}", e)))?,
        };

        let pattern = match flags.pattern.as_deref() {
            Some(p) if !p.is_empty() => Some(
                Regex::new(p).map_err(|e| GrabError::config(format!("bad --pattern: {}", e)))?,
            ),
            _ => None,
        };

        let selected = matchers.filter_glob(&flags.product_matchers)?;
        info!(
            module = flags.base.name(),
            matchers = selected.len(),
            "banner module initialized"
        );

        Ok(Self {
            config: flags,
            probe,
            pattern,
        })
    }

    async fn exchange<S>(&self, stream: &mut S) -> std::io::Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&self.probe).await?;
        conn::read_available(stream, self.config.base.max_read_size, self.config.base.timeout())
            .await
    }

    async fn try_scan(&self, target: &ScanTarget) -> Result<Vec<u8>> {
        if self.config.udp {
            let socket = conn::open_udp(target, &self.config.base).await?;
            socket.send(&self.probe).await?;
            let data = conn::recv_datagram(
                &socket,
                self.config.base.max_read_size,
                self.config.base.timeout(),
            )
            .await?;
            return Ok(data);
        }
        if self.config.tls {
            let mut stream =
                conn::open_tls(target, &self.config.base, &self.config.tls_flags).await?;
            return Ok(self.exchange(&mut stream).await?);
        }
        let mut stream = conn::open_tcp(target, &self.config.base).await?;
        Ok(self.exchange(&mut stream).await?)
    }

    fn outcome_from_banner(&self, raw: &[u8]) -> ScanOutcome {
        let banner = if self.config.hex {
            hex::encode(raw)
        } else {
            promote_bytes(raw)
        };
        let results = BannerResults {
            banner,
            length: raw.len(),
            products: Vec::new(),
        };
        let value = match serde_json::to_value(&results) {
            Ok(v) => v,
            Err(e) => {
                return ScanOutcome::failure(
                    GrabError::application(format!("cannot serialize result: {}", e)),
                    None,
                );
            }
        };

        match &self.pattern {
            Some(re) if !re.is_match(&promote_bytes(raw)) => ScanOutcome::failure(
                GrabError::protocol("pattern did not match"),
                Some(value),
            ),
            _ => ScanOutcome::success(value),
        }
    }
}

#[async_trait]
impl ScanModule for BannerModule {
    fn name(&self) -> &str {
        self.config.base.name()
    }

    fn trigger(&self) -> &str {
        &self.config.base.trigger
    }

    fn protocol(&self) -> &'static str {
        "banner"
    }

    fn product_matchers_glob(&self) -> &str {
        &self.config.product_matchers
    }

    async fn init_per_sender(&self, sender_id: usize) -> Result<()> {
        debug!(module = self.name(), sender_id, "sender initialized");
        Ok(())
    }

    async fn scan(&self, target: &ScanTarget) -> ScanOutcome {
        let mut last_err = None;
        for attempt in 1..=self.config.max_tries.max(1) {
            match self.try_scan(target).await {
                Ok(raw) => return self.outcome_from_banner(&raw),
                Err(e) => {
                    debug!(module = self.name(), target = %target, attempt, error = %e, "scan attempt failed");
                    last_err = Some(e);
                }
            }
        }
        ScanOutcome::failure(
            last_err.unwrap_or_else(|| GrabError::application("scan never attempted")),
            None,
        )
    }

    fn attach_products(&self, matchers: &MatcherSet, result: &mut serde_json::Value) {
        let mut results: BannerResults = match serde_json::from_value(result.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(module = self.name(), error = %e, "result shape mismatch, skipping products");
                return;
            }
        };
        if results.banner.is_empty() {
            return;
        }
        let bytes = if self.config.hex {
            hex::decode(&results.banner).unwrap_or_else(|_| results.banner.as_bytes().to_vec())
        } else {
            results.banner.as_bytes().to_vec()
        };
        results.products = matchers.extract(&bytes);
        if let Ok(value) = serde_json::to_value(&results) {
            *result = value;
        }
    }
}
