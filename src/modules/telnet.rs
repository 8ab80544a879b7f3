//! Telnet banner module
//!
//! Default port 23. Reads the initial server data, separates IAC option
//! negotiation from banner text, refuses every offered option, and
//! records what the server wanted to negotiate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::conn;
use crate::error::{GrabError, Result};
use crate::grab::{ScanOutcome, ScanTarget};
use crate::module::{BaseFlags, ScanModule};
use crate::nmap::{promote_bytes, ExtractResult, MatcherSet};

pub const DEFAULT_PORT: u16 = 23;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Clone, Default, clap::Args, Serialize, Deserialize)]
pub struct TelnetFlags {
    #[command(flatten)]
    #[serde(flatten)]
    pub base: BaseFlags,

    /// Return the banner even when the exchange errored
    #[arg(long = "force-banner")]
    #[serde(default)]
    pub force_banner: bool,

    /// Matchers from the service-probes corpus used to detect product
    /// info. Format: <probe>/<service>[,...] (wildcards supported)
    #[arg(long = "product-matchers", default_value = "*/telnet")]
    #[serde(default = "default_product_matchers")]
    pub product_matchers: String,
}

fn default_product_matchers() -> String {
    "*/telnet".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelnetResults {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub banner: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub will: Vec<String>,
    #[serde(rename = "do", default, skip_serializing_if = "Vec::is_empty")]
    pub do_: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wont: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dont: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<ExtractResult>,
}

/// One pass over received bytes: banner text, the options the server
/// negotiated, and the refusals we owe it.
#[derive(Debug, Default)]
struct Negotiation {
    banner: Vec<u8>,
    will: Vec<String>,
    do_: Vec<String>,
    wont: Vec<String>,
    dont: Vec<String>,
    replies: Vec<u8>,
}

fn parse_negotiation(data: &[u8]) -> Negotiation {
    let mut out = Negotiation::default();
    let mut i = 0;
    while i < data.len() {
        if data[i] != IAC {
            out.banner.push(data[i]);
            i += 1;
            continue;
        }
        match data.get(i + 1) {
            Some(&IAC) => {
                // Escaped 0xFF data byte.
                out.banner.push(IAC);
                i += 2;
            }
            Some(&cmd) if matches!(cmd, WILL | WONT | DO | DONT) => {
                let Some(&option) = data.get(i + 2) else { break };
                let name = option_name(option);
                match cmd {
                    WILL => {
                        out.will.push(name);
                        out.replies.extend_from_slice(&[IAC, DONT, option]);
                    }
                    DO => {
                        out.do_.push(name);
                        out.replies.extend_from_slice(&[IAC, WONT, option]);
                    }
                    WONT => out.wont.push(name),
                    _ => out.dont.push(name),
                }
                i += 3;
            }
            Some(&SB) => {
                // Skip subnegotiation through IAC SE.
                let mut j = i + 2;
                while j + 1 < data.len() && !(data[j] == IAC && data[j + 1] == SE) {
                    j += 1;
                }
                i = j + 2;
            }
            Some(_) => i += 2,
            None => break,
        }
    }
    out
}

fn option_name(option: u8) -> String {
    match option {
        0 => "binary-transmission".to_string(),
        1 => "echo".to_string(),
        3 => "suppress-go-ahead".to_string(),
        5 => "status".to_string(),
        6 => "timing-mark".to_string(),
        24 => "terminal-type".to_string(),
        31 => "window-size".to_string(),
        32 => "terminal-speed".to_string(),
        33 => "remote-flow-control".to_string(),
        34 => "linemode".to_string(),
        36 => "environment".to_string(),
        37 => "authentication".to_string(),
        39 => "new-environment".to_string(),
        other => format!("unknown-{}", other),
    }
}

pub struct TelnetModule {
    config: TelnetFlags,
}

impl TelnetModule {
    pub fn new(mut flags: TelnetFlags, matchers: &MatcherSet) -> Result<Self> {
        flags.base.resolve("telnet", DEFAULT_PORT);
        let selected = matchers.filter_glob(&flags.product_matchers)?;
        info!(
            module = flags.base.name(),
            matchers = selected.len(),
            "telnet module initialized"
        );
        Ok(Self { config: flags })
    }

    fn results_from(&self, negotiation: Negotiation) -> TelnetResults {
        TelnetResults {
            banner: promote_bytes(&negotiation.banner),
            will: negotiation.will,
            do_: negotiation.do_,
            wont: negotiation.wont,
            dont: negotiation.dont,
            products: Vec::new(),
        }
    }
}

#[async_trait]
impl ScanModule for TelnetModule {
    fn name(&self) -> &str {
        self.config.base.name()
    }

    fn trigger(&self) -> &str {
        &self.config.base.trigger
    }

    fn protocol(&self) -> &'static str {
        "telnet"
    }

    fn product_matchers_glob(&self) -> &str {
        &self.config.product_matchers
    }

    async fn init_per_sender(&self, sender_id: usize) -> Result<()> {
        debug!(module = self.name(), sender_id, "sender initialized");
        Ok(())
    }

    async fn scan(&self, target: &ScanTarget) -> ScanOutcome {
        let mut stream = match conn::open_tcp(target, &self.config.base).await {
            Ok(s) => s,
            Err(e) => return ScanOutcome::failure(e, None),
        };

        let max_read = self.config.base.max_read_size;
        let raw = match conn::read_available(&mut stream, max_read, self.config.base.timeout()).await
        {
            Ok(data) => data,
            Err(e) => return ScanOutcome::failure(e.into(), None),
        };

        let mut negotiation = parse_negotiation(&raw);
        if !negotiation.replies.is_empty() && negotiation.banner.is_empty() {
            // The server led with options; refuse them and give it one
            // more chance to print a banner.
            let replies = std::mem::take(&mut negotiation.replies);
            if stream.write_all(&replies).await.is_ok() {
                if let Ok(more) =
                    conn::read_available(&mut stream, max_read, self.config.base.timeout()).await
                {
                    let follow_up = parse_negotiation(&more);
                    negotiation.banner.extend_from_slice(&follow_up.banner);
                    negotiation.will.extend(follow_up.will);
                    negotiation.do_.extend(follow_up.do_);
                    negotiation.wont.extend(follow_up.wont);
                    negotiation.dont.extend(follow_up.dont);
                }
            }
        }

        let saw_negotiation = !(negotiation.will.is_empty()
            && negotiation.do_.is_empty()
            && negotiation.wont.is_empty()
            && negotiation.dont.is_empty());
        let results = self.results_from(negotiation);
        let value = match serde_json::to_value(&results) {
            Ok(v) => v,
            Err(e) => {
                return ScanOutcome::failure(
                    GrabError::application(format!("cannot serialize result: {}", e)),
                    None,
                );
            }
        };

        if !results.banner.is_empty() || saw_negotiation || self.config.force_banner {
            ScanOutcome::success(value)
        } else {
            ScanOutcome::failure(GrabError::application("no banner received"), Some(value))
        }
    }

    fn attach_products(&self, matchers: &MatcherSet, result: &mut serde_json::Value) {
        let mut results: TelnetResults = match serde_json::from_value(result.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(module = self.name(), error = %e, "result shape mismatch, skipping products");
                return;
            }
        };
        if results.banner.is_empty() {
            return;
        }
        results.products = matchers.extract(results.banner.as_bytes());
        if let Ok(value) = serde_json::to_value(&results) {
            *result = value;
        }
    }
}
