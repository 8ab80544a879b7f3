//! RDP banner module
//!
//! Default port 3389. Sends an X.224 connection request carrying an RDP
//! negotiation request and records the raw reply plus the protocol the
//! server selected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::conn;
use crate::error::{GrabError, Result};
use crate::grab::{ScanOutcome, ScanTarget};
use crate::module::{BaseFlags, ScanModule};
use crate::nmap::{ExtractResult, MatcherSet};

pub const DEFAULT_PORT: u16 = 3389;

/// TPKT + X.224 connection request with an RDP negotiation request
/// asking for TLS or CredSSP.
const CONNECTION_REQUEST: &[u8] = b"\x03\x00\x00\x13\x0e\xe0\x00\x00\x00\x00\x00\x01\x00\x08\x00\x03\x00\x00\x00";

const TYPE_NEG_RSP: u8 = 0x02;
const TYPE_NEG_FAILURE: u8 = 0x03;

#[derive(Debug, Clone, Default, clap::Args, Serialize, Deserialize)]
pub struct RdpFlags {
    #[command(flatten)]
    #[serde(flatten)]
    pub base: BaseFlags,

    /// Matchers from the service-probes corpus used to detect product
    /// info. Format: <probe>/<service>[,...] (wildcards supported)
    #[arg(long = "product-matchers", default_value = "*/ms-wbt-server")]
    #[serde(default = "default_product_matchers")]
    pub product_matchers: String,
}

fn default_product_matchers() -> String {
    "*/ms-wbt-server".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RdpResults {
    /// Raw reply bytes, stored as lowercase hex.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub banner: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocol_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<ExtractResult>,
}

pub struct RdpModule {
    config: RdpFlags,
}

impl RdpModule {
    pub fn new(mut flags: RdpFlags, matchers: &MatcherSet) -> Result<Self> {
        flags.base.resolve("rdp", DEFAULT_PORT);
        let selected = matchers.filter_glob(&flags.product_matchers)?;
        info!(
            module = flags.base.name(),
            matchers = selected.len(),
            "rdp module initialized"
        );
        Ok(Self { config: flags })
    }
}

/// Decode the X.224 connection confirm. Returns None when the reply is
/// not RDP at all.
fn parse_connection_confirm(banner: &[u8]) -> Option<RdpResults> {
    // TPKT version 3 and an X.224 CC TPDU.
    if banner.len() < 7 || banner[0] != 0x03 || banner[5] != 0xD0 {
        return None;
    }

    let mut results = RdpResults {
        banner: hex::encode(banner),
        ..Default::default()
    };

    if banner.len() >= 19 {
        let code = u32::from_le_bytes([banner[15], banner[16], banner[17], banner[18]]);
        match banner[11] {
            TYPE_NEG_RSP => {
                results.protocol_flags.push(selected_protocol_name(code));
                let flags = banner[12];
                for (bit, name) in [
                    (0x01, "EXTENDED_CLIENT_DATA_SUPPORTED"),
                    (0x02, "DYNVC_GFX_PROTOCOL_SUPPORTED"),
                    (0x08, "RESTRICTED_ADMIN_MODE_SUPPORTED"),
                    (0x10, "REDIRECTED_AUTHENTICATION_MODE_SUPPORTED"),
                ] {
                    if flags & bit != 0 {
                        results.protocol_flags.push(name.to_string());
                    }
                }
            }
            TYPE_NEG_FAILURE => {
                results.negotiation_failure = Some(failure_code_name(code));
            }
            _ => {}
        }
    }

    Some(results)
}

fn selected_protocol_name(code: u32) -> String {
    match code {
        0 => "PROTOCOL_RDP".to_string(),
        1 => "PROTOCOL_SSL".to_string(),
        2 => "PROTOCOL_HYBRID".to_string(),
        4 => "PROTOCOL_RDSTLS".to_string(),
        8 => "PROTOCOL_HYBRID_EX".to_string(),
        other => format!("PROTOCOL_UNKNOWN_{}", other),
    }
}

fn failure_code_name(code: u32) -> String {
    match code {
        1 => "SSL_REQUIRED_BY_SERVER".to_string(),
        2 => "SSL_NOT_ALLOWED_BY_SERVER".to_string(),
        3 => "SSL_CERT_NOT_ON_SERVER".to_string(),
        4 => "INCONSISTENT_FLAGS".to_string(),
        5 => "HYBRID_REQUIRED_BY_SERVER".to_string(),
        6 => "SSL_WITH_USER_AUTH_REQUIRED_BY_SERVER".to_string(),
        other => format!("FAILURE_{}", other),
    }
}

#[async_trait]
impl ScanModule for RdpModule {
    fn name(&self) -> &str {
        self.config.base.name()
    }

    fn trigger(&self) -> &str {
        &self.config.base.trigger
    }

    fn protocol(&self) -> &'static str {
        "rdp"
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

        if let Err(e) = stream.write_all(CONNECTION_REQUEST).await {
            return ScanOutcome::failure(e.into(), None);
        }
        let raw = match conn::read_available(
            &mut stream,
            self.config.base.max_read_size,
            self.config.base.timeout(),
        )
        .await
        {
            Ok(data) => data,
            Err(e) => return ScanOutcome::failure(e.into(), None),
        };

        match parse_connection_confirm(&raw) {
            Some(results) => match serde_json::to_value(&results) {
                Ok(value) => ScanOutcome::success(value),
                Err(e) => ScanOutcome::failure(
                    GrabError::application(format!("cannot serialize result: {}", e)),
                    None,
                ),
            },
            None => {
                let partial = serde_json::to_value(RdpResults {
                    banner: hex::encode(&raw),
                    ..Default::default()
                })
                .ok();
                ScanOutcome::failure(GrabError::protocol("not an rdp reply"), partial)
            }
        }
    }

    fn attach_products(&self, matchers: &MatcherSet, result: &mut serde_json::Value) {
        let mut results: RdpResults = match serde_json::from_value(result.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(module = self.name(), error = %e, "result shape mismatch, skipping products");
                return;
            }
        };
        if results.banner.is_empty() {
            return;
        }
        let bytes = match hex::decode(&results.banner) {
            Ok(b) => b,
            Err(_) => results.banner.as_bytes().to_vec(),
        };
        results.products = matchers.extract(&bytes);
        if let Ok(value) = serde_json::to_value(&results) {
            *result = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// TPKT + X.224 CC + RDP_NEG_RSP selecting CredSSP.
    fn negotiation_response() -> Vec<u8> {
        let mut reply = vec![0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00];
        reply.extend_from_slice(&[TYPE_NEG_RSP, 0x01, 0x08, 0x00]);
        reply.extend_from_slice(&2u32.to_le_bytes());
        reply
    }

    #[test]
    fn test_parse_connection_confirm() {
        let results = parse_connection_confirm(&negotiation_response()).unwrap();
        assert_eq!(
            results.protocol_flags,
            vec!["PROTOCOL_HYBRID", "EXTENDED_CLIENT_DATA_SUPPORTED"]
        );
        assert!(results.negotiation_failure.is_none());
        assert_eq!(results.banner, hex::encode(negotiation_response()));
    }

    #[test]
    fn test_parse_negotiation_failure() {
        let mut reply = vec![0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00];
        reply.extend_from_slice(&[TYPE_NEG_FAILURE, 0x00, 0x08, 0x00]);
        reply.extend_from_slice(&1u32.to_le_bytes());
        let results = parse_connection_confirm(&reply).unwrap();
        assert_eq!(
            results.negotiation_failure.as_deref(),
            Some("SSL_REQUIRED_BY_SERVER")
        );
        assert!(results.protocol_flags.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_rdp() {
        assert!(parse_connection_confirm(b"HTTP/1.1 400 Bad Request").is_none());
        assert!(parse_connection_confirm(&[0x03, 0x00, 0x00]).is_none());
        // TPKT framing but not a connection confirm.
        assert!(parse_connection_confirm(&[0x03, 0x00, 0x00, 0x0b, 0x06, 0xe0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_bare_connection_confirm_without_negotiation() {
        // Old servers answer with a plain CC and no negotiation payload.
        let results = parse_connection_confirm(&[0x03, 0x00, 0x00, 0x0b, 0x06, 0xd0, 0, 0, 0x12, 0x34, 0]).unwrap();
        assert!(results.protocol_flags.is_empty());
        assert!(results.negotiation_failure.is_none());
    }
}
