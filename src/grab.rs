//! Core pipeline records
//!
//! The target going in, the per-module response, and the grab record
//! that carries every response for one target to the output sink.

use std::fmt;
use std::net::IpAddr;

use chrono::Utc;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::GrabError;

/// Scan outcome classification, serialized in the output records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanStatus {
    Success,
    ConnectionTimeout,
    ConnectionRefused,
    ProtocolError,
    ApplicationError,
    IoTimeout,
    UnknownError,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ConnectionTimeout => "connection-timeout",
            Self::ConnectionRefused => "connection-refused",
            Self::ProtocolError => "protocol-error",
            Self::ApplicationError => "application-error",
            Self::IoTimeout => "io-timeout",
            Self::UnknownError => "unknown-error",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host to scan. At least one of `ip` and `domain` must be present;
/// the input feeder rejects lines that have neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub ip: Option<IpAddr>,
    pub domain: Option<String>,
    pub tag: Option<String>,
    pub port: Option<u16>,
}

impl ScanTarget {
    /// The host identifier used for dialing and logging: the IP when
    /// available, the domain otherwise.
    pub fn host(&self) -> String {
        if let Some(ip) = self.ip {
            ip.to_string()
        } else {
            self.domain.clone().unwrap_or_default()
        }
    }

    /// The routing tag; a missing tag behaves as the empty string and
    /// matches modules with an empty trigger.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.ip, &self.domain) {
            (None, None) => write!(f, "<empty target>")?,
            (Some(ip), Some(domain)) => write!(f, "{}({})", domain, ip)?,
            (Some(ip), None) => write!(f, "{}", ip)?,
            (None, Some(domain)) => write!(f, "{}", domain)?,
        }
        if let Some(tag) = &self.tag {
            if !tag.is_empty() {
                write!(f, " tag:{}", tag)?;
            }
        }
        Ok(())
    }
}

/// What a module produced for one target.
#[derive(Debug)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<GrabError>,
}

impl ScanOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            status: ScanStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    /// A failed scan, optionally carrying the partial result captured
    /// before the failure.
    pub fn failure(error: GrabError, partial: Option<serde_json::Value>) -> Self {
        Self {
            status: error.scan_status(),
            result: partial,
            error: Some(error),
        }
    }
}

/// The serialized per-module entry of a grab record.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    pub status: ScanStatus,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanResponse {
    pub fn from_outcome(protocol: &str, outcome: ScanOutcome) -> Self {
        Self {
            status: outcome.status,
            protocol: protocol.to_string(),
            result: outcome.result,
            timestamp: Utc::now().to_rfc3339(),
            error: outcome.error.map(|e| e.to_string()),
        }
    }
}

/// All module responses for a single target. Written once by a scan
/// worker, enriched by a fingerprint worker, then frozen.
#[derive(Debug, Clone, Serialize)]
pub struct Grab {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(skip)]
    pub tag: String,
    #[serde(serialize_with = "serialize_data", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<(String, ScanResponse)>,
}

impl Grab {
    /// Build a grab for a target from the module responses, preserving
    /// the order the modules were dispatched in.
    pub fn from_responses(target: &ScanTarget, responses: Vec<(String, ScanResponse)>) -> Grab {
        Grab {
            ip: target.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            domain: target.domain.clone().unwrap_or_default(),
            tag: target.tag().to_string(),
            data: responses,
        }
    }

    pub fn response(&self, module: &str) -> Option<&ScanResponse> {
        self.data.iter().find(|(name, _)| name == module).map(|(_, r)| r)
    }

    pub fn response_mut(&mut self, module: &str) -> Option<&mut ScanResponse> {
        self.data
            .iter_mut()
            .find(|(name, _)| name == module)
            .map(|(_, r)| r)
    }
}

fn serialize_data<S: Serializer>(
    data: &[(String, ScanResponse)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(data.len()))?;
    for (name, response) in data {
        map.serialize_entry(name, response)?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(ip: Option<&str>, domain: Option<&str>, tag: Option<&str>) -> ScanTarget {
        ScanTarget {
            ip: ip.map(|s| s.parse().unwrap()),
            domain: domain.map(String::from),
            tag: tag.map(String::from),
            port: None,
        }
    }

    #[test]
    fn test_target_display() {
        assert_eq!(target(Some("10.0.0.1"), None, None).to_string(), "10.0.0.1");
        assert_eq!(
            target(Some("10.0.0.1"), Some("a.example"), Some("t1")).to_string(),
            "a.example(10.0.0.1) tag:t1"
        );
        assert_eq!(target(None, Some("a.example"), None).to_string(), "a.example");
        assert_eq!(target(None, None, None).to_string(), "<empty target>");
    }

    #[test]
    fn test_target_host_prefers_ip() {
        assert_eq!(target(Some("10.0.0.1"), Some("a.example"), None).host(), "10.0.0.1");
        assert_eq!(target(None, Some("a.example"), None).host(), "a.example");
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ScanStatus::ConnectionTimeout).unwrap(),
            "\"connection-timeout\""
        );
        assert_eq!(serde_json::to_string(&ScanStatus::Success).unwrap(), "\"success\"");
    }

    #[test]
    fn test_grab_serializes_data_in_order() {
        let t = target(Some("10.0.0.1"), None, Some("t1"));
        let response = |proto: &str| ScanResponse {
            status: ScanStatus::Success,
            protocol: proto.to_string(),
            result: None,
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            error: None,
        };
        let grab = Grab::from_responses(
            &t,
            vec![
                ("zeta".to_string(), response("banner")),
                ("alpha".to_string(), response("telnet")),
            ],
        );
        let json = serde_json::to_string(&grab).unwrap();
        // Registration order, not alphabetical; tag never serialized.
        assert!(json.find("zeta").unwrap() < json.find("alpha").unwrap());
        assert!(!json.contains("\"tag\""));
        assert!(!json.contains("\"domain\""));
    }
}
