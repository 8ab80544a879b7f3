//! Parser for the `nmap-service-probes` corpus format
//!
//! Line-oriented and directive-led. The parser extracts probes
//! (name, transport, payload) and their match rules (service, regex,
//! flags, templated version-info bindings) and tolerates the corpus
//! directives it has no use for.

use serde::Serialize;

use crate::error::{GrabError, Result};
use crate::nmap::template::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// A named probe: a stimulus payload plus the match rules that classify
/// responses to it.
#[derive(Debug, Clone)]
pub struct ServiceProbe {
    pub name: String,
    pub transport: Transport,
    pub payload: Vec<u8>,
    pub ports: Vec<u16>,
    pub ssl_ports: Vec<u16>,
    pub rarity: Option<u8>,
    pub matches: Vec<ProbeMatch>,
}

/// One `match`/`softmatch` rule under a probe.
#[derive(Debug, Clone)]
pub struct ProbeMatch {
    pub service: String,
    pub soft: bool,
    pub pattern: String,
    pub flags: String,
    pub bindings: MatchBindings,
}

/// The templated version-info bindings of a match rule.
#[derive(Debug, Clone, Default)]
pub struct MatchBindings {
    pub vendor_product: Template,
    pub version: Template,
    pub info: Template,
    pub hostname: Template,
    pub os: Template,
    pub device_type: Template,
    pub cpe: Vec<Template>,
}

/// Parse a whole corpus. The input must already be scalar-promoted if it
/// came from raw bytes (see [`crate::nmap::promote_bytes`]).
pub fn parse_service_probes(input: &str) -> Result<Vec<ServiceProbe>> {
    let mut probes: Vec<ServiceProbe> = Vec::new();

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("Probe ") {
            probes.push(parse_probe_decl(rest, line_no)?);
        } else if let Some(rest) = line.strip_prefix("match ") {
            current(&mut probes, line_no)?
                .matches
                .push(parse_match(rest, false, line_no)?);
        } else if let Some(rest) = line.strip_prefix("softmatch ") {
            current(&mut probes, line_no)?
                .matches
                .push(parse_match(rest, true, line_no)?);
        } else if let Some(rest) = line.strip_prefix("ports ") {
            current(&mut probes, line_no)?.ports = parse_ports(rest, line_no)?;
        } else if let Some(rest) = line.strip_prefix("sslports ") {
            current(&mut probes, line_no)?.ssl_ports = parse_ports(rest, line_no)?;
        } else if let Some(rest) = line.strip_prefix("rarity ") {
            current(&mut probes, line_no)?.rarity = rest.trim().parse::<u8>().ok();
        } else if line.starts_with("Exclude ")
            || line.starts_with("fallback ")
            || line.starts_with("totalwaitms ")
            || line.starts_with("tcpwrappedms ")
        {
            // Directives the fingerprint engine has no use for.
        } else {
            return Err(GrabError::corpus_parse(
                line_no,
                format!("unrecognized directive: {:?}", line.split(' ').next().unwrap_or(line)),
            ));
        }
    }

    Ok(probes)
}

fn current<'a>(probes: &'a mut Vec<ServiceProbe>, line_no: usize) -> Result<&'a mut ServiceProbe> {
    probes
        .last_mut()
        .ok_or_else(|| GrabError::corpus_parse(line_no, "directive before any Probe"))
}

/// `Probe TCP GetRequest q|GET / HTTP/1.0\r\n\r\n|`
fn parse_probe_decl(rest: &str, line_no: usize) -> Result<ServiceProbe> {
    let mut parts = rest.trim().splitn(3, ' ');
    let transport = match parts.next() {
        Some("TCP") => Transport::Tcp,
        Some("UDP") => Transport::Udp,
        other => {
            return Err(GrabError::corpus_parse(
                line_no,
                format!("bad probe transport: {:?}", other.unwrap_or("")),
            ));
        }
    };
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| GrabError::corpus_parse(line_no, "probe has no name"))?
        .to_string();

    let payload = match parts.next().map(str::trim_start) {
        Some(spec) if spec.starts_with('q') => {
            let mut chars = spec.chars();
            chars.next();
            let delim = chars
                .next()
                .ok_or_else(|| GrabError::corpus_parse(line_no, "probe payload has no delimiter"))?;
            let body = chars.as_str();
            let end = body
                .find(delim)
                .ok_or_else(|| GrabError::corpus_parse(line_no, "unterminated probe payload"))?;
            unescape_c_string(&body[..end])
                .map_err(|e| GrabError::corpus_parse(line_no, e))?
        }
        _ => Vec::new(),
    };

    Ok(ServiceProbe {
        name,
        transport,
        payload,
        ports: Vec::new(),
        ssl_ports: Vec::new(),
        rarity: None,
        matches: Vec::new(),
    })
}

/// `<service> m<delim>regex<delim><flags> [p/../ v/../ ... cpe:/../a]`
fn parse_match(rest: &str, soft: bool, line_no: usize) -> Result<ProbeMatch> {
    let rest = rest.trim_start();
    let (service, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| GrabError::corpus_parse(line_no, "match rule has no pattern"))?;

    let rest = rest.trim_start();
    let mut chars = rest.chars();
    if chars.next() != Some('m') {
        return Err(GrabError::corpus_parse(line_no, "match pattern must start with 'm'"));
    }
    let delim = chars
        .next()
        .ok_or_else(|| GrabError::corpus_parse(line_no, "match pattern has no delimiter"))?;
    let body = chars.as_str();
    let end = body
        .find(delim)
        .ok_or_else(|| GrabError::corpus_parse(line_no, "unterminated match pattern"))?;
    let pattern = body[..end].to_string();

    let after = &body[end + delim.len_utf8()..];
    let flags_end = after
        .find(char::is_whitespace)
        .unwrap_or(after.len());
    let flags = after[..flags_end].to_string();

    let bindings = parse_bindings(&after[flags_end..], line_no)?;

    Ok(ProbeMatch {
        service: service.to_string(),
        soft,
        pattern,
        flags,
        bindings,
    })
}

fn parse_bindings(mut rest: &str, line_no: usize) -> Result<MatchBindings> {
    let mut bindings = MatchBindings::default();

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(bindings);
        }

        let (key, after_key) = if let Some(after) = rest.strip_prefix("cpe:") {
            ("cpe", after)
        } else {
            match rest.chars().next() {
                Some(c @ ('p' | 'v' | 'i' | 'h' | 'o' | 'd')) => {
                    (&rest[..c.len_utf8()], &rest[c.len_utf8()..])
                }
                other => {
                    return Err(GrabError::corpus_parse(
                        line_no,
                        format!("unknown version-info field: {:?}", other),
                    ));
                }
            }
        };

        let mut chars = after_key.chars();
        let delim = chars
            .next()
            .ok_or_else(|| GrabError::corpus_parse(line_no, "binding has no delimiter"))?;
        let body = chars.as_str();
        let end = body
            .find(delim)
            .ok_or_else(|| GrabError::corpus_parse(line_no, "unterminated binding value"))?;
        let template = Template::parse(&body[..end]);

        match key {
            "p" => bindings.vendor_product = template,
            "v" => bindings.version = template,
            "i" => bindings.info = template,
            "h" => bindings.hostname = template,
            "o" => bindings.os = template,
            "d" => bindings.device_type = template,
            "cpe" => bindings.cpe.push(template),
            _ => unreachable!(),
        }

        rest = &body[end + delim.len_utf8()..];
        // Trailing flag letters on a binding, e.g. the `a` of `cpe:/../a`.
        rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    }
}

fn parse_ports(spec: &str, line_no: usize) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_port(lo, line_no)?;
                let hi = parse_port(hi, line_no)?;
                ports.extend(lo..=hi);
            }
            None => ports.push(parse_port(part, line_no)?),
        }
    }
    Ok(ports)
}

fn parse_port(s: &str, line_no: usize) -> Result<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| GrabError::corpus_parse(line_no, format!("bad port: {:?}", s)))
}

/// Decode the C-style escapes of a probe payload into raw bytes.
/// Scalar-promoted characters above ASCII fold back to their byte value.
pub(crate) fn unescape_c_string(input: &str) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            push_scalar(&mut out, c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push(0),
            Some('a') => out.push(0x07),
            Some('b') => out.push(0x08),
            Some('f') => out.push(0x0C),
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('v') => out.push(0x0B),
            Some('\\') => out.push(b'\\'),
            Some('x') => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            value = value * 16 + d;
                            chars.next();
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    return Err("\\x escape with no hex digits".to_string());
                }
                out.push(value as u8);
            }
            Some(other) => push_scalar(&mut out, other),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}

fn push_scalar(out: &mut Vec<u8>, c: char) {
    let cp = c as u32;
    if cp <= 0xFF {
        out.push(cp as u8);
    } else {
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
}
