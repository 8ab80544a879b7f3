//! A compiled match rule
//!
//! Pairs one corpus regex with its templated version-info bindings.
//! Immutable after construction; match state is per-call, so a matcher
//! can be shared freely across fingerprint workers.

use regex::{Captures, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{GrabError, Result};
use crate::nmap::probes::{MatchBindings, ProbeMatch, ServiceProbe, Transport};

#[derive(Debug)]
pub struct Matcher {
    pub probe: String,
    pub service: String,
    pub transport: Transport,
    pub soft: bool,
    /// The regex exactly as it appears in the corpus.
    pub pattern: String,
    re: regex::Regex,
    bindings: MatchBindings,
}

/// A rendered identification produced by one matcher hitting one banner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractResult {
    pub probe: String,
    pub service: String,
    pub regex: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub softmatch: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vendor_product_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpe: Vec<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Matcher {
    pub fn new(probe: &ServiceProbe, rule: &ProbeMatch) -> Result<Matcher> {
        let translated = translate_pattern(&rule.pattern);
        let re = RegexBuilder::new(&translated)
            .case_insensitive(rule.flags.contains('i'))
            .dot_matches_new_line(true)
            .multi_line(false)
            .build()
            .map_err(|e| GrabError::regex_compile(&rule.pattern, e))?;

        Ok(Matcher {
            probe: probe.name.clone(),
            service: rule.service.clone(),
            transport: probe.transport,
            soft: rule.soft,
            pattern: rule.pattern.clone(),
            re,
            bindings: rule.bindings.clone(),
        })
    }

    /// `<probe>/<service>`, the identity used by glob filtering.
    pub fn id(&self) -> String {
        format!("{}/{}", self.probe, self.service)
    }

    /// Run the regex over scalar-promoted input.
    pub fn evaluate<'i>(&self, input: &'i str) -> Option<Captures<'i>> {
        self.re.captures(input)
    }

    /// Render the bindings of a successful match into an extraction
    /// record. Fields whose groups captured nothing come out empty.
    pub fn render(&self, caps: &Captures) -> ExtractResult {
        ExtractResult {
            probe: self.probe.clone(),
            service: self.service.clone(),
            regex: self.pattern.clone(),
            softmatch: self.soft,
            vendor_product_name: self.bindings.vendor_product.render(caps),
            version: self.bindings.version.render(caps),
            info: self.bindings.info.render(caps),
            hostname: self.bindings.hostname.render(caps),
            os: self.bindings.os.render(caps),
            device_type: self.bindings.device_type.render(caps),
            cpe: self.bindings.cpe.iter().map(|t| t.render(caps)).collect(),
        }
    }
}

/// Promote raw bytes to a scalar string: valid UTF-8 decodes normally,
/// every other byte becomes the code point of equal value. Lossless for
/// `\xNN` pattern escapes, and idempotent for already-valid UTF-8.
pub fn promote_bytes(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                out.push_str(std::str::from_utf8(&rest[..valid_up_to]).unwrap_or_default());
                out.push(char::from(rest[valid_up_to]));
                rest = &rest[valid_up_to + 1..];
            }
        }
    }
    out
}

/// Bridge the PCRE spellings of the corpus onto the regex crate:
/// `\0` NUL, `\Z` end anchor, possessive quantifiers, and `(?<name>`
/// capture groups. Constructs the engine genuinely lacks (such as
/// backreferences) are left alone and rejected at compile time.
fn translate_pattern(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut in_class = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            match chars.get(i + 1) {
                Some('0') if !matches!(chars.get(i + 2), Some('0'..='7')) => {
                    out.push_str("\\x00");
                    i += 2;
                }
                Some('Z') if !in_class => {
                    out.push_str("\\z");
                    i += 2;
                }
                Some(next) => {
                    out.push('\\');
                    out.push(*next);
                    i += 2;
                }
                None => {
                    out.push('\\');
                    i += 1;
                }
            }
            continue;
        }
        if in_class {
            if c == ']' {
                in_class = false;
            }
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '[' => {
                in_class = true;
                out.push(c);
                i += 1;
            }
            '+' | '*' | '?' | '}' => {
                out.push(c);
                i += 1;
                // Possessive quantifier: drop the extra '+'.
                if chars.get(i) == Some(&'+') {
                    i += 1;
                }
            }
            '(' => {
                // (?<name>...) but not the lookbehinds (?<= / (?<!.
                if chars.get(i + 1) == Some(&'?')
                    && chars.get(i + 2) == Some(&'<')
                    && chars
                        .get(i + 3)
                        .is_some_and(|c| c.is_alphanumeric() || *c == '_')
                {
                    out.push_str("(?P<");
                    i += 3;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmap::template::Template;

    fn make(pattern: &str, bindings: MatchBindings) -> Matcher {
        let probe = ServiceProbe {
            name: String::new(),
            transport: Transport::Tcp,
            payload: Vec::new(),
            ports: Vec::new(),
            ssl_ports: Vec::new(),
            rarity: None,
            matches: Vec::new(),
        };
        let rule = ProbeMatch {
            service: String::new(),
            soft: false,
            pattern: pattern.to_string(),
            flags: String::new(),
            bindings,
        };
        Matcher::new(&probe, &rule).unwrap()
    }

    #[test]
    fn test_matcher_template() {
        let m = make(
            r"(A+(B+)?)(C+)\xFF!",
            MatchBindings {
                vendor_product: Template::parse("p:$1"),
                version: Template::parse("v:$2"),
                info: Template::parse("i:$1-$2"),
                hostname: Template::parse("h:$3"),
                os: Template::parse("o:$2/$3"),
                device_type: Template::parse("d:$3...$3"),
                cpe: vec![Template::parse("cpe:/a:$1"), Template::parse("cpe:/b:$2")],
            },
        );

        let input = promote_bytes(b"AAABBCCCC\xFF!");
        let caps = m.evaluate(&input).expect("should match");
        let v = m.render(&caps);
        assert_eq!(v.vendor_product_name, "p:AAABB");
        assert_eq!(v.version, "v:BB");
        assert_eq!(v.info, "i:AAABB-BB");
        assert_eq!(v.hostname, "h:CCCC");
        assert_eq!(v.os, "o:BB/CCCC");
        assert_eq!(v.device_type, "d:CCCC...CCCC");
        assert_eq!(v.cpe, vec!["cpe:/a:AAABB", "cpe:/b:BB"]);
    }

    #[test]
    fn test_promote_bytes() {
        let promoted = promote_bytes(b"A\x80\xFF\x00\xD0\xAF");
        let scalars: Vec<u32> = promoted.chars().map(|c| c as u32).collect();
        assert_eq!(scalars, vec![0x41, 0x80, 0xFF, 0x00, 0x42F]);
    }

    #[test]
    fn test_matcher_binary_input() {
        // Binary input that is not valid UTF-8.
        let m = make("^A\\x80\\xFF\\0\u{42F}$", MatchBindings::default());
        let input = promote_bytes(b"A\x80\xFF\x00\xD0\xAF");
        assert!(m.evaluate(&input).is_some());
    }

    #[test]
    fn test_single_line_dot() {
        let m = make("abc.+def", MatchBindings::default());
        assert!(m.evaluate("abc\r\ndef").is_some());
    }

    #[test]
    fn test_caseless_flag() {
        let probe = ServiceProbe {
            name: "p".to_string(),
            transport: Transport::Tcp,
            payload: Vec::new(),
            ports: Vec::new(),
            ssl_ports: Vec::new(),
            rarity: None,
            matches: Vec::new(),
        };
        let rule = ProbeMatch {
            service: "s".to_string(),
            soft: false,
            pattern: "^ssh".to_string(),
            flags: "i".to_string(),
            bindings: MatchBindings::default(),
        };
        let m = Matcher::new(&probe, &rule).unwrap();
        assert!(m.evaluate("SSH-2.0-OpenSSH").is_some());
    }

    #[test]
    fn test_alternation_and_nongreedy() {
        let m = make(r"\dG|internet|gprs|[Kk]b|[Mm]b|Gb|lte", MatchBindings::default());
        assert!(m.evaluate("4GKb").is_some());
        assert!(m.evaluate("Some value").is_none());

        let m = make(r"^<(.+?)>", MatchBindings::default());
        let caps = m.evaluate("<a><b>").unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "a");
    }

    #[test]
    fn test_translate_pattern() {
        assert_eq!(translate_pattern(r"a\0b"), r"a\x00b");
        assert_eq!(translate_pattern(r"x\Z"), r"x\z");
        assert_eq!(translate_pattern(r"a++b*+c?+"), r"a+b*c?");
        assert_eq!(translate_pattern(r"a{2,3}+"), r"a{2,3}");
        assert_eq!(translate_pattern(r"(?<ver>\d+)"), r"(?P<ver>\d+)");
        // Lookbehind syntax and escaped pluses stay untouched.
        assert_eq!(translate_pattern(r"(?<=x)y"), r"(?<=x)y");
        assert_eq!(translate_pattern(r"a\+\+"), r"a\+\+");
        // Characters inside classes are not quantifiers.
        assert_eq!(translate_pattern(r"[+*]+"), r"[+*]+");
    }

    #[test]
    fn test_named_group_render() {
        let m = make(
            r"(?<prod>[a-z]+)/(?<ver>[\d.]+)",
            MatchBindings {
                vendor_product: Template::parse("$SUBST(prod,\"x\",\"y\")"),
                version: Template::parse("$2"),
                ..Default::default()
            },
        );
        let caps = m.evaluate("nginx/1.18.0").unwrap();
        let v = m.render(&caps);
        assert_eq!(v.vendor_product_name, "nginy");
        assert_eq!(v.version, "1.18.0");
    }
}
