//! The loaded matcher set
//!
//! An ordered collection of compiled matchers. Load order is evaluation
//! order and is stable across restarts given the same corpus. Filtering
//! never reorders; extraction preserves it in the result list.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::GlobBuilder;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::{GrabError, Result};
use crate::nmap::matcher::{promote_bytes, ExtractResult, Matcher};
use crate::nmap::probes::parse_service_probes;

/// Soft per-matcher time budget; exceeding it is reported, not fatal.
const SLOW_MATCH_BUDGET: Duration = Duration::from_millis(200);

/// Observability hook for matchers that blow the soft time budget.
pub trait SlowMatchReporter: Send + Sync {
    fn slow_match(&self, matcher: &Matcher, elapsed: Duration);
}

/// Default reporter: a `tracing` warning per slow matcher.
#[derive(Debug, Default)]
pub struct TracingSlowReporter;

impl SlowMatchReporter for TracingSlowReporter {
    fn slow_match(&self, matcher: &Matcher, elapsed: Duration) {
        warn!(
            matcher = %matcher.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "slow matcher exceeded soft budget"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatcherSet {
    matchers: Vec<Arc<Matcher>>,
}

impl MatcherSet {
    /// Build a set from corpus text. Every probe×match pair compiles to
    /// one matcher; the first compile error aborts the whole load.
    pub fn load(input: &str) -> Result<MatcherSet> {
        let probes = parse_service_probes(input)?;
        let mut matchers = Vec::new();
        for probe in &probes {
            for rule in &probe.matches {
                matchers.push(Arc::new(Matcher::new(probe, rule)?));
            }
        }
        info!("loaded {} matchers from {} probes", matchers.len(), probes.len());
        Ok(MatcherSet { matchers })
    }

    pub fn load_bytes(input: &[u8]) -> Result<MatcherSet> {
        Self::load(&promote_bytes(input))
    }

    pub fn load_file(path: &std::path::Path) -> Result<MatcherSet> {
        let raw = std::fs::read(path)?;
        Self::load_bytes(&raw)
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Matcher>> {
        self.matchers.iter()
    }

    /// Linear scan, preserving order. Matchers are shared, not recompiled.
    pub fn filter<F: Fn(&Matcher) -> bool>(&self, pred: F) -> MatcherSet {
        MatcherSet {
            matchers: self
                .matchers
                .iter()
                .filter(|m| pred(m))
                .cloned()
                .collect(),
        }
    }

    /// Filter by glob over the `<probe>/<service>` identity. The pattern
    /// supports `*`, `?`, brace groups and comma-separated alternatives.
    /// An empty pattern selects nothing; a malformed one is a
    /// configuration error.
    pub fn filter_glob(&self, pattern: &str) -> Result<MatcherSet> {
        if pattern.is_empty() {
            return Ok(MatcherSet::default());
        }
        let glob = GlobBuilder::new(&format!("{{{}}}", pattern))
            .build()
            .map_err(|e| GrabError::invalid_pattern(pattern, e))?;
        let compiled = glob.compile_matcher();
        Ok(self.filter(|m| compiled.is_match(m.id())))
    }

    /// Run every matcher over the input, in load order, and collect the
    /// hits. Input promotion happens once per call. A matcher that blows
    /// up is counted and skipped; extraction continues.
    pub fn extract(&self, input: &[u8]) -> Vec<ExtractResult> {
        self.extract_with(input, &TracingSlowReporter)
    }

    pub fn extract_with(&self, input: &[u8], reporter: &dyn SlowMatchReporter) -> Vec<ExtractResult> {
        let text = promote_bytes(input);
        let started = Instant::now();
        let mut results = Vec::new();
        let (mut passed, mut errors) = (0u64, 0u64);

        for matcher in &self.matchers {
            let t0 = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                matcher.evaluate(&text).map(|caps| matcher.render(&caps))
            }));
            let elapsed = t0.elapsed();
            if elapsed > SLOW_MATCH_BUDGET {
                reporter.slow_match(matcher, elapsed);
            }
            match outcome {
                Ok(Some(result)) => {
                    passed += 1;
                    results.push(result);
                }
                Ok(None) => {}
                Err(_) => {
                    errors += 1;
                    warn!(matcher = %matcher.id(), "matcher failed at runtime, skipping");
                }
            }
        }

        debug!(
            total = self.matchers.len(),
            passed,
            errors,
            input_len = input.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction finished"
        );
        counter!("matchers_evaluated_total", self.matchers.len() as u64);
        counter!("matchers_passed_total", passed);
        counter!("matchers_errored_total", errors);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORPUS: &str = r#"
Probe TCP NULL q||
match ssh m|^SSH-([\d.]+)-([^\r\n]+)| p/$2/ v/$1/ cpe:/a:ssh:$2/
match ftp m|^220[ -]| p/Generic FTP/
softmatch http m|^HTTP/|

Probe TCP GetRequest q|GET / HTTP/1.0\r\n\r\n|
match http m|^HTTP/1\.[01] \d+ .*Server: ([^\r\n]+)|s p/$1/
"#;

    fn load() -> MatcherSet {
        MatcherSet::load(CORPUS).unwrap()
    }

    #[test]
    fn test_load_preserves_order() {
        let set = load();
        let ids: Vec<String> = set.iter().map(|m| m.id()).collect();
        assert_eq!(
            ids,
            vec!["NULL/ssh", "NULL/ftp", "NULL/http", "GetRequest/http"]
        );
    }

    #[test]
    fn test_compile_error_aborts_load() {
        let bad = "Probe TCP P q||\nmatch x m|(unclosed|\n";
        assert!(matches!(
            MatcherSet::load(bad),
            Err(GrabError::RegexCompile { .. })
        ));
    }

    #[test]
    fn test_filter_glob_identity() {
        let set = load();
        for m in set.iter() {
            let filtered = set.filter_glob(&m.id()).unwrap();
            assert_eq!(filtered.len(), 1, "glob {} should select itself", m.id());
            assert_eq!(filtered.iter().next().unwrap().id(), m.id());
        }
    }

    #[test]
    fn test_filter_glob_patterns() {
        let set = load();
        assert_eq!(set.filter_glob("*/http").unwrap().len(), 2);
        assert_eq!(set.filter_glob("NULL/*").unwrap().len(), 3);
        assert_eq!(set.filter_glob("*/ssh,*/ftp").unwrap().len(), 2);
        assert_eq!(set.filter_glob("*/*").unwrap().len(), 4);
        assert_eq!(set.filter_glob("").unwrap().len(), 0);
        assert_eq!(set.filter_glob("nothing/here").unwrap().len(), 0);
    }

    #[test]
    fn test_filter_glob_bad_pattern() {
        let set = load();
        assert!(matches!(
            set.filter_glob("[unclosed"),
            Err(GrabError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_extract_order_and_content() {
        let set = load();
        let results = set.extract(b"SSH-2.0-OpenSSH_8.3\r\n");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].service, "ssh");
        assert_eq!(results[0].vendor_product_name, "OpenSSH_8.3");
        assert_eq!(results[0].version, "2.0");
        assert_eq!(results[0].cpe, vec!["cpe:/a:ssh:OpenSSH_8.3"]);

        // Two matchers hit; result order equals load order.
        let results = set.extract(b"HTTP/1.1 200 OK\r\nServer: nginx\r\n");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].probe, "NULL");
        assert!(results[0].softmatch);
        assert_eq!(results[1].probe, "GetRequest");
        assert_eq!(results[1].vendor_product_name, "nginx");
    }

    #[test]
    fn test_extract_no_match() {
        let set = load();
        assert!(set.extract(b"nothing recognizable").is_empty());
    }

    #[test]
    fn test_filter_shares_compiled_matchers() {
        let set = load();
        let filtered = set.filter(|m| m.service == "ssh");
        assert_eq!(filtered.len(), 1);
        let results = filtered.extract(b"SSH-2.0-Dropbear");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].vendor_product_name, "Dropbear");
    }
}
