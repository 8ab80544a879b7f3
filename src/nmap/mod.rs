//! Nmap service-probe fingerprinting engine
//!
//! Loads the `nmap-service-probes` corpus, compiles every match rule
//! together with its templated version-info bindings, and evaluates
//! captured banners into structured product identifications.

pub mod matcher;
pub mod matchers;
pub mod probes;
pub mod template;

pub use matcher::{promote_bytes, ExtractResult, Matcher};
pub use matchers::{MatcherSet, SlowMatchReporter, TracingSlowReporter};
pub use probes::{parse_service_probes, MatchBindings, ProbeMatch, ServiceProbe, Transport};
pub use template::Template;
