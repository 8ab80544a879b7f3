//! # bannergrab
//!
//! A concurrent network banner grabber and service fingerprinter.
//!
//! For each input target (IP, optional domain, routing tag, optional
//! port), the pipeline dispatches protocol scan modules, collects the
//! banners they capture, and matches the bytes against the
//! `nmap-service-probes` corpus to produce structured product, version,
//! OS and CPE identifications.
//!
//! ## Architecture
//!
//! - **Fingerprinting engine** (`nmap`): corpus parsing, regex and
//!   template compilation, banner extraction.
//! - **Scan pipeline** (`pipeline`): bounded staged queues, scan and
//!   fingerprint worker pools, an ordered loss-free shutdown.
//! - **Scan modules** (`modules`): banner, telnet and RDP, all honoring
//!   the same [`module::ScanModule`] contract.

pub mod cli;
pub mod config;
pub mod conn;
pub mod diagnostics;
pub mod error;
pub mod grab;
pub mod input;
pub mod logging;
pub mod module;
pub mod modules;
pub mod monitor;
pub mod nmap;
pub mod output;
pub mod pipeline;

// Re-exports for convenience
pub use crate::{
    config::AppConfig,
    error::{GrabError, Result},
    grab::{Grab, ScanStatus, ScanTarget},
    nmap::MatcherSet,
    pipeline::Pipeline,
};
