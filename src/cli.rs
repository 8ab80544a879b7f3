//! Command-line interface definition
//!
//! Global pipeline flags precede a module subcommand. Each protocol
//! module is a subcommand carrying its own flags; `multi` runs several
//! modules described in a TOML file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::modules::{BannerFlags, RdpFlags, TelnetFlags};

#[derive(Parser, Debug)]
#[command(
    name = "bannergrab",
    about = "Concurrent network banner grabber with nmap-service-probes fingerprinting",
    long_about = "Reads targets from an input list, dispatches them to protocol scan \
                  modules, matches the captured banners against the nmap-service-probes \
                  corpus, and writes one JSON record per grab."
)]
pub struct Cli {
    /// Number of scan workers
    #[arg(long, default_value_t = 1000)]
    pub senders: usize,

    /// Number of fingerprint (matcher) workers
    #[arg(long = "nmap-matchers", default_value_t = 4)]
    pub nmap_matchers: usize,

    /// Connections to open per host (each produces its own record)
    #[arg(long = "connections-per-host", default_value_t = 1)]
    pub connections_per_host: u32,

    /// Keep invoking modules for a target after one errored
    #[arg(long = "continue-on-error")]
    pub continue_on_error: bool,

    /// Stop invoking modules for a target after the first success
    #[arg(long = "break-on-success")]
    pub break_on_success: bool,

    /// Input target list, one per line ("-" for stdin)
    #[arg(long = "input-file", default_value = "-", value_name = "PATH")]
    pub input_file: String,

    /// Output destination for grab records ("-" for stdout)
    #[arg(long = "output-file", default_value = "-", value_name = "PATH")]
    pub output_file: String,

    /// Destination for the shutdown summary record ("-" for stdout)
    #[arg(long = "metadata-file", default_value = "-", value_name = "PATH")]
    pub metadata_file: String,

    /// Path to the nmap-service-probes corpus
    #[arg(long = "service-probes", default_value = "nmap-service-probes", value_name = "PATH")]
    pub service_probes: PathBuf,

    /// Include debug fields in the output records
    #[arg(long)]
    pub verbose: bool,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Logging format (pretty, json)
    #[arg(long = "log-format", default_value = "pretty")]
    pub log_format: String,

    /// Optional log file
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch a raw banner by sending a static probe
    Banner(BannerFlags),
    /// Fetch a telnet banner and the negotiated options
    Telnet(TelnetFlags),
    /// Fetch an RDP negotiation banner
    Rdp(RdpFlags),
    /// Run several modules described in a TOML file
    Multi(MultiArgs),
}

#[derive(clap::Args, Debug)]
pub struct MultiArgs {
    /// Module configuration file
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_banner_subcommand() {
        let cli = Cli::parse_from([
            "bannergrab",
            "--senders",
            "8",
            "--nmap-matchers",
            "2",
            "--break-on-success",
            "banner",
            "--port",
            "2222",
            "--probe",
            "\\r\\n",
            "--product-matchers",
            "*/ssh",
        ]);
        assert_eq!(cli.senders, 8);
        assert_eq!(cli.nmap_matchers, 2);
        assert!(cli.break_on_success);
        match cli.command {
            Command::Banner(flags) => {
                assert_eq!(flags.base.port, Some(2222));
                assert_eq!(flags.probe, "\\r\\n");
                assert_eq!(flags.product_matchers, "*/ssh");
            }
            other => panic!("wrong subcommand: {:?}", other),
        }
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::parse_from(["bannergrab", "telnet"]);
        assert_eq!(cli.senders, 1000);
        assert_eq!(cli.input_file, "-");
        match cli.command {
            Command::Telnet(flags) => {
                assert_eq!(flags.product_matchers, "*/telnet");
                assert!(flags.base.port.is_none());
            }
            other => panic!("wrong subcommand: {:?}", other),
        }
    }

    #[test]
    fn test_parse_multi() {
        let cli = Cli::parse_from(["bannergrab", "multi", "--config", "modules.toml"]);
        match cli.command {
            Command::Multi(args) => assert_eq!(args.config, PathBuf::from("modules.toml")),
            other => panic!("wrong subcommand: {:?}", other),
        }
    }
}
