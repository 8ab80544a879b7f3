//! bannergrab entry point
//!
//! Initializes logging, loads the service-probe corpus, builds the
//! requested scan modules, runs the pipeline, and writes the summary
//! record at shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::info;

use bannergrab::cli::{Cli, Command};
use bannergrab::config::{AppConfig, ModuleSpec, MultiConfig};
use bannergrab::module::{ModuleRegistry, ScanModule};
use bannergrab::modules::{BannerModule, RdpModule, TelnetModule};
use bannergrab::monitor::Monitor;
use bannergrab::pipeline::Pipeline;
use bannergrab::{diagnostics, logging, output, MatcherSet};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(&cli.log_level, &cli.log_format, cli.log_file.as_deref())?;

    let config = AppConfig::from_cli(&cli)?;
    let matchers = Arc::new(
        MatcherSet::load_file(&config.service_probes).with_context(|| {
            format!(
                "cannot load service probes from {}",
                config.service_probes.display()
            )
        })?,
    );

    let mut registry = ModuleRegistry::new();
    match &cli.command {
        Command::Banner(flags) => {
            registry.register(Arc::new(BannerModule::new(flags.clone(), &matchers)?))?;
        }
        Command::Telnet(flags) => {
            registry.register(Arc::new(TelnetModule::new(flags.clone(), &matchers)?))?;
        }
        Command::Rdp(flags) => {
            registry.register(Arc::new(RdpModule::new(flags.clone(), &matchers)?))?;
        }
        Command::Multi(args) => {
            for spec in MultiConfig::load(&args.config)?.modules {
                let module: Arc<dyn ScanModule> = match spec {
                    ModuleSpec::Banner(flags) => Arc::new(BannerModule::new(flags, &matchers)?),
                    ModuleSpec::Telnet(flags) => Arc::new(TelnetModule::new(flags, &matchers)?),
                    ModuleSpec::Rdp(flags) => Arc::new(RdpModule::new(flags, &matchers)?),
                };
                registry.register(module)?;
            }
        }
    }

    let monitor = Arc::new(Monitor::with_callback(Box::new(|_host| {
        diagnostics::dump_heap_snapshot();
    })));
    let snapshot_ticker = diagnostics::spawn_snapshot_ticker(Duration::from_secs(300));

    let input: Box<dyn AsyncBufRead + Unpin> = if config.input_file == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(&config.input_file)
            .await
            .with_context(|| format!("cannot open input file {}", config.input_file))?;
        Box::new(BufReader::new(file))
    };
    let sink = output::open_sink(&config.output_file).await?;

    let start = Utc::now();
    info!("started grab at {}", start.to_rfc3339());

    let pipeline = Pipeline::new(
        config.pipeline_config(),
        Arc::new(registry),
        matchers,
        monitor.clone(),
    );
    let report = pipeline.run(input, sink).await?;

    let end = Utc::now();
    info!(
        accepted = report.feed.accepted,
        rejected = report.feed.rejected,
        grabs = report.grabs,
        "finished grab at {}",
        end.to_rfc3339()
    );
    snapshot_ticker.abort();

    let summary = monitor.summary(start, end).await;
    let encoded = serde_json::to_vec(&summary).context("cannot serialize summary")?;
    if config.metadata_file == "-" {
        println!("{}", String::from_utf8_lossy(&encoded));
    } else {
        std::fs::write(&config.metadata_file, &encoded)
            .with_context(|| format!("cannot write summary to {}", config.metadata_file))?;
    }

    diagnostics::dump_heap_snapshot();
    diagnostics::dump_cpu_profile();
    Ok(())
}
