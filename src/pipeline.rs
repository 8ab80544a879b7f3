//! The staged scan pipeline
//!
//! Input feeder → scan workers → fingerprint workers → output sink,
//! over bounded channels with backpressure at every stage. Shutdown is
//! strictly ordered so that every accepted target reaches the sink:
//! the feeder closes the process queue, the scan workers drain it and
//! close the matchers queue behind themselves, the fingerprint workers
//! drain that and close the output queue, and the sink drains last.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{mpsc, Barrier, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{GrabError, Result};
use crate::grab::{Grab, ScanResponse, ScanStatus, ScanTarget};
use crate::input::{self, FeedStats};
use crate::module::ModuleRegistry;
use crate::monitor::Monitor;
use crate::nmap::MatcherSet;
use crate::output;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Scan worker count (I/O bound pool).
    pub senders: usize,
    /// Fingerprint worker count (CPU bound pool).
    pub nmap_matchers: usize,
    /// How many times to run the full module sequence per target.
    pub connections_per_host: u32,
    /// Keep invoking modules for a target after one errored.
    pub continue_on_error: bool,
    /// Stop invoking modules for a target after the first SUCCESS.
    pub break_on_success: bool,
    /// Keep debug fields in the serialized output.
    pub include_debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            senders: 1000,
            nmap_matchers: 4,
            connections_per_host: 1,
            continue_on_error: false,
            break_on_success: false,
            include_debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineReport {
    pub feed: FeedStats,
    /// Grab records that reached the output queue.
    pub grabs: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<ModuleRegistry>,
    matchers: Arc<MatcherSet>,
    monitor: Arc<Monitor>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<ModuleRegistry>,
        matchers: Arc<MatcherSet>,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            config,
            registry,
            matchers,
            monitor,
        }
    }

    /// Run the pipeline to completion over the given input and output.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<PipelineReport>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if self.registry.is_empty() {
            return Err(GrabError::config("no scan modules registered"));
        }

        let senders = self.config.senders.max(1);
        let matcher_workers = self.config.nmap_matchers.max(1);

        let (process_tx, process_rx) = mpsc::channel::<ScanTarget>(senders * 4);
        let (matchers_tx, matchers_rx) = mpsc::channel::<Grab>(matcher_workers * 8);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(senders * 2);

        let process_rx = Arc::new(Mutex::new(process_rx));
        let matchers_rx = Arc::new(Mutex::new(matchers_rx));
        let grabs = Arc::new(AtomicU64::new(0));

        // Fingerprint workers come up first; the barrier holds the rest
        // of the pipeline back until every worker owns its subsets.
        let barrier = Arc::new(Barrier::new(matcher_workers + 1));
        let mut matcher_handles = Vec::with_capacity(matcher_workers);
        for _ in 0..matcher_workers {
            matcher_handles.push(tokio::spawn(fingerprint_worker(
                self.registry.clone(),
                self.matchers.clone(),
                self.config.clone(),
                barrier.clone(),
                matchers_rx.clone(),
                output_tx.clone(),
                grabs.clone(),
            )));
        }
        barrier.wait().await;
        debug!(workers = matcher_workers, "fingerprint workers ready");

        let sink_handle = tokio::spawn(output::run_sink(output_rx, output));

        let mut scan_handles = Vec::with_capacity(senders);
        for sender_id in 0..senders {
            scan_handles.push(tokio::spawn(scan_worker(
                sender_id,
                self.registry.clone(),
                self.monitor.clone(),
                self.config.clone(),
                process_rx.clone(),
                matchers_tx.clone(),
            )));
        }
        drop(matchers_tx);
        drop(output_tx);

        // The feeder runs on this task; a cancel signal closes it and
        // lets the ordered shutdown drain whatever is in flight.
        let feed = {
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            tokio::select! {
                stats = input::feed_targets(input, &process_tx) => stats?,
                _ = &mut ctrl_c => {
                    info!("cancellation received, draining in-flight work");
                    FeedStats::default()
                }
            }
        };
        drop(process_tx);

        for handle in scan_handles {
            handle
                .await
                .map_err(|e| GrabError::output(format!("scan worker failed: {}", e)))?;
        }
        for handle in matcher_handles {
            handle
                .await
                .map_err(|e| GrabError::output(format!("fingerprint worker failed: {}", e)))?;
        }
        sink_handle
            .await
            .map_err(|e| GrabError::output(format!("output sink failed: {}", e)))??;

        Ok(PipelineReport {
            feed,
            grabs: grabs.load(Ordering::Relaxed),
        })
    }
}

async fn scan_worker(
    sender_id: usize,
    registry: Arc<ModuleRegistry>,
    monitor: Arc<Monitor>,
    config: PipelineConfig,
    process_rx: Arc<Mutex<mpsc::Receiver<ScanTarget>>>,
    matchers_tx: mpsc::Sender<Grab>,
) {
    for module in registry.iter() {
        if let Err(e) = module.init_per_sender(sender_id).await {
            warn!(module = module.name(), sender_id, error = %e, "per-sender init failed");
        }
    }

    loop {
        let target = { process_rx.lock().await.recv().await };
        let Some(target) = target else { break };

        for _run in 0..config.connections_per_host.max(1) {
            let grab = grab_target(&target, &registry, &monitor, &config).await;
            if matchers_tx.send(grab).await.is_err() {
                return;
            }
        }
        monitor.target_finished(&target.host());
    }
}

/// Run every triggered module against one target, in registration
/// order, honoring the early-exit policy. A panicking module is
/// contained: the panic is logged and recorded as an unknown-error
/// response, and the target's remaining processing continues.
pub async fn grab_target(
    target: &ScanTarget,
    registry: &ModuleRegistry,
    monitor: &Monitor,
    config: &PipelineConfig,
) -> Grab {
    let mut responses = Vec::new();

    for module in registry.iter() {
        if target.tag() != module.trigger() {
            continue;
        }

        let outcome = std::panic::AssertUnwindSafe(module.scan(target))
            .catch_unwind()
            .await;
        let response = match outcome {
            Ok(outcome) => ScanResponse::from_outcome(module.protocol(), outcome),
            Err(_) => {
                error!(
                    module = module.name(),
                    target = %target,
                    "panic in module scan, recording unknown-error"
                );
                ScanResponse {
                    status: ScanStatus::UnknownError,
                    protocol: module.protocol().to_string(),
                    result: None,
                    timestamp: Utc::now().to_rfc3339(),
                    error: Some("panic in module scan".to_string()),
                }
            }
        };

        monitor.record(module.name(), response.status).await;
        let had_error = response.error.is_some();
        let status = response.status;
        responses.push((module.name().to_string(), response));

        if had_error && !config.continue_on_error {
            break;
        }
        if status == ScanStatus::Success && config.break_on_success {
            break;
        }
    }

    Grab::from_responses(target, responses)
}

async fn fingerprint_worker(
    registry: Arc<ModuleRegistry>,
    matchers: Arc<MatcherSet>,
    config: PipelineConfig,
    barrier: Arc<Barrier>,
    matchers_rx: Arc<Mutex<mpsc::Receiver<Grab>>>,
    output_tx: mpsc::Sender<Vec<u8>>,
    grabs: Arc<AtomicU64>,
) {
    // Each worker owns its filtered subsets; the compiled matchers
    // inside are shared and immutable.
    let mut subsets: Vec<MatcherSet> = Vec::with_capacity(registry.len());
    for module in registry.iter() {
        match matchers.filter_glob(module.product_matchers_glob()) {
            Ok(subset) => subsets.push(subset),
            Err(e) => {
                // Globs were validated at module init, so this is a bug,
                // not a user error. Degrade to an empty subset.
                error!(module = module.name(), error = %e, "matcher subset rebuild failed");
                subsets.push(MatcherSet::default());
            }
        }
    }
    barrier.wait().await;

    loop {
        let grab = { matchers_rx.lock().await.recv().await };
        let Some(mut grab) = grab else { break };

        attach_products(&mut grab, &registry, &subsets);
        match output::encode_grab(&grab, config.include_debug) {
            Ok(bytes) => {
                if output_tx.send(bytes).await.is_err() {
                    return;
                }
                grabs.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!(error = %e, "unable to encode grab"),
        }
    }
}

/// Enrich every triggered module entry that carries a result.
fn attach_products(grab: &mut Grab, registry: &ModuleRegistry, subsets: &[MatcherSet]) {
    for (module, subset) in registry.iter().zip(subsets.iter()) {
        if grab.tag != module.trigger() {
            continue;
        }
        let Some(response) = grab.response_mut(module.name()) else {
            continue;
        };
        if let Some(result) = response.result.as_mut() {
            module.attach_products(subset, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grab::ScanOutcome;
    use crate::module::ScanModule;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::io::AsyncReadExt;

    const CORPUS: &str = "Probe TCP NULL q||\nmatch ssh m|^SSH-([\\d.]+)-(\\S+)| p/$2/ v/$1/\n";

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct TestModule {
        name: String,
        trigger: String,
        glob: String,
        behavior: Behavior,
    }

    impl TestModule {
        fn new(name: &str, trigger: &str, behavior: Behavior) -> Arc<dyn ScanModule> {
            Arc::new(Self {
                name: name.to_string(),
                trigger: trigger.to_string(),
                glob: String::new(),
                behavior,
            })
        }

        fn with_glob(name: &str, trigger: &str, glob: &str) -> Arc<dyn ScanModule> {
            Arc::new(Self {
                name: name.to_string(),
                trigger: trigger.to_string(),
                glob: glob.to_string(),
                behavior: Behavior::Succeed,
            })
        }
    }

    #[async_trait]
    impl ScanModule for TestModule {
        fn name(&self) -> &str {
            &self.name
        }
        fn trigger(&self) -> &str {
            &self.trigger
        }
        fn protocol(&self) -> &'static str {
            "test"
        }
        fn product_matchers_glob(&self) -> &str {
            &self.glob
        }
        async fn scan(&self, _target: &ScanTarget) -> ScanOutcome {
            match self.behavior {
                Behavior::Succeed => {
                    ScanOutcome::success(json!({"banner": "SSH-2.0-OpenSSH_8.3"}))
                }
                Behavior::Fail => {
                    ScanOutcome::failure(GrabError::connection_timeout("test"), None)
                }
                Behavior::Panic => panic!("deliberate test panic"),
            }
        }
        fn attach_products(&self, matchers: &MatcherSet, result: &mut Value) {
            let Some(banner) = result.get("banner").and_then(Value::as_str) else {
                return;
            };
            let products = matchers.extract(banner.as_bytes());
            if !products.is_empty() {
                result["products"] = serde_json::to_value(products).unwrap_or(Value::Null);
            }
        }
    }

    async fn run_case(
        config: PipelineConfig,
        modules: Vec<Arc<dyn ScanModule>>,
        input: &str,
    ) -> (PipelineReport, Vec<Value>, Arc<Monitor>) {
        let mut registry = ModuleRegistry::new();
        for module in modules {
            registry.register(module).unwrap();
        }
        let matchers = Arc::new(MatcherSet::load(CORPUS).unwrap());
        let monitor = Arc::new(Monitor::new());
        let pipeline = Pipeline::new(config, Arc::new(registry), matchers, monitor.clone());

        let (writer, mut reader) = tokio::io::duplex(1 << 20);
        let read_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let report = pipeline.run(input.as_bytes(), writer).await.unwrap();
        let raw = read_task.await.unwrap();
        let records = raw
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect();
        (report, records, monitor)
    }

    fn small(senders: usize, matchers: usize) -> PipelineConfig {
        PipelineConfig {
            senders,
            nmap_matchers: matchers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_completeness() {
        let input = "10.0.0.1\n10.0.0.2\n10.0.0.3\n10.0.0.4\n10.0.0.5\n";
        let config = PipelineConfig {
            connections_per_host: 2,
            ..small(3, 2)
        };
        let (report, records, monitor) = run_case(
            config,
            vec![TestModule::new("m", "", Behavior::Succeed)],
            input,
        )
        .await;

        assert_eq!(report.feed.accepted, 5);
        assert_eq!(report.grabs, 10);
        assert_eq!(records.len(), 10);
        assert_eq!(monitor.targets_finished(), 5);
        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot["m"]["success"], 10);
    }

    #[tokio::test]
    async fn test_completeness_with_failing_and_panicking_modules() {
        let input = "10.0.0.1\n10.0.0.2\n10.0.0.3\n";
        let config = PipelineConfig {
            continue_on_error: true,
            ..small(2, 2)
        };
        let (report, records, _) = run_case(
            config,
            vec![
                TestModule::new("bad", "", Behavior::Fail),
                TestModule::new("boom", "", Behavior::Panic),
                TestModule::new("good", "", Behavior::Succeed),
            ],
            input,
        )
        .await;

        // Per-target failures and panics never lose records.
        assert_eq!(report.grabs, 3);
        assert_eq!(records.len(), 3);
        for record in &records {
            let data = record.get("data").unwrap();
            assert_eq!(data["bad"]["status"], "connection-timeout");
            assert_eq!(data["boom"]["status"], "unknown-error");
            assert_eq!(data["good"]["status"], "success");
        }
    }

    #[tokio::test]
    async fn test_trigger_routing() {
        let input = "10.0.0.1,,t2\n";
        let (_, records, _) = run_case(
            small(1, 1),
            vec![
                TestModule::new("m1", "t1", Behavior::Succeed),
                TestModule::new("m2", "t2", Behavior::Succeed),
                TestModule::new("m3", "t3", Behavior::Succeed),
            ],
            input,
        )
        .await;

        assert_eq!(records.len(), 1);
        let data = records[0].get("data").unwrap().as_object().unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("m2"));
    }

    #[tokio::test]
    async fn test_untagged_target_matches_empty_trigger() {
        let input = "10.0.0.1\n";
        let (_, records, _) = run_case(
            small(1, 1),
            vec![
                TestModule::new("tagged", "t1", Behavior::Succeed),
                TestModule::new("untagged", "", Behavior::Succeed),
            ],
            input,
        )
        .await;
        let data = records[0].get("data").unwrap().as_object().unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("untagged"));
    }

    #[tokio::test]
    async fn test_break_on_success() {
        let input = "10.0.0.1,,t\n";
        let config = PipelineConfig {
            break_on_success: true,
            ..small(1, 1)
        };
        let (_, records, _) = run_case(
            config,
            vec![
                TestModule::new("first", "t", Behavior::Succeed),
                TestModule::new("second", "t", Behavior::Succeed),
            ],
            input,
        )
        .await;
        let data = records[0].get("data").unwrap().as_object().unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("first"));
    }

    #[tokio::test]
    async fn test_stop_on_error_by_default() {
        let input = "10.0.0.1\n";
        let (_, records, _) = run_case(
            small(1, 1),
            vec![
                TestModule::new("bad", "", Behavior::Fail),
                TestModule::new("good", "", Behavior::Succeed),
            ],
            input,
        )
        .await;
        let data = records[0].get("data").unwrap().as_object().unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("bad"));
    }

    #[tokio::test]
    async fn test_products_attached_end_to_end() {
        let input = "10.0.0.1\n";
        let (_, records, _) = run_case(
            small(1, 1),
            vec![TestModule::with_glob("m", "", "*/ssh")],
            input,
        )
        .await;

        let products = &records[0]["data"]["m"]["result"]["products"];
        assert_eq!(products[0]["vendor_product_name"], "OpenSSH_8.3");
        assert_eq!(products[0]["version"], "2.0");
    }

    #[tokio::test]
    async fn test_concurrent_workers_produce_identical_records() {
        let input = "10.0.0.1\n10.0.0.1\n10.0.0.1\n10.0.0.1\n";
        let (_, mut records, _) = run_case(
            small(4, 4),
            vec![TestModule::with_glob("m", "", "*/ssh")],
            input,
        )
        .await;

        // Strip the per-response timestamps, then every record must be
        // byte-identical regardless of which worker produced it.
        for record in &mut records {
            record["data"]["m"]
                .as_object_mut()
                .unwrap()
                .remove("timestamp");
        }
        let first = serde_json::to_string(&records[0]).unwrap();
        for record in &records[1..] {
            assert_eq!(serde_json::to_string(record).unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_config_error() {
        let registry = Arc::new(ModuleRegistry::new());
        let matchers = Arc::new(MatcherSet::default());
        let monitor = Arc::new(Monitor::new());
        let pipeline = Pipeline::new(PipelineConfig::default(), registry, matchers, monitor);
        let (writer, _reader) = tokio::io::duplex(64);
        let err = pipeline.run(&b""[..], writer).await.unwrap_err();
        assert!(matches!(err, GrabError::Config { .. }));
    }
}
