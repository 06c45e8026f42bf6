//! Offline smoke harness.
//!
//! Loads a deployment configuration, installs its cache generation against
//! the live origin, then resolves every manifest entry and the navigation
//! fallback through the cache manager and prints a JSON report.

use offline_common::{init_logging, LogConfig, LogFormat, OfflineConfig};
use offline_sw::{
    CacheManager, FetchOutcome, FetcherConfig, HttpFetcher, MemoryCacheStorage, Request,
};
use serde_json::json;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use url::Url;

/// Collects operation durations for the report.
#[derive(Default)]
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();

        for (op, durations) in &self.timings {
            if durations.is_empty() {
                continue;
            }

            let millis: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let total_ms: f64 = millis.iter().sum();
            let avg_ms = total_ms / millis.len() as f64;
            let min_ms = millis.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": millis.len(),
                    "total_ms": round2(total_ms),
                    "avg_ms": round2(avg_ms),
                    "min_ms": round2(min_ms),
                    "max_ms": round2(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse command line arguments
struct Args {
    config: Option<String>,
    base_url: Option<String>,
    log: LogFormat,
    output: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;
        let mut base_url = None;
        let mut log = LogFormat::Compact;
        let mut output = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => config = args.next(),
                "--base-url" => base_url = args.next(),
                "--log" => {
                    if let Some(val) = args.next() {
                        log = val.parse().unwrap_or_else(|e| {
                            eprintln!("Warning: {}, using compact", e);
                            LogFormat::Compact
                        });
                    }
                }
                "--output" => output = args.next(),
                other => eprintln!("Warning: ignoring unknown argument {}", other),
            }
        }

        Self {
            config,
            base_url,
            log,
            output,
        }
    }

    fn load_config(&self) -> offline_common::Result<OfflineConfig> {
        let mut config = match &self.config {
            Some(path) => OfflineConfig::load(path)?,
            None => OfflineConfig::default(),
        };
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn describe(url: &Url, outcome: &FetchOutcome, elapsed: Duration) -> serde_json::Value {
    let mut entry = json!({
        "url": url.as_str(),
        "outcome": outcome.label(),
        "ms": round2(elapsed.as_secs_f64() * 1000.0),
    });
    if let Some(response) = outcome.response() {
        entry["status"] = json!(response.status);
        entry["bytes"] = json!(response.body.len());
    }
    if let FetchOutcome::Unresolved(err) = outcome {
        entry["error"] = json!(err.to_string());
    }
    entry
}

fn emit(report: &serde_json::Value, output: Option<&str>) {
    let text = match serde_json::to_string_pretty(report) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "Failed to serialize report");
            return;
        }
    };

    match output {
        Some(path) => match std::fs::write(path, text) {
            Ok(()) => info!(path, "Report written"),
            Err(e) => error!(path, error = %e, "Failed to write report"),
        },
        None => println!("{}", text),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(LogConfig::default().with_format(args.log));

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(category = e.category(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let origin = match config.base() {
        Ok(origin) => origin,
        Err(e) => {
            error!(error = %e, "Invalid base URL");
            return ExitCode::FAILURE;
        }
    };
    let fetcher = match HttpFetcher::new(&origin, FetcherConfig::default()) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            error!(error = %e, "Failed to build HTTP client");
            return ExitCode::FAILURE;
        }
    };
    let storage = Arc::new(MemoryCacheStorage::new());
    let manager = match CacheManager::from_config(&config, storage, fetcher) {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "Failed to set up cache manager");
            return ExitCode::FAILURE;
        }
    };

    info!(
        origin = %origin,
        cache = manager.cache_name(),
        assets = manager.manifest().len(),
        "Starting offline smoke run"
    );

    let mut perf = PerfTiming::default();
    let started = Instant::now();
    let installed = manager.install().await;
    perf.record("install", started.elapsed());

    let entries = match installed {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "Install failed");
            let report = json!({
                "cache": manager.cache_name(),
                "install": { "ok": false, "error": e.to_string() },
                "timings": perf.summary(),
            });
            emit(&report, args.output.as_deref());
            return ExitCode::FAILURE;
        }
    };

    let pruned = match manager.activate().await {
        Ok(report) => report.deleted,
        Err(e) => {
            warn!(error = %e, "Activation could not list generations");
            Vec::new()
        }
    };

    let mut resources = Vec::new();
    for url in manager.manifest().urls() {
        let started = Instant::now();
        let outcome = manager.resolve(Request::get(url.clone())).await;
        perf.record("resolve", started.elapsed());
        resources.push(describe(url, &outcome, started.elapsed()));
    }

    let fallback = match config.fallback_url() {
        Ok(url) => {
            let started = Instant::now();
            let outcome = manager.resolve(Request::navigate(url.clone())).await;
            perf.record("navigate", started.elapsed());
            describe(&url, &outcome, started.elapsed())
        }
        Err(e) => json!({ "error": e.to_string() }),
    };
    manager.settle().await;

    let report = json!({
        "cache": manager.cache_name(),
        "install": { "ok": true, "entries": entries },
        "pruned": pruned,
        "resources": resources,
        "fallback": fallback,
        "timings": perf.summary(),
    });
    emit(&report, args.output.as_deref());

    info!(entries, "Smoke run finished");
    ExitCode::SUCCESS
}
