//! Tree build benchmark.
//!
//! Builds trees over synthetic blob corpora and reports per-step latency
//! percentiles (init, full build, validation) as a table or JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use e2e_tests::{axis_centers, blob_vectors, tree_config, TestHarness};
use tree_builder::ConsistencyValidator;

const DEFAULT_ITERATIONS: usize = 3;

#[derive(Parser, Debug)]
#[command(name = "perf_bench", about = "Cluster tree build benchmark harness")]
struct Args {
    #[arg(long, value_enum, default_value = "small")]
    tier: DatasetTier,
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: usize,
    #[arg(long, default_value_t = 64)]
    dim: usize,
    /// Write JSON results here instead of printing a table
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Serialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum DatasetTier {
    Small,
    Medium,
    Large,
}

impl DatasetTier {
    /// (blob count, items per blob)
    fn shape(&self) -> (usize, usize) {
        match self {
            DatasetTier::Small => (8, 250),
            DatasetTier::Medium => (32, 500),
            DatasetTier::Large => (64, 1500),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct StepMetrics {
    p50_ms: f64,
    p90_ms: f64,
    max_ms: f64,
    samples: usize,
}

#[derive(Debug, Serialize)]
struct BenchmarkOutput {
    tier: DatasetTier,
    items: usize,
    dim: usize,
    iterations: usize,
    nodes: u64,
    steps: BTreeMap<String, StepMetrics>,
}

fn main() -> Result<(), String> {
    let args = Args::parse();
    let (blobs, per_blob) = args.tier.shape();
    let centers = axis_centers(blobs, args.dim, 10.0);

    let mut durations: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut nodes = 0;
    for iteration in 0..args.iterations {
        let harness = TestHarness::new();
        harness.load_vectors(&blob_vectors(&centers, per_blob, 1.0, iteration as u64));
        let builder = harness.builder(tree_config(50, 16, 12));

        let start = Instant::now();
        builder.init("bench").map_err(|e| format!("init failed: {e}"))?;
        record(&mut durations, "init", start);

        let start = Instant::now();
        let report = builder
            .run_until_complete()
            .map_err(|e| format!("build failed: {e}"))?;
        record(&mut durations, "build", start);
        if !report.failures.is_empty() {
            return Err(format!("{} nodes failed", report.failures.len()));
        }

        let start = Instant::now();
        let validation = ConsistencyValidator::new(
            harness.storage.clone(),
            chrono::Duration::seconds(3600),
        )
        .validate()
        .map_err(|e| format!("validate failed: {e}"))?;
        record(&mut durations, "validate", start);
        if !validation.is_consistent() {
            return Err(format!("{} violations", validation.violations.len()));
        }
        nodes = validation.node_count;
    }

    let output = BenchmarkOutput {
        tier: args.tier,
        items: blobs * per_blob,
        dim: args.dim,
        iterations: args.iterations,
        nodes,
        steps: durations
            .into_iter()
            .map(|(step, mut values)| {
                values.sort_by(|a, b| a.total_cmp(b));
                let metrics = StepMetrics {
                    p50_ms: percentile(&values, 50.0),
                    p90_ms: percentile(&values, 90.0),
                    max_ms: values.last().copied().unwrap_or(0.0),
                    samples: values.len(),
                };
                (step, metrics)
            })
            .collect(),
    };

    match &args.out {
        Some(path) => {
            let json = serde_json::to_string_pretty(&output)
                .map_err(|e| format!("Failed to serialize results: {e}"))?;
            fs::write(path, json).map_err(|e| format!("Failed to write {path:?}: {e}"))?;
        }
        None => println!("{}", render_table(&output)),
    }
    Ok(())
}

fn record(durations: &mut BTreeMap<String, Vec<f64>>, step: &str, start: Instant) {
    durations
        .entry(step.to_string())
        .or_default()
        .push(start.elapsed().as_secs_f64() * 1000.0);
}

fn percentile(values: &[f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = (percentile / 100.0) * (values.len() as f64 - 1.0);
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        values[low]
    } else {
        let weight = rank - low as f64;
        values[low] + (values[high] - values[low]) * weight
    }
}

fn render_table(output: &BenchmarkOutput) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "Build Benchmark (tier={:?}, items={}, dim={}, iterations={}, nodes={})",
        output.tier, output.items, output.dim, output.iterations, output.nodes
    ));
    lines.push(format!(
        "{:<10} {:>10} {:>10} {:>10}",
        "step", "p50 ms", "p90 ms", "max ms"
    ));
    for (step, metrics) in &output.steps {
        lines.push(format!(
            "{:<10} {:>10.1} {:>10.1} {:>10.1}",
            step, metrics.p50_ms, metrics.p90_ms, metrics.max_ms
        ));
    }
    lines.join("\n")
}
