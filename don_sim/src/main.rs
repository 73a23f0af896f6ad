//! DON Simulator CLI
//!
//! Run the protocol scenarios, or a single request, against a simulated DON.

use clap::Parser;
use don_core::{RequestConfig, ReturnType, SecretsMap};
use don_sim::scenarios::ScenarioId;
use don_sim::scripts;
use don_sim::{RequestReport, ScenarioResult, ScenarioRunner, SimExport};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// DON Deterministic Simulation CLI
#[derive(Parser, Debug)]
#[command(name = "don-sim")]
#[command(about = "Run deterministic request/fulfillment simulations for a DON", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of DON nodes
    #[arg(short, long, default_value = "4")]
    nodes: usize,

    /// Quorum threshold (default: simple majority)
    #[arg(short, long)]
    threshold: Option<usize>,

    /// Scenario to run (happy_path, slow_nodes, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Run a single request from a JSON request config instead of scenarios
    #[arg(long, conflicts_with = "source")]
    request_config: Option<String>,

    /// Run a single request: built-in script name or path to a source file
    #[arg(long)]
    source: Option<String>,

    /// Expected return type for --source (uint256, int256, string, bytes)
    #[arg(long, default_value = "uint256")]
    return_type: String,

    /// Argument passed to the script (repeatable)
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Callback gas limit for --source / --request-config
    #[arg(long)]
    gas_limit: Option<u32>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Write the full report to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

/// Resolves `--request-config` or `--source` into a request, if either is set.
fn custom_request(args: &Args) -> Option<RequestConfig> {
    let mut config = if let Some(path) = &args.request_config {
        let text = std::fs::read_to_string(path)
            .unwrap_or_else(|e| fail(format!("cannot read {}: {}", path, e)));
        RequestConfig::from_json(&text).unwrap_or_else(|e| fail(e))
    } else {
        let source = args.source.as_ref()?;
        let text = match scripts::builtin_source(source) {
            Some(builtin) => builtin.to_string(),
            None => std::fs::read_to_string(source)
                .unwrap_or_else(|e| fail(format!("cannot read {}: {}", source, e))),
        };
        let return_type: ReturnType = args.return_type.parse().unwrap_or_else(|e| fail(e));
        RequestConfig::new(text, return_type).with_args(args.args.iter().cloned())
    };

    if let Some(gas_limit) = args.gas_limit {
        config = config.with_gas_limit(gas_limit);
    }
    if config.per_node_secrets.is_empty() {
        config.per_node_secrets = vec![SecretsMap::new(); args.nodes];
    }
    Some(config)
}

/// Runs one request on a paused-clock runtime and reports it.
fn run_custom(runner: &ScenarioRunner, params: &RequestConfig, args: &Args) -> bool {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap_or_else(|e| fail(format!("could not start runtime: {}", e)));

    let outcome = match runtime.block_on(runner.run_request(params)) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("✗ request rejected: {}", e);
            return false;
        }
    };
    let report = RequestReport::from_outcome(&outcome);
    let delivered = outcome.decoded.is_ok();

    let json = serde_json::to_string_pretty(&report).unwrap_or_else(|e| fail(e));
    if args.json {
        println!("{}", json);
    } else {
        for node in &report.nodes {
            info!(
                "  slot-{}: {}",
                node.slot,
                match (&node.value_hex, &node.error_kind) {
                    (Some(value), _) => format!("0x{}", value),
                    (None, Some(kind)) => format!(
                        "{}: {}",
                        kind,
                        node.message.as_deref().unwrap_or_default()
                    ),
                    (None, None) => "no result".to_string(),
                }
            );
        }
        if delivered {
            info!("✓ {} -> {}", report.request_id, report.decoded);
        } else {
            error!("✗ {} -> {}", report.request_id, report.decoded);
        }
        info!("  cost: {} juels", report.total_cost_juels);
    }

    if let Some(path) = &args.export {
        match std::fs::write(Path::new(path), json) {
            Ok(()) => info!("Exported request report to {}", path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
    }
    delivered
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("DON Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default()
    } else {
        args.seed
    };

    let runner_for = |seed: u64| {
        let runner = ScenarioRunner::new(seed, args.nodes);
        match args.threshold {
            Some(threshold) => runner.with_threshold(threshold),
            None => runner,
        }
    };

    // Single request mode
    if let Some(params) = custom_request(&args) {
        if !run_custom(&runner_for(base_seed), &params, &args) {
            std::process::exit(1);
        }
        return;
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<_> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut export = SimExport::new();

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = runner_for(seed);

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            export.add(&result);
            all_results.push(result);
        }
    }

    if let Some(path) = &args.export {
        match export.write_to_file(path) {
            Ok(()) => info!("Exported {} scenario runs to {}", export.total, path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
    }

    if args.json {
        match export.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => fail(e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if export.failed == 0 {
            info!("✅ All {} scenario runs passed!", export.total);
        } else {
            error!("❌ {}/{} scenario runs failed!", export.failed, export.total);

            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if export.failed > 0 {
        std::process::exit(1);
    }
}
