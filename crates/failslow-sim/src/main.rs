//! failslow-sim - synthetic training traces for slow-node detection
//!
//! Usage:
//!   failslow-sim generate --tp 4 --dp 2 --pp 2 --slow 5:3 -o traces.json
//!   failslow-sim run --slow 5:3:12 --lanes cal,comm
//!   failslow-sim run --tp 8 --dp 1 --pp 1 --seed 7

use std::fs;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use failslow_core::config::{JobConfig, MetricConfig};
use failslow_core::engine::SlowNodeEngine;
use failslow_core::error::DetectError;
use failslow_sim::{GeneratorConfig, SimTopology, SlowMode, SlowRank, TraceGenerator};

/// Covers every lane the simulator emits. One-second windows line up with
/// the default step interval, and the single-window alarm filter keeps the
/// lone onset flag a step slowdown produces.
const DEFAULT_METRIC_CONFIG: &str = r#"{
    "HcclAllGather": {
        "aggregation": {"during_s": 1, "funcs": [{"func": "mean"}]},
        "type": "compute",
        "time_detector": {"type": "SlidingWindowKSigmaDetector", "alarm_filter_window_size": 1},
        "space_detector": {"type": "OuterDataDetector"}
    },
    "HcclAllGather_launch": {
        "aggregation": {"during_s": 1, "funcs": [{"func": "mean"}]},
        "type": "compute",
        "time_detector": {"type": "SlidingWindowKSigmaDetector", "alarm_filter_window_size": 1}
    },
    "HcclAllreduce": {
        "aggregation": {"during_s": 1, "funcs": [{"func": "mean"}]},
        "type": "compute",
        "time_detector": {"type": "SlidingWindowKSigmaDetector", "alarm_filter_window_size": 1},
        "space_detector": {"type": "OuterDataDetector"}
    },
    "HcclBatchSendRecv": {
        "aggregation": {"during_s": 1, "funcs": [{"func": "mean"}, {"func": "percentile", "func_params": {"q": 90}}]},
        "type": "network",
        "time_detector": {"type": "SlidingWindowKSigmaDetector", "alarm_filter_window_size": 1},
        "space_detector": {"type": "OuterDataDetector"}
    }
}"#;

#[derive(Parser)]
#[command(name = "failslow-sim")]
#[command(about = "Synthetic HCCL trace generation with controlled slow-rank injection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Job shape and injection knobs shared by both subcommands.
#[derive(Args)]
struct ShapeArgs {
    /// Tensor-parallel group size
    #[arg(long, default_value = "4")]
    tp: usize,

    /// Data-parallel group size
    #[arg(long, default_value = "2")]
    dp: usize,

    /// Pipeline stages
    #[arg(long, default_value = "2")]
    pp: usize,

    /// Training steps to simulate
    #[arg(long, default_value = "25")]
    steps: usize,

    /// Step interval in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Log-normal sigma applied to every kernel duration
    #[arg(long, default_value = "0.02")]
    jitter: f64,

    /// RNG seed; picked at random when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Injection spec rank:factor[:from_step[:step|ramp]], repeatable
    #[arg(long = "slow")]
    slow: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a trace file with optional slow-rank injection
    Generate {
        #[command(flatten)]
        shape: ShapeArgs,

        /// Output path for the trace JSON
        #[arg(short, long, default_value = "traces.json")]
        output: String,
    },

    /// Generate a trace and run detection over it in one go
    Run {
        #[command(flatten)]
        shape: ShapeArgs,

        /// Metric config file; a built-in default covers the standard lanes
        #[arg(short, long)]
        metric_config: Option<String>,

        /// Detection lanes to enable, comma-separated: cal, launch, comm
        #[arg(long, default_value = "cal,comm")]
        lanes: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Generate { shape, output } => run_generate(&shape, &output),
        Commands::Run {
            shape,
            metric_config,
            lanes,
        } => run_detection(&shape, metric_config.as_deref(), &lanes),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("failslow-sim: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_generate(shape: &ShapeArgs, output: &str) -> Result<(), DetectError> {
    let (cfg, seed) = generator_config(shape)?;
    print_banner("FAILSLOW-SIM Trace Generation", &cfg, seed);

    let set = TraceGenerator::new(cfg)?.generate();
    let text = serde_json::to_string(&set).map_err(|e| DetectError::parse(output, &e))?;
    fs::write(output, text).map_err(|e| DetectError::io(output, &e))?;

    let events: usize = set.ranks.values().map(|v| v.len()).sum();
    eprintln!("Wrote {} events across {} ranks to {}", events, set.ranks.len(), output);
    Ok(())
}

fn run_detection(
    shape: &ShapeArgs,
    metric_config: Option<&str>,
    lanes: &str,
) -> Result<(), DetectError> {
    let (cfg, seed) = generator_config(shape)?;
    print_banner("FAILSLOW-SIM Detection Run", &cfg, seed);

    let injected: Vec<u32> = cfg.slow_ranks.iter().map(|s| s.rank).collect();
    let set = TraceGenerator::new(cfg)?.generate();

    let metrics = match metric_config {
        Some(path) => MetricConfig::load(path)?,
        None => serde_json::from_str(DEFAULT_METRIC_CONFIG)
            .map_err(|e| DetectError::parse("built-in metric config", &e))?,
    };
    let mut job = JobConfig::default();
    job.enable_detect_type.enable_cal = false;
    for lane in lanes.split(',') {
        match lane.trim() {
            "cal" => job.enable_detect_type.enable_cal = true,
            "launch" => job.enable_detect_type.enable_op_launch = true,
            "comm" => job.enable_detect_type.enable_comm = true,
            "" => {}
            other => {
                return Err(DetectError::invalid_config(
                    "lanes",
                    format!("unknown lane '{}', expected cal, launch or comm", other),
                ));
            }
        }
    }

    let engine = SlowNodeEngine::new(metrics, job, &set)?;
    let report = engine.detect();

    let detected: Vec<&str> = report
        .abnormal_detail
        .iter()
        .map(|r| r.object_id.as_str())
        .collect();
    eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
    eprintln!("║ {:60} ║", "Detection Complete");
    eprintln!("╠══════════════════════════════════════════════════════════════╣");
    eprintln!("║ Result code: {:47} ║", report.result_code.code().to_string());
    eprintln!(
        "║ Compute / network: {:41} ║",
        format!("{} / {}", report.compute, report.network)
    );
    eprintln!("║ Abnormal objects: {:42} ║", format!("{:?}", detected));
    eprintln!("║ Injected ranks: {:44} ║", format!("{:?}", injected));
    eprintln!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("{}", report.to_pretty_json()?);
    Ok(())
}

fn generator_config(shape: &ShapeArgs) -> Result<(GeneratorConfig, u64), DetectError> {
    let topology = SimTopology::new(shape.tp, shape.dp, shape.pp)?;
    let seed = shape.seed.unwrap_or_else(|| fastrand::u64(..));
    let mut cfg = GeneratorConfig::new(topology);
    cfg.steps = shape.steps;
    cfg.step_interval_ms = shape.interval_ms;
    cfg.jitter_sigma = shape.jitter;
    cfg.seed = seed;
    cfg.slow_ranks = shape
        .slow
        .iter()
        .map(|spec| parse_slow_spec(spec))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((cfg, seed))
}

/// Parses `rank:factor[:from_step[:step|ramp]]`, e.g. `5:3`, `5:3:12:ramp`.
fn parse_slow_spec(spec: &str) -> Result<SlowRank, DetectError> {
    let bad = |msg: &str| DetectError::invalid_config("slow", format!("'{}': {}", spec, msg));
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.len() < 2 || fields.len() > 4 {
        return Err(bad("expected rank:factor[:from_step[:step|ramp]]"));
    }
    let rank: u32 = fields[0].parse().map_err(|_| bad("rank must be an integer"))?;
    let factor: f64 = fields[1].parse().map_err(|_| bad("factor must be a number"))?;
    let from_step: usize = match fields.get(2) {
        Some(raw) => raw.parse().map_err(|_| bad("from_step must be an integer"))?,
        None => 0,
    };
    let mode = match fields.get(3) {
        Some(&"ramp") => SlowMode::Ramp,
        Some(&"step") | None => SlowMode::Step,
        Some(other) => return Err(bad(&format!("unknown mode '{}'", other))),
    };
    Ok(SlowRank {
        rank,
        factor,
        from_step,
        mode,
    })
}

fn print_banner(title: &str, cfg: &GeneratorConfig, seed: u64) {
    let layout = format!(
        "tp={} dp={} pp={} ({} ranks)",
        cfg.topology.tp_size,
        cfg.topology.dp_size,
        cfg.topology.pp_size,
        cfg.topology.world_size()
    );
    let slow = if cfg.slow_ranks.is_empty() {
        "none".to_string()
    } else {
        cfg.slow_ranks
            .iter()
            .map(|s| {
                format!(
                    "{}:{}x@{}{}",
                    s.rank,
                    s.factor,
                    s.from_step,
                    if s.mode == SlowMode::Ramp { " (ramp)" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    eprintln!("╔══════════════════════════════════════════════════════════════╗");
    eprintln!("║ {:60} ║", title);
    eprintln!("╠══════════════════════════════════════════════════════════════╣");
    eprintln!("║ Layout: {:52} ║", layout);
    eprintln!("║ Steps: {:53} ║", cfg.steps.to_string());
    eprintln!("║ Seed: {:54} ║", seed.to_string());
    eprintln!("║ Slow ranks: {:48} ║", slow);
    eprintln!("╚══════════════════════════════════════════════════════════════╝");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_metric_config_parses_and_validates() {
        let config: MetricConfig = serde_json::from_str(DEFAULT_METRIC_CONFIG).unwrap();
        config.validate().unwrap();
        for metric in [
            "HcclAllGather",
            "HcclAllGather_launch",
            "HcclAllreduce",
            "HcclBatchSendRecv",
        ] {
            assert!(config.get(metric).is_some(), "missing builtin entry {}", metric);
        }
    }

    #[test]
    fn slow_specs_parse_with_optional_fields() {
        let short = parse_slow_spec("5:3").unwrap();
        assert_eq!(short.rank, 5);
        assert!((short.factor - 3.0).abs() < 1e-9);
        assert_eq!(short.from_step, 0);
        assert_eq!(short.mode, SlowMode::Step);

        let full = parse_slow_spec("12:2.5:10:ramp").unwrap();
        assert_eq!(full.rank, 12);
        assert_eq!(full.from_step, 10);
        assert_eq!(full.mode, SlowMode::Ramp);

        assert!(parse_slow_spec("5").is_err());
        assert!(parse_slow_spec("5:x").is_err());
        assert!(parse_slow_spec("5:3:1:linear").is_err());
    }
}
