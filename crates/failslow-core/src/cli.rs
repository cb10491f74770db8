//! failslow - slow-node detection for distributed training jobs
//!
//! Usage:
//!   failslow detect --trace traces.json --metric-config metric_config.json
//!   failslow detect --trace traces.json --job-config job.json --output-dir out/
//!   failslow perceive --log training.log

use std::fs;
use std::path::Path;
use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use failslow_core::config::{JobConfig, MetricConfig};
use failslow_core::engine::SlowNodeEngine;
use failslow_core::error::DetectError;
use failslow_core::perception::{
    DetectionRange, PerceptionConfig, detect_step_anomalies, parse_training_log,
};
use failslow_core::report::JobDetectResult;
use failslow_core::trace::TraceSet;

#[derive(Parser)]
#[command(name = "failslow")]
#[command(about = "Slow-node detection over collective-communication traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run slow-node detection over a trace dump and write the job report
    Detect {
        /// Trace dump with per-rank event streams (JSON)
        #[arg(short, long)]
        trace: String,

        /// Metric configuration: aggregation windows and detectors
        #[arg(short, long, default_value = "metric_config.json")]
        metric_config: String,

        /// Job configuration: topology override, lanes, reporting
        #[arg(short, long)]
        job_config: Option<String>,

        /// Directory the report file is written into
        #[arg(short, long, default_value = ".")]
        output_dir: String,
    },

    /// Scan a training log for step-time anomalies
    Perceive {
        /// Training log carrying per_step_time lines
        #[arg(short, long)]
        log: String,

        /// Job configuration carrying the perception section
        #[arg(short, long)]
        job_config: Option<String>,

        /// Directory the report file is written into
        #[arg(short, long, default_value = ".")]
        output_dir: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Detect {
            trace,
            metric_config,
            job_config,
            output_dir,
        } => run_detect(&trace, &metric_config, job_config.as_deref(), &output_dir),
        Commands::Perceive {
            log,
            job_config,
            output_dir,
        } => run_perceive(&log, job_config.as_deref(), &output_dir),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn run_detect(
    trace: &str,
    metric_config: &str,
    job_config: Option<&str>,
    output_dir: &str,
) -> Result<(), DetectError> {
    // A failed run still produces a report file so downstream consumers
    // always find one; the failure lands in errorMsg.
    let report = match build_report(trace, metric_config, job_config) {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "detection failed, emitting error report");
            let mut fallback = JobDetectResult::normal(Utc::now().timestamp());
            fallback.error_msg = err.to_string();
            fallback
        }
    };

    let path = write_json(
        output_dir,
        &format!("slow_node_result_{}.json", report.timestamp),
        &report.to_pretty_json()?,
    )?;
    info!(
        path = %path.display(),
        result_code = report.result_code.code(),
        abnormal = report.abnormal_detail.len(),
        "detection report written"
    );
    Ok(())
}

fn build_report(
    trace: &str,
    metric_config: &str,
    job_config: Option<&str>,
) -> Result<JobDetectResult, DetectError> {
    let metric_config = MetricConfig::load(metric_config)?;
    let job_config = match job_config {
        Some(path) => JobConfig::load(path)?,
        None => JobConfig::default(),
    };
    let traces = TraceSet::load(trace)?;
    let engine = SlowNodeEngine::new(metric_config, job_config, &traces)?;
    Ok(engine.detect())
}

fn run_perceive(
    log: &str,
    job_config: Option<&str>,
    output_dir: &str,
) -> Result<(), DetectError> {
    let cfg = match job_config {
        Some(path) => JobConfig::load(path)?.perception,
        None => PerceptionConfig::default(),
    };
    cfg.validate()?;

    let text = fs::read_to_string(log).map_err(|err| DetectError::io(log, &err))?;
    let records = parse_training_log(&text);
    info!(steps = records.len(), "training log parsed");

    let mut range = DetectionRange::new();
    let report = match range.advance(records.len(), &cfg) {
        Some((start, end)) => detect_step_anomalies(&records[start..end], start, &cfg),
        None => {
            warn!(
                steps = records.len(),
                needed = cfg.min_startup_detection_steps,
                "not enough steps for a perception sweep"
            );
            detect_step_anomalies(&[], 0, &cfg)
        }
    };

    let body = serde_json::to_string_pretty(&report)
        .map_err(|err| DetectError::parse("step-time report", &err))?;
    let path = write_json(
        output_dir,
        &format!(
            "fail_slow_perception_result_{}_{}.json",
            report.anomaly_type,
            Utc::now().timestamp()
        ),
        &body,
    )?;
    info!(
        path = %path.display(),
        is_anomaly = report.is_anomaly,
        anomalies = report.anomaly_count_times,
        "perception report written"
    );
    Ok(())
}

fn write_json(
    output_dir: &str,
    file_name: &str,
    body: &str,
) -> Result<std::path::PathBuf, DetectError> {
    fs::create_dir_all(output_dir).map_err(|err| DetectError::io(output_dir, &err))?;
    let path = Path::new(output_dir).join(file_name);
    fs::write(&path, body).map_err(|err| DetectError::io(path.display().to_string(), &err))?;
    Ok(path)
}
