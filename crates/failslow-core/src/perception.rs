//! Step-time perception from training logs.
//!
//! Long before operator traces exist, the training log already prints one
//! `per_step_time` line per step. This module watches those: a sustained
//! growth in step time is an early fail-slow signal, and a step counter
//! that stops moving across polls is a hang. The detector here shares the
//! k-sigma core with the trace pipeline but confirms each alarm against
//! the following step, since checkpoint stalls produce lone spikes that
//! mean nothing.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detect::ksigma::{mean, population_std};
use crate::error::DetectError;

static STAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}),(\d+)").unwrap()
});
static STEP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"per_step_time: (\d+)ms").unwrap());

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================
//  CONFIG
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerceptionConfig {
    #[serde(default = "default_steps_window")]
    pub steps_window_size: usize,
    #[serde(default = "default_k_sigma")]
    pub k_sigma: f64,
    #[serde(default = "default_degree_threshold", rename = "anomaly_degree_thr")]
    pub anomaly_degree_threshold: f64,
    /// Steps to skip from the head of the log before any detection.
    #[serde(default = "default_stable_step")]
    pub task_stable_step: usize,
    /// Smallest range worth sweeping; shorter ones wait for more steps.
    #[serde(default = "default_min_startup")]
    pub min_startup_detection_steps: usize,
    /// Polls without step progress before a hang is declared.
    #[serde(default = "default_hang_times", rename = "hang_times_thr")]
    pub hang_times_threshold: usize,
    /// Poll interval in minutes; also scales the reported hang span.
    #[serde(default = "default_span_mins")]
    pub fail_slow_span_mins: f64,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        PerceptionConfig {
            steps_window_size: default_steps_window(),
            k_sigma: default_k_sigma(),
            anomaly_degree_threshold: default_degree_threshold(),
            task_stable_step: default_stable_step(),
            min_startup_detection_steps: default_min_startup(),
            hang_times_threshold: default_hang_times(),
            fail_slow_span_mins: default_span_mins(),
        }
    }
}

impl PerceptionConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.steps_window_size < 2 {
            return Err(DetectError::invalid_config(
                "perception.steps_window_size",
                "trailing window needs at least two steps",
            ));
        }
        if self.k_sigma <= 0.0 {
            return Err(DetectError::invalid_config(
                "perception.k_sigma",
                "sigma multiplier must be positive",
            ));
        }
        if self.anomaly_degree_threshold <= 0.0 {
            return Err(DetectError::invalid_config(
                "perception.anomaly_degree_thr",
                "relative growth threshold must be positive",
            ));
        }
        if self.fail_slow_span_mins <= 0.0 {
            return Err(DetectError::invalid_config(
                "perception.fail_slow_span_mins",
                "poll interval must be positive",
            ));
        }
        Ok(())
    }
}

fn default_steps_window() -> usize {
    5
}

fn default_k_sigma() -> f64 {
    2.0
}

fn default_degree_threshold() -> f64 {
    0.2
}

fn default_stable_step() -> usize {
    2
}

fn default_min_startup() -> usize {
    10
}

fn default_hang_times() -> usize {
    5
}

fn default_span_mins() -> f64 {
    0.1
}

// ============================================================
//  LOG PARSING
// ============================================================

/// One parsed `per_step_time` line.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub time: NaiveDateTime,
    pub step_ms: f64,
}

/// Extracts step records from raw training-log text, skipping lines that
/// do not carry both a timestamp and a step time.
pub fn parse_training_log(text: &str) -> Vec<StepRecord> {
    let mut records = Vec::new();
    for line in text.lines() {
        if !line.contains("per_step_time:") {
            continue;
        }
        let Some(stamp) = STAMP_RE.captures(line) else {
            debug!(line, "step line without a parseable timestamp");
            continue;
        };
        let Some(step) = STEP_RE.captures(line) else {
            debug!(line, "step line without a step duration");
            continue;
        };
        let joined = format!("{}.{}", &stamp[1], &stamp[2]);
        let Ok(time) = NaiveDateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M:%S%.f") else {
            debug!(line, "unparseable timestamp on step line");
            continue;
        };
        let Ok(step_ms) = step[1].parse::<f64>() else {
            continue;
        };
        records.push(StepRecord { time, step_ms });
    }
    records
}

// ============================================================
//  STEP-TIME DETECTION
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepAnomaly {
    pub training_step: usize,
    pub anomaly_time: String,
    pub anomaly_degree: f64,
    pub anomaly_training_time: String,
    pub normal_training_time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepTimeReport {
    pub anomaly_type: String,
    pub is_anomaly: bool,
    pub anomaly_count_times: usize,
    pub anomaly_info: Vec<StepAnomaly>,
    pub start_time: i64,
    pub end_time: i64,
}

/// Sweeps step times with a trailing k-sigma window; an alarm only counts
/// when the following step also exceeds the bound. `step_offset` shifts
/// reported step numbers back to log coordinates after range trimming.
pub fn detect_step_anomalies(
    records: &[StepRecord],
    step_offset: usize,
    cfg: &PerceptionConfig,
) -> StepTimeReport {
    let mut anomalies = Vec::new();
    let w = cfg.steps_window_size;
    for i in w..records.len() {
        let window: Vec<f64> = records[i - w..i].iter().map(|r| r.step_ms).collect();
        let avg = mean(&window);
        let std = population_std(&window, avg);
        let diff = records[i].step_ms - avg;
        if diff <= cfg.k_sigma * std {
            continue;
        }
        let degree = if avg > 0.0 { diff / avg } else { f64::INFINITY };
        if degree <= cfg.anomaly_degree_threshold {
            continue;
        }
        let Some(next) = records.get(i + 1) else {
            continue;
        };
        if next.step_ms - avg <= cfg.k_sigma * std {
            continue;
        }
        anomalies.push(StepAnomaly {
            training_step: step_offset + i,
            anomaly_time: records[i].time.format(TIME_FORMAT).to_string(),
            anomaly_degree: (degree * 1000.0).round() / 1000.0,
            anomaly_training_time: format!("{}ms", records[i].step_ms),
            normal_training_time: format!("{}ms", avg),
        });
    }

    StepTimeReport {
        anomaly_type: "failSlow".to_string(),
        is_anomaly: !anomalies.is_empty(),
        anomaly_count_times: anomalies.len(),
        anomaly_info: anomalies,
        start_time: records
            .first()
            .map(|r| r.time.and_utc().timestamp())
            .unwrap_or(0),
        end_time: records
            .last()
            .map(|r| r.time.and_utc().timestamp())
            .unwrap_or(0),
    }
}

// ============================================================
//  SWEEP RANGE AND HANG TRACKING
// ============================================================

/// Tracks which step interval the next perception sweep should cover.
///
/// The first sweep starts right after the warmup steps and the second
/// re-covers the grown log from that same start; from the third on, each
/// committed sweep moves the next start to the midpoint of the previous
/// range so old, already-judged steps age out. Too-short ranges are
/// rejected without consuming state.
#[derive(Debug, Clone, Default)]
pub struct DetectionRange {
    start: usize,
    end: usize,
    sweeps: usize,
}

impl DetectionRange {
    pub fn new() -> Self {
        DetectionRange::default()
    }

    pub fn advance(&mut self, total_steps: usize, cfg: &PerceptionConfig) -> Option<(usize, usize)> {
        let start = match self.sweeps {
            0 => cfg.task_stable_step,
            1 => self.start,
            _ => (self.start + self.end) / 2,
        };
        if total_steps.saturating_sub(start) < cfg.min_startup_detection_steps {
            return None;
        }
        self.start = start;
        self.end = total_steps;
        self.sweeps += 1;
        Some((start, total_steps))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HangReport {
    pub anomaly_type: String,
    pub detect_point: Vec<String>,
    pub hang_minutes: f64,
}

/// Declares a hang after enough polls without step progress.
#[derive(Debug, Clone, Default)]
pub struct HangTracker {
    last_total: Option<usize>,
    stalls: Vec<String>,
}

impl HangTracker {
    pub fn new() -> Self {
        HangTracker::default()
    }

    pub fn observe(
        &mut self,
        total_steps: usize,
        now: NaiveDateTime,
        cfg: &PerceptionConfig,
    ) -> Option<HangReport> {
        if self.last_total == Some(total_steps) {
            self.stalls.push(now.format(TIME_FORMAT).to_string());
            if self.stalls.len() > cfg.hang_times_threshold {
                let report = HangReport {
                    anomaly_type: "hang".to_string(),
                    detect_point: std::mem::take(&mut self.stalls),
                    hang_minutes: cfg.fail_slow_span_mins * cfg.hang_times_threshold as f64,
                };
                return Some(report);
            }
        } else {
            self.last_total = Some(total_steps);
            self.stalls.clear();
        }
        None
    }
}
