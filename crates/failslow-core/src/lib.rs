//! # failslow-core - slow-node detection for distributed training jobs
//!
//! Diagnoses fail-slow degradation in collective-communication workloads
//! from per-rank operation traces: reconstructs the parallelism topology
//! (tensor / data / pipeline / expert groups) purely from observed operator
//! patterns, then pinpoints anomalously slow ranks by fused temporal and
//! spatial comparison.
//!
//! ## Architecture
//!
//! ```text
//!  per-rank trace events (host + device)
//!          │
//!          ▼
//!   ┌────────────┐   ┌──────────────────┐   ┌───────────────────────┐
//!   │ TraceStore │──▶│ CommGroupCatalog │──▶│ TopologyReconstructor │
//!   └────────────┘   └──────────────────┘   └───────────────────────┘
//!          │                                          │
//!          ▼                                          ▼
//!   ┌────────────┐   per (group, metric)   ┌──────────────────────┐
//!   │ Aggregator │────────────────────────▶│ GroupAnomalyDetector │
//!   └────────────┘                         │  (time ⊕ space fuse) │
//!                                          └──────────────────────┘
//!                                                     │
//!                         pipeline lane only          ▼
//!                      ┌────────────────┐   ┌─────────────────┐
//!                      │ RootCauseVoter │◀──│ detection rounds │
//!                      └────────────────┘   └─────────────────┘
//!                                │
//!                                ▼
//!                      ┌─────────────────┐
//!                      │ ResponseBuilder │──▶ job report (JSON)
//!                      └─────────────────┘
//! ```
//!
//! Three detection lanes run over one job, all orchestrated by
//! [`engine::SlowNodeEngine`]:
//!
//! | Lane      | Watches                         | Verdict source            |
//! |-----------|---------------------------------|---------------------------|
//! | cal       | device execution time           | time ⊕ space fusion       |
//! | op-launch | host dispatch latency           | time ⊕ space fusion       |
//! | comm      | pipeline send/recv pair traffic | multi-round voting        |
//!
//! The separate [`perception`] module watches training-log step times for
//! slowdowns and hangs without needing traces at all.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use failslow_core::config::{JobConfig, MetricConfig};
//! use failslow_core::engine::SlowNodeEngine;
//! use failslow_core::trace::TraceSet;
//!
//! let metric_config = MetricConfig::load("metric_config.json").unwrap();
//! let traces = TraceSet::load("traces.json").unwrap();
//! let engine = SlowNodeEngine::new(metric_config, JobConfig::default(), &traces).unwrap();
//! let report = engine.detect();
//! println!("{}", report.to_pretty_json().unwrap());
//! ```

// Trace feed: raw events paired into per-rank device and launch lanes
pub mod trace;

// Communication-group discovery and parallelism-topology reconstruction
pub mod catalog;
pub mod topology;

// Windowed metric aggregation over op records
pub mod aggregate;

// Statistical detectors and the time/space fusion step
pub mod detect;
pub mod fusion;

// Pipeline-lane root-cause voting across reducer rounds
pub mod voting;

// Lane orchestration over the worker pool
pub mod engine;

// Job-level report assembly
pub mod report;

// Training-log step-time and hang perception
pub mod perception;

// Configuration surfaces and the shared error type
pub mod config;
pub mod error;

// Re-exports for convenience
pub use aggregate::{Aggregator, MetricSeries};
pub use catalog::{CommGroup, CommGroupCatalog};
pub use config::{AnomalyCategory, JobConfig, MetricConfig};
pub use detect::{
    AnomalyLocation, DetectionResult, Entity, MethodKind, SpaceDetectorConfig, TimeDetectorConfig,
};
pub use engine::SlowNodeEngine;
pub use error::DetectError;
pub use fusion::GroupAnomalyDetector;
pub use perception::{HangTracker, PerceptionConfig, StepTimeReport};
pub use report::{JobDetectResult, ResponseBuilder};
pub use topology::{TopologyMap, TopologyReconstructor};
pub use trace::{OpEvent, OpRecord, TraceSet, TraceStore};
pub use voting::RootCauseVoter;
