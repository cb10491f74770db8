//! # failslow-sim
//!
//! Synthetic trace generation for the slow-node detection engine.
//! Builds Megatron-style rank layouts, emits per-rank collective event
//! streams with log-normal latency jitter, and injects step or ramp
//! slowdowns on chosen ranks so detection quality can be measured
//! against known ground truth.

pub mod generator;
pub mod topology;

pub use generator::{GeneratorConfig, SlowMode, SlowRank, TraceGenerator};
pub use topology::SimTopology;
