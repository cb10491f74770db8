//! Generated traces pushed through the full detection engine: topology
//! reconstruction, lane analysis, voting and report assembly against known
//! ground truth.

use failslow_core::config::{JobConfig, MetricConfig};
use failslow_core::detect::MethodKind;
use failslow_core::engine::SlowNodeEngine;
use failslow_sim::{GeneratorConfig, SimTopology, SlowMode, SlowRank, TraceGenerator};

/// One-second windows against the default one-second step interval; the
/// single-window alarm filter keeps the lone onset flag a step slowdown
/// produces.
fn metric_config() -> MetricConfig {
    let text = r#"{
        "HcclAllGather": {
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
    let config: MetricConfig = serde_json::from_str(text).unwrap();
    config.validate().unwrap();
    config
}

/// Two pipeline stages of four-way tensor parallelism, eight ranks total.
fn sim_config(slow_ranks: Vec<SlowRank>) -> GeneratorConfig {
    let topology = SimTopology::new(4, 1, 2).unwrap();
    let mut cfg = GeneratorConfig::new(topology);
    cfg.seed = 11;
    cfg.slow_ranks = slow_ranks;
    cfg
}

#[test]
fn constant_slow_rank_is_isolated_spatially() {
    let slow = SlowRank {
        rank: 5,
        factor: 3.0,
        from_step: 0,
        mode: SlowMode::Step,
    };
    let set = TraceGenerator::new(sim_config(vec![slow])).unwrap().generate();

    let engine = SlowNodeEngine::new(metric_config(), JobConfig::default(), &set).unwrap();
    let report = engine.detect();

    assert_eq!(report.result_code.code(), 201);
    assert!(report.compute, "all-gather anomalies implicate compute");
    assert!(!report.network);

    assert_eq!(report.abnormal_detail.len(), 1);
    let record = &report.abnormal_detail[0];
    assert_eq!(record.object_id, "5");
    assert_eq!(record.device_info, "rank_5");
    assert_eq!(record.kpi_id, "HcclAllGather");
    assert_eq!(record.method_type, MethodKind::Space);
    assert_eq!(record.rela_ids, vec![4, 6, 7], "tensor peers ride along");
    assert!(record.kpi_data.is_empty(), "kpi recording is off by default");

    let peers: Vec<&str> = report
        .normal_detail
        .iter()
        .map(|r| r.object_id.as_str())
        .collect();
    assert_eq!(peers, vec!["4", "6", "7"]);
}

#[test]
fn comm_lane_votes_out_the_true_slow_rank_of_a_pair() {
    // Send/recv blocks both pair members, so rank 1 and its healthy peer 5
    // score identically on the pair metric. The tensor group containing
    // rank 1 is itself slowed, and that prior breaks the tie.
    let slow = SlowRank {
        rank: 1,
        factor: 3.0,
        from_step: 12,
        mode: SlowMode::Step,
    };
    let set = TraceGenerator::new(sim_config(vec![slow])).unwrap().generate();

    let mut job = JobConfig::default();
    job.enable_detect_type.enable_comm = true;
    let engine = SlowNodeEngine::new(metric_config(), job, &set).unwrap();
    let report = engine.detect();

    assert_eq!(report.result_code.code(), 201);
    assert!(report.compute, "the calculation lane sees the slow all-gather");
    assert!(report.network, "the comm lane sees the slow pair");

    for record in &report.abnormal_detail {
        assert_eq!(
            record.object_id, "1",
            "only the injected rank may be blamed, found {} on {}",
            record.object_id, record.kpi_id
        );
    }
    let comm = report
        .abnormal_detail
        .iter()
        .find(|r| r.kpi_id.starts_with("HcclBatchSendRecv"))
        .unwrap_or_else(|| panic!("no send/recv record in the report"));
    assert_eq!(comm.method_type, MethodKind::Time);
    assert!(comm.rela_ids.is_empty(), "temporal verdicts carry no peers");
    assert!(
        report.abnormal_detail.iter().any(|r| r.kpi_id == "HcclAllGather"),
        "the calculation lane reports alongside"
    );
}

#[test]
fn identical_seeds_reproduce_the_report() {
    let slow = SlowRank {
        rank: 3,
        factor: 2.5,
        from_step: 0,
        mode: SlowMode::Step,
    };
    let mut reports = Vec::new();
    for _ in 0..2 {
        let set = TraceGenerator::new(sim_config(vec![slow.clone()]))
            .unwrap()
            .generate();
        let engine = SlowNodeEngine::new(metric_config(), JobConfig::default(), &set).unwrap();
        let mut report = engine.detect();
        report.timestamp = 0;
        reports.push(report.to_pretty_json().unwrap());
    }
    assert_eq!(reports[0], reports[1], "same seed, same verdicts");
}
