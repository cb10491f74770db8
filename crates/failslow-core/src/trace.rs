//! Raw collective-operator traces and the lanes derived from them.
//!
//! A training job is observed as a stream of timestamped marker events per
//! rank. Each collective launch produces several events sharing one operator
//! id: host-side submission markers and device-side execution markers. This
//! module turns that stream into two per-rank lanes:
//!
//! - the device lane, one record per operator spanning device execution,
//! - the launch lane, one record per operator spanning host submission up
//!   to the first device activity (dispatch latency).
//!
//! Operator names are descriptor strings such as
//! `comm:HcclAllGather,tp_group_1,f16,2048`. Rows whose descriptor does not
//! carry exactly the four expected fields are dropped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DetectError;

// ============================================================
//  COLLECTIVE OPERATOR NAMES
// ============================================================

/// Operator names as they appear in trace descriptors.
pub mod ops {
    pub const REDUCE_SCATTER: &str = "HcclReduceScatter";
    pub const ALL_REDUCE: &str = "HcclAllreduce";
    pub const ALL_GATHER: &str = "HcclAllGather";
    pub const SEND: &str = "HcclSend";
    pub const RECEIVE: &str = "HcclReceive";
    pub const BATCH_SEND_RECV: &str = "HcclBatchSendRecv";
    pub const BROADCAST: &str = "HcclBroadcast";
}

// ============================================================
//  RAW EVENTS
// ============================================================

/// Which side of the accelerator boundary emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EventSource {
    Host,
    Device,
}

impl TryFrom<u8> for EventSource {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventSource::Host),
            1 => Ok(EventSource::Device),
            other => Err(format!("unknown event source {}", other)),
        }
    }
}

impl From<EventSource> for u8 {
    fn from(value: EventSource) -> Self {
        match value {
            EventSource::Host => 0,
            EventSource::Device => 1,
        }
    }
}

/// One marker event as recorded by the tracing hook.
///
/// Only some events carry the operator name; the rest reference the same
/// operator through `op_id` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpEvent {
    pub op_id: u64,
    #[serde(default)]
    pub kind: u32,
    pub source: EventSource,
    #[serde(default)]
    pub name: Option<String>,
    pub timestamp_ns: i64,
    #[serde(default)]
    pub device_id: u32,
}

/// Raw per-rank event streams for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSet {
    pub ranks: BTreeMap<u32, Vec<OpEvent>>,
}

impl TraceSet {
    /// Reads a trace dump from a JSON file.
    pub fn load(path: &str) -> Result<Self, DetectError> {
        let text = std::fs::read_to_string(path).map_err(|e| DetectError::io(path, &e))?;
        serde_json::from_str(&text).map_err(|e| DetectError::parse(path, &e))
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

// ============================================================
//  PARSED OPERATOR RECORDS
// ============================================================

/// One collective operator occurrence with resolved descriptor and span.
#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord {
    pub op_id: u64,
    pub op: String,
    pub group: String,
    pub data_type: String,
    pub count: String,
    pub start_ns: i64,
    pub end_ns: i64,
}

/// Splits a descriptor into `(op, group, data_type, count)`.
///
/// The optional `comm:` prefix is removed first. Descriptors written by
/// newer hooks separate fields with `!`, older ones with `,`. Anything that
/// does not yield exactly four fields is rejected.
fn parse_descriptor(name: &str) -> Option<(String, String, String, String)> {
    let body = name.strip_prefix("comm:").unwrap_or(name);
    let fields: Vec<&str> = if body.contains('!') {
        body.split('!').collect()
    } else {
        body.split(',').collect()
    };
    if fields.len() != 4 {
        return None;
    }
    Some((
        fields[0].to_string(),
        fields[1].to_string(),
        fields[2].to_string(),
        fields[3].to_string(),
    ))
}

// ============================================================
//  LANE CONSTRUCTION
// ============================================================

/// Device and launch lanes for a single rank, ordered by operator id.
#[derive(Debug, Clone, Default)]
pub struct RankLanes {
    pub device: Vec<OpRecord>,
    pub launch: Vec<OpRecord>,
}

/// Parsed lanes for every rank in a job.
#[derive(Debug, Clone, Default)]
pub struct TraceStore {
    lanes: BTreeMap<u32, RankLanes>,
}

impl TraceStore {
    /// Builds per-rank lanes from raw events.
    ///
    /// Ranks whose stream yields no usable device records are kept with
    /// empty lanes so downstream stages can report them as data-poor
    /// instead of silently shrinking the job.
    pub fn build(set: &TraceSet) -> Self {
        let mut lanes = BTreeMap::new();
        for (&rank, events) in &set.ranks {
            let rank_lanes = build_rank_lanes(events);
            if rank_lanes.device.is_empty() {
                warn!(rank, "no device records parsed from trace stream");
            }
            lanes.insert(rank, rank_lanes);
        }
        TraceStore { lanes }
    }

    pub fn ranks(&self) -> Vec<u32> {
        self.lanes.keys().copied().collect()
    }

    pub fn device_lane(&self, rank: u32) -> Option<&[OpRecord]> {
        self.lanes.get(&rank).map(|l| l.device.as_slice())
    }

    pub fn launch_lane(&self, rank: u32) -> Option<&[OpRecord]> {
        self.lanes.get(&rank).map(|l| l.launch.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}

fn build_rank_lanes(events: &[OpEvent]) -> RankLanes {
    // Resolve the operator name for each id. Later rows win, matching the
    // hook which rewrites the name row on retry.
    let mut names: BTreeMap<u64, &str> = BTreeMap::new();
    for ev in events {
        if let Some(name) = ev.name.as_deref() {
            names.insert(ev.op_id, name);
        }
    }

    let mut host_ts: BTreeMap<u64, Vec<i64>> = BTreeMap::new();
    let mut device_ts: BTreeMap<u64, Vec<i64>> = BTreeMap::new();
    for ev in events {
        match ev.source {
            EventSource::Host => host_ts.entry(ev.op_id).or_default().push(ev.timestamp_ns),
            EventSource::Device => device_ts.entry(ev.op_id).or_default().push(ev.timestamp_ns),
        }
    }

    let mut device = Vec::new();
    for (&op_id, stamps) in &device_ts {
        let Some(fields) = names.get(&op_id).and_then(|n| parse_descriptor(n)) else {
            debug!(op_id, "dropping operator without a valid descriptor");
            continue;
        };
        let start = stamps.iter().copied().min().unwrap_or(0);
        let end = stamps.iter().copied().max().unwrap_or(0);
        device.push(OpRecord {
            op_id,
            op: fields.0,
            group: fields.1,
            data_type: fields.2,
            count: fields.3,
            start_ns: start,
            end_ns: end,
        });
    }

    // Launch span: last host submission marker to first device activity.
    let mut launch = Vec::new();
    for (&op_id, h_stamps) in &host_ts {
        let Some(d_stamps) = device_ts.get(&op_id) else {
            continue;
        };
        let Some(fields) = names.get(&op_id).and_then(|n| parse_descriptor(n)) else {
            continue;
        };
        let (Some(&start), Some(&end)) = (h_stamps.iter().max(), d_stamps.iter().min()) else {
            continue;
        };
        launch.push(OpRecord {
            op_id,
            op: fields.0,
            group: fields.1,
            data_type: fields.2,
            count: fields.3,
            start_ns: start,
            end_ns: end,
        });
    }

    RankLanes { device, launch }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(op_id: u64, source: EventSource, name: Option<&str>, ts: i64) -> OpEvent {
        OpEvent {
            op_id,
            kind: 0,
            source,
            name: name.map(str::to_string),
            timestamp_ns: ts,
            device_id: 0,
        }
    }

    #[test]
    fn descriptor_accepts_both_separators() {
        let comma = parse_descriptor("comm:HcclAllGather,tp_group_1,f16,2048").unwrap();
        assert_eq!(comma.0, "HcclAllGather");
        assert_eq!(comma.1, "tp_group_1");

        let bang = parse_descriptor("comm:HcclAllreduce!dp_group_0!f32!1024").unwrap();
        assert_eq!(bang.0, "HcclAllreduce");
        assert_eq!(bang.3, "1024");
    }

    #[test]
    fn descriptor_rejects_wrong_field_count() {
        assert!(parse_descriptor("comm:HcclAllGather,tp_group_1").is_none());
        assert!(parse_descriptor("HcclAllGather,a,b,c,d").is_none());
    }

    #[test]
    fn device_lane_spans_min_to_max_device_timestamp() {
        let events = vec![
            event(7, EventSource::Host, Some("comm:HcclAllGather,tp,f16,64"), 50),
            event(7, EventSource::Device, None, 120),
            event(7, EventSource::Device, None, 90),
            event(7, EventSource::Device, None, 200),
        ];
        let lanes = build_rank_lanes(&events);
        assert_eq!(lanes.device.len(), 1);
        let rec = &lanes.device[0];
        assert_eq!(rec.start_ns, 90);
        assert_eq!(rec.end_ns, 200);
        assert_eq!(rec.op, "HcclAllGather");
        assert_eq!(rec.group, "tp");
    }

    #[test]
    fn launch_lane_spans_last_host_to_first_device() {
        let events = vec![
            event(3, EventSource::Host, Some("comm:HcclSend,pp,f16,64"), 10),
            event(3, EventSource::Host, None, 40),
            event(3, EventSource::Device, None, 100),
            event(3, EventSource::Device, None, 300),
        ];
        let lanes = build_rank_lanes(&events);
        assert_eq!(lanes.launch.len(), 1);
        assert_eq!(lanes.launch[0].start_ns, 40);
        assert_eq!(lanes.launch[0].end_ns, 100);
    }

    #[test]
    fn host_only_operator_is_absent_from_both_lanes() {
        let events = vec![event(9, EventSource::Host, Some("comm:HcclSend,pp,f16,64"), 10)];
        let lanes = build_rank_lanes(&events);
        assert!(lanes.device.is_empty());
        assert!(lanes.launch.is_empty());
    }

    #[test]
    fn unnamed_operator_is_dropped() {
        let events = vec![
            event(5, EventSource::Device, None, 10),
            event(5, EventSource::Device, None, 20),
        ];
        let lanes = build_rank_lanes(&events);
        assert!(lanes.device.is_empty());
    }

    #[test]
    fn trace_set_parses_numeric_source_codes() {
        let text = r#"{
            "ranks": {
                "0": [
                    {"op_id": 1, "kind": 2, "source": 1, "name": "comm:HcclAllGather,tp,f16,64", "timestamp_ns": 100, "device_id": 0},
                    {"op_id": 1, "source": 1, "timestamp_ns": 160}
                ]
            }
        }"#;
        let set: TraceSet = serde_json::from_str(text).unwrap();
        assert_eq!(set.ranks.len(), 1);
        let store = TraceStore::build(&set);
        let lane = store.device_lane(0).unwrap();
        assert_eq!(lane.len(), 1);
        assert_eq!(lane[0].end_ns, 160);
    }

    #[test]
    fn bad_source_code_is_a_parse_error() {
        let text = r#"{"ranks": {"0": [{"op_id": 1, "source": 7, "timestamp_ns": 1}]}}"#;
        assert!(serde_json::from_str::<TraceSet>(text).is_err());
    }
}
