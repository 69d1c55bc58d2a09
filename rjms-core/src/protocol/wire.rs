//! Two wire encodings for the scheduler protocol (§4.5): a JSON envelope (the
//! default) and a legacy colon/pipe line form kept only as an optional decoder.
//!
//! Grounded on `original_source/src/protocol.cpp` (`JsonProtocolWriter` /
//! `JsonProtocolReader`): the per-event-type JSON shapes, the monotonic-timestamp
//! assertions on both write and read sides, and the envelope's `{"now", "events"}`
//! skeleton are copied from there. The legacy line grammar is as documented in
//! SPEC_FULL.md §4.5/§9 — it is intentionally never the *emitting* side here, only
//! parsed, matching the "make the line form an optional legacy decoder" guidance.

use serde::Deserialize;
use serde_json::json;

use crate::clock::SimTime;
use crate::events::{JobStatus, OutboundEvent, TimestampedEvent};
use crate::job::JobId;
use crate::machine_range::MachineRange;

pub const LEGACY_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
    #[error("event timestamp {timestamp} exceeds envelope now {now}")]
    TimestampAfterNow { timestamp: SimTime, now: SimTime },
    #[error("event timestamp {timestamp} precedes previous {previous}")]
    TimestampNonMonotone { timestamp: SimTime, previous: SimTime },
    #[error("reserved, unimplemented event type '{0}'")]
    Reserved(String),
    #[error("unknown job '{0}'")]
    UnknownJob(String),
}

/// Which wire form a deployment uses (§6 `--legacy-protocol`, default JSON).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Legacy,
}

/// A decoded inbound event together with its timestamp, prior to the
/// wait-before-injection sleep (§4.5) that the transport layer applies.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub now: SimTime,
    pub events: Vec<(SimTime, InboundEvent)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    QueryRequestEnergy,
    RejectJob { job_id: JobId },
    ExecuteJob { job_id: JobId, alloc: MachineRange },
    CallMeLater { at: SimTime },
    SetResourceState { resources: MachineRange, state: u32 },
    Nop,
}

/// Reserved inbound tags (§9 Open Questions): parsed for shape validity so a
/// well-formed envelope containing one is not itself a framing error, but any
/// attempt to act on one is a protocol error.
const RESERVED_EVENT_TYPES: &[&str] = &["SUBMIT_JOB", "KILL_JOB", "NOTIFY"];

pub fn encode(events: &[TimestampedEvent], now: SimTime, format: WireFormat) -> String {
    match format {
        WireFormat::Json => encode_json(events, now),
        WireFormat::Legacy => encode_legacy(events, now),
    }
}

pub fn decode(payload: &str, format: WireFormat) -> Result<InboundEnvelope, ProtocolError> {
    match format {
        WireFormat::Json => decode_json(payload),
        WireFormat::Legacy => decode_legacy(payload),
    }
}

fn outbound_event_json(event: &OutboundEvent) -> serde_json::Value {
    match event {
        OutboundEvent::SimulationBegins => json!({"type": "SIMULATION_BEGINS", "data": {}}),
        OutboundEvent::SimulationEnds => json!({"type": "SIMULATION_ENDS", "data": {}}),
        OutboundEvent::JobSubmitted { job_ids } => json!({
            "type": "JOB_SUBMITTED",
            "data": { "job_ids": job_ids.iter().map(JobId::to_string).collect::<Vec<_>>() }
        }),
        OutboundEvent::JobCompleted { job_id, status } => json!({
            "type": "JOB_COMPLETED",
            "data": { "job_id": job_id.to_string(), "status": status }
        }),
        OutboundEvent::JobKilled { job_ids } => json!({
            "type": "JOB_KILLED",
            "data": { "job_ids": job_ids.iter().map(JobId::to_string).collect::<Vec<_>>() }
        }),
        OutboundEvent::ResourceStateChanged { resources, state } => json!({
            "type": "RESOURCE_STATE_CHANGED",
            "data": { "resources": resources.to_string_hyphen(), "state": state }
        }),
        OutboundEvent::QueryReply { energy_consumed } => json!({
            "type": "QUERY_REPLY",
            "data": { "energy_consumed": energy_consumed }
        }),
        OutboundEvent::Nop => json!({"type": "NOP", "data": {}}),
    }
}

fn encode_json(events: &[TimestampedEvent], now: SimTime) -> String {
    let mut last = f64::MIN;
    let events: Vec<serde_json::Value> = events
        .iter()
        .map(|e| {
            debug_assert!(e.timestamp >= last, "outbound timestamps must be non-decreasing");
            last = e.timestamp;
            let mut v = outbound_event_json(&e.event);
            v["timestamp"] = json!(e.timestamp);
            v
        })
        .collect();
    json!({ "now": now, "events": events }).to_string()
}

#[derive(Deserialize)]
struct RawEnvelope {
    now: SimTime,
    events: Vec<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    timestamp: SimTime,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn decode_json(payload: &str) -> Result<InboundEnvelope, ProtocolError> {
    let raw: RawEnvelope =
        serde_json::from_str(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let mut last = f64::MIN;
    let mut events = Vec::with_capacity(raw.events.len());
    for raw_event in raw.events {
        if raw_event.timestamp > raw.now {
            return Err(ProtocolError::TimestampAfterNow {
                timestamp: raw_event.timestamp,
                now: raw.now,
            });
        }
        if raw_event.timestamp < last {
            return Err(ProtocolError::TimestampNonMonotone {
                timestamp: raw_event.timestamp,
                previous: last,
            });
        }
        last = raw_event.timestamp;
        let event = decode_inbound_event(&raw_event.kind, &raw_event.data)?;
        events.push((raw_event.timestamp, event));
    }

    Ok(InboundEnvelope { now: raw.now, events })
}

fn decode_inbound_event(kind: &str, data: &serde_json::Value) -> Result<InboundEvent, ProtocolError> {
    if RESERVED_EVENT_TYPES.contains(&kind) {
        return Err(ProtocolError::Reserved(kind.to_string()));
    }
    match kind {
        "QUERY_REQUEST" => {
            if data.get("requests").and_then(|r| r.get("consumed_energy")).is_some() {
                Ok(InboundEvent::QueryRequestEnergy)
            } else {
                Err(ProtocolError::Malformed("QUERY_REQUEST missing consumed_energy".into()))
            }
        }
        "REJECT_JOB" => {
            let job_id = field_str(data, "job_id")?;
            Ok(InboundEvent::RejectJob { job_id: parse_job_id(job_id)? })
        }
        "EXECUTE_JOB" => {
            let job_id = field_str(data, "job_id")?;
            let alloc = field_str(data, "alloc")?;
            Ok(InboundEvent::ExecuteJob {
                job_id: parse_job_id(job_id)?,
                alloc: MachineRange::parse(alloc).map_err(ProtocolError::Malformed)?,
            })
        }
        "CALL_ME_LATER" => {
            let at = data
                .get("timestamp")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| ProtocolError::Malformed("CALL_ME_LATER missing timestamp".into()))?;
            Ok(InboundEvent::CallMeLater { at })
        }
        "SET_RESOURCE_STATE" => {
            let resources = field_str(data, "resources")?;
            let state = data
                .get("state")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| ProtocolError::Malformed("SET_RESOURCE_STATE missing state".into()))?;
            Ok(InboundEvent::SetResourceState {
                resources: MachineRange::parse(resources).map_err(ProtocolError::Malformed)?,
                state: state as u32,
            })
        }
        "NOP" => Ok(InboundEvent::Nop),
        other => Err(ProtocolError::UnknownEventType(other.to_string())),
    }
}

fn field_str<'a>(data: &'a serde_json::Value, field: &str) -> Result<&'a str, ProtocolError> {
    data.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolError::Malformed(format!("missing field '{field}'")))
}

fn parse_job_id(s: &str) -> Result<JobId, ProtocolError> {
    JobId::parse(s).map_err(|_| ProtocolError::UnknownJob(s.to_string()))
}

// --- Legacy line form -------------------------------------------------------

fn outbound_event_legacy(event: &OutboundEvent) -> Option<String> {
    match event {
        OutboundEvent::JobSubmitted { job_ids } => {
            Some(format!("S:{}", job_ids.iter().map(JobId::to_string).collect::<Vec<_>>().join(",")))
        }
        OutboundEvent::JobCompleted { job_id, status } => {
            let tag = match status {
                JobStatus::Success => "C",
                JobStatus::Killed => "K",
            };
            Some(format!("{tag}:{job_id}"))
        }
        OutboundEvent::Nop => Some("N".to_string()),
        OutboundEvent::ResourceStateChanged { resources, state } => {
            Some(format!("p:{resources}={state}"))
        }
        OutboundEvent::QueryReply { energy_consumed } => Some(format!("e:{energy_consumed}")),
        OutboundEvent::SimulationBegins | OutboundEvent::SimulationEnds | OutboundEvent::JobKilled { .. } => {
            None
        }
    }
}

fn encode_legacy(events: &[TimestampedEvent], now: SimTime) -> String {
    let mut segments = vec![format!("{LEGACY_PROTOCOL_VERSION}:{now}")];
    for e in events {
        if let Some(tag) = outbound_event_legacy(&e.event) {
            let (tag_char, args) = tag.split_once(':').unwrap_or((tag.as_str(), ""));
            segments.push(format!("{}:{}:{}", e.timestamp, tag_char, args));
        }
    }
    segments.push(format!("{now}:T"));
    segments.join("|")
}

fn decode_legacy(payload: &str) -> Result<InboundEnvelope, ProtocolError> {
    let mut segments = payload.split('|');
    let header = segments.next().ok_or_else(|| ProtocolError::Malformed("empty message".into()))?;
    let (_version, now_str) = header
        .split_once(':')
        .ok_or_else(|| ProtocolError::Malformed(format!("bad header '{header}'")))?;
    let now: SimTime = now_str
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("bad now timestamp '{now_str}'")))?;

    let mut events = Vec::new();
    let mut last = f64::MIN;
    for segment in segments {
        let mut parts = segment.splitn(3, ':');
        let ts_str = parts.next().unwrap_or("");
        let tag = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("");
        if tag == "T" {
            break;
        }
        let ts: SimTime = ts_str
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("bad timestamp '{ts_str}'")))?;
        if ts > now {
            return Err(ProtocolError::TimestampAfterNow { timestamp: ts, now });
        }
        if ts < last {
            return Err(ProtocolError::TimestampNonMonotone { timestamp: ts, previous: last });
        }
        last = ts;
        let event = decode_legacy_tag(tag, args)?;
        events.push((ts, event));
    }

    Ok(InboundEnvelope { now, events })
}

fn decode_legacy_tag(tag: &str, args: &str) -> Result<InboundEvent, ProtocolError> {
    match tag {
        "X" => {
            let (job_id, alloc) = args
                .split_once(':')
                .ok_or_else(|| ProtocolError::Malformed(format!("bad EXECUTE_JOB args '{args}'")))?;
            Ok(InboundEvent::ExecuteJob {
                job_id: parse_job_id(job_id)?,
                alloc: MachineRange::parse(alloc).map_err(ProtocolError::Malformed)?,
            })
        }
        "R" => Ok(InboundEvent::RejectJob { job_id: parse_job_id(args)? }),
        "N" => Ok(InboundEvent::Nop),
        other if RESERVED_EVENT_TYPES.contains(&other) => Err(ProtocolError::Reserved(other.to_string())),
        other => Err(ProtocolError::UnknownEventType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(timestamp: SimTime, event: OutboundEvent) -> TimestampedEvent {
        TimestampedEvent { timestamp, event }
    }

    #[test]
    fn json_round_trip_job_completed_and_execute() {
        let events = vec![ev(
            1.0,
            OutboundEvent::JobCompleted { job_id: JobId::new("static", 0), status: JobStatus::Success },
        )];
        let payload = encode(&events, 1.0, WireFormat::Json);
        let decoded = decode(
            &format!(
                r#"{{"now": 1.0, "events": [{{"timestamp": 1.0, "type": "EXECUTE_JOB", "data": {{"job_id": "static!0", "alloc": "0-1"}}}}]}}"#
            ),
            WireFormat::Json,
        )
        .unwrap();
        assert_eq!(decoded.now, 1.0);
        assert_eq!(
            decoded.events[0].1,
            InboundEvent::ExecuteJob {
                job_id: JobId::new("static", 0),
                alloc: MachineRange::parse("0-1").unwrap()
            }
        );
        assert!(payload.contains("JOB_COMPLETED"));
    }

    #[test]
    fn json_rejects_reserved_event_types() {
        let payload = r#"{"now": 1.0, "events": [{"timestamp": 1.0, "type": "KILL_JOB", "data": {}}]}"#;
        let err = decode(payload, WireFormat::Json).unwrap_err();
        assert!(matches!(err, ProtocolError::Reserved(_)));
    }

    #[test]
    fn json_rejects_timestamp_after_now() {
        let payload = r#"{"now": 1.0, "events": [{"timestamp": 2.0, "type": "NOP", "data": {}}]}"#;
        let err = decode(payload, WireFormat::Json).unwrap_err();
        assert!(matches!(err, ProtocolError::TimestampAfterNow { .. }));
    }

    #[test]
    fn json_rejects_non_monotone_timestamps() {
        let payload = r#"{"now": 5.0, "events": [
            {"timestamp": 3.0, "type": "NOP", "data": {}},
            {"timestamp": 1.0, "type": "NOP", "data": {}}
        ]}"#;
        let err = decode(payload, WireFormat::Json).unwrap_err();
        assert!(matches!(err, ProtocolError::TimestampNonMonotone { .. }));
    }

    #[test]
    fn legacy_round_trip_execute_job() {
        let payload = format!("{LEGACY_PROTOCOL_VERSION}:5|2:X:static!0:0-1|5:T");
        let decoded = decode(&payload, WireFormat::Legacy).unwrap();
        assert_eq!(decoded.now, 5.0);
        assert_eq!(
            decoded.events[0].1,
            InboundEvent::ExecuteJob {
                job_id: JobId::new("static", 0),
                alloc: MachineRange::parse("0-1").unwrap()
            }
        );
    }

    #[test]
    fn legacy_encode_emits_terminator() {
        let events = vec![ev(1.0, OutboundEvent::Nop)];
        let payload = encode_legacy(&events, 1.0);
        assert!(payload.ends_with("1:T"));
        assert!(payload.starts_with(&format!("{LEGACY_PROTOCOL_VERSION}:1")));
    }
}
