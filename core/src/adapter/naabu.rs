use super::{RawOutput, ToolAdapter, ToolConfig};
use crate::records::{ConfidenceSplit, Port, PortScan, PortState, ToolData};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Port discovery via naabu's `-json` output: one JSON object per open port.
#[derive(Debug, Clone)]
pub struct NaabuAdapter {
    config: ToolConfig,
}

impl NaabuAdapter {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ToolAdapter for NaabuAdapter {
    fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn parse(&self, raw: &RawOutput) -> ToolData {
        ToolData::Ports(PortScan {
            ports: dedup_by_number(parse_jsonl_ports(&raw.stdout)),
            confidence: None,
        })
    }

    fn combine(&self, runs: &[RawOutput]) -> ToolData {
        ToolData::Ports(combine_port_runs(
            runs.iter().map(|raw| parse_jsonl_ports(&raw.stdout)).collect(),
        ))
    }
}

/// Union of several runs plus per-port discovery counts.
pub fn combine_port_runs(runs: Vec<Vec<Port>>) -> PortScan {
    let sets: Vec<BTreeSet<u16>> = runs
        .iter()
        .map(|ports| ports.iter().map(|port| port.number).collect())
        .collect();

    let mut union: BTreeMap<u16, Port> = BTreeMap::new();
    for port in runs.into_iter().flatten() {
        union.entry(port.number).or_insert(port);
    }

    PortScan {
        ports: union.into_values().collect(),
        confidence: Some(ConfidenceSplit::from_runs(&sets)),
    }
}

fn dedup_by_number(ports: Vec<Port>) -> Vec<Port> {
    let mut seen = BTreeSet::new();
    ports
        .into_iter()
        .filter(|port| seen.insert(port.number))
        .collect()
}

pub(crate) fn parse_jsonl_ports(stdout: &str) -> Vec<Port> {
    let mut ports = Vec::new();
    let mut malformed = 0usize;

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let record: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                malformed += 1;
                continue;
            }
        };
        match port_from_record(&record) {
            Some(port) => ports.push(port),
            None => malformed += 1,
        }
    }

    if malformed > 0 {
        tracing::warn!("ignored {malformed} malformed port record(s)");
    }
    ports
}

fn port_from_record(record: &Value) -> Option<Port> {
    let number = match record.get("port")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        // older releases nest the port: {"port": {"Port": 80, "Protocol": 0}}
        Value::Object(inner) => inner.get("Port").and_then(Value::as_u64),
        _ => None,
    }?;
    let number = u16::try_from(number).ok()?;

    let host = record
        .get("ip")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| record.get("host").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    let protocol = record
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or("tcp")
        .to_string();
    let tls = record.get("tls").and_then(Value::as_bool).unwrap_or(false);

    Some(Port {
        number,
        protocol,
        state: PortState::Open,
        host,
        tls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::builtin_tool_configs;

    fn adapter() -> NaabuAdapter {
        let config = builtin_tool_configs()
            .into_iter()
            .find(|c| c.name == "naabu")
            .unwrap();
        NaabuAdapter::new(config)
    }

    const RUN: &str = r#"{"host":"example.com","ip":"93.184.216.34","port":80,"protocol":"tcp","tls":false}
{"host":"example.com","ip":"93.184.216.34","port":443,"protocol":"tcp","tls":true}
{"host":"example.com","ip":"93.184.216.34","port":443,"protocol":"tcp","tls":true}
"#;

    #[test]
    fn parse_dedups_by_port_number() {
        let data = adapter().parse(&RawOutput::from_stdout("naabu", RUN));
        let ToolData::Ports(scan) = data else {
            panic!("expected port data");
        };
        assert_eq!(scan.numbers(), vec![80, 443]);
        assert_eq!(scan.ports[0].host, "93.184.216.34");
        assert!(scan.ports[1].tls);
        assert!(scan.confidence.is_none());
    }

    #[test]
    fn malformed_output_yields_empty_result() {
        let data = adapter().parse(&RawOutput::from_stdout("naabu", "garbage\n{\"nope\":1}\n"));
        assert_eq!(data, ToolData::Ports(PortScan::default()));
    }

    #[test]
    fn accepts_string_and_nested_port_shapes() {
        let stdout = "{\"ip\":\"10.0.0.1\",\"port\":\"8080\"}\n{\"ip\":\"10.0.0.1\",\"port\":{\"Port\":22}}\n";
        let ports = parse_jsonl_ports(stdout);
        let numbers: Vec<u16> = ports.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![8080, 22]);
        assert_eq!(ports[0].protocol, "tcp");
    }

    #[test]
    fn combine_identical_runs_is_all_high_confidence() {
        let raw = RawOutput::from_stdout("naabu", RUN);
        let ToolData::Ports(scan) = adapter().combine(&[raw.clone(), raw.clone(), raw]) else {
            panic!("expected port data");
        };
        let numbers = scan.numbers();
        let split = scan.confidence.expect("confidence present");
        assert_eq!(split.high_confidence, numbers);
        assert!(split.unique.is_empty());
        assert_eq!(split.runs, 3);
    }

    #[test]
    fn combine_disjoint_runs_has_no_high_confidence() {
        let first = RawOutput::from_stdout("naabu", "{\"ip\":\"10.0.0.1\",\"port\":22}\n");
        let second = RawOutput::from_stdout("naabu", "{\"ip\":\"10.0.0.1\",\"port\":80}\n");
        let ToolData::Ports(scan) = adapter().combine(&[first, second]) else {
            panic!("expected port data");
        };
        assert_eq!(scan.numbers(), vec![22, 80]);
        let split = scan.confidence.expect("confidence present");
        assert!(split.high_confidence.is_empty());
        assert_eq!(split.unique, vec![22, 80]);
        assert_eq!(split.runs_for(80), Some(&[1][..]));
    }
}
