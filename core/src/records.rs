use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Filtered,
    Closed,
    Unknown,
}

impl PortState {
    pub fn parse(value: &str) -> Self {
        match value {
            "open" => PortState::Open,
            "filtered" | "open|filtered" => PortState::Filtered,
            "closed" | "closed|filtered" => PortState::Closed,
            _ => PortState::Unknown,
        }
    }

    /// Higher is "more open": open > filtered > closed > unknown.
    pub fn rank(self) -> u8 {
        match self {
            PortState::Open => 3,
            PortState::Filtered => 2,
            PortState::Closed => 1,
            PortState::Unknown => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Filtered => "filtered",
            PortState::Closed => "closed",
            PortState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Port {
    pub number: u16,
    pub protocol: String,
    pub state: PortState,
    pub host: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub state: PortState,
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub extra_info: Option<String>,
    pub confidence: Option<u8>,
}

impl Service {
    /// Fills detail fields this record lacks from `other`.
    pub fn absorb(&mut self, other: &Service) {
        if other.state.rank() > self.state.rank() {
            self.state = other.state;
        }
        fill(&mut self.name, &other.name);
        fill(&mut self.product, &other.product);
        fill(&mut self.version, &other.version);
        fill(&mut self.extra_info, &other.extra_info);
        if self.confidence.is_none() {
            self.confidence = other.confidence;
        }
    }
}

fn fill(slot: &mut Option<String>, candidate: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(candidate);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DnsRecords {
    pub hostname: String,
    #[serde(default)]
    pub a: Vec<String>,
    #[serde(default)]
    pub aaaa: Vec<String>,
    #[serde(default)]
    pub cname: Vec<String>,
    #[serde(default)]
    pub mx: Vec<String>,
    #[serde(default)]
    pub ns: Vec<String>,
    #[serde(default)]
    pub txt: Vec<String>,
    #[serde(default)]
    pub ptr: Vec<String>,
}

impl DnsRecords {
    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
            && self.aaaa.is_empty()
            && self.cname.is_empty()
            && self.mx.is_empty()
            && self.ns.is_empty()
            && self.txt.is_empty()
            && self.ptr.is_empty()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.a.iter().chain(self.aaaa.iter()).cloned().collect()
    }
}

/// Which runs discovered each port, split into high-confidence (two or more
/// runs) and unique (exactly one run) discoveries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConfidenceSplit {
    pub runs: usize,
    pub high_confidence: Vec<u16>,
    pub unique: Vec<u16>,
    /// Ascending by port.
    pub discovered_by: Vec<PortDiscovery>,
}

/// Zero-based indexes of the runs that found `port`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortDiscovery {
    pub port: u16,
    pub runs: Vec<usize>,
}

impl ConfidenceSplit {
    pub fn from_runs(runs: &[BTreeSet<u16>]) -> Self {
        let mut discovered_by: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
        for (index, ports) in runs.iter().enumerate() {
            for port in ports {
                discovered_by.entry(*port).or_default().push(index);
            }
        }

        let mut high_confidence = Vec::new();
        let mut unique = Vec::new();
        for (port, found_in) in &discovered_by {
            if found_in.len() >= 2 {
                high_confidence.push(*port);
            } else {
                unique.push(*port);
            }
        }

        Self {
            runs: runs.len(),
            high_confidence,
            unique,
            discovered_by: discovered_by
                .into_iter()
                .map(|(port, runs)| PortDiscovery { port, runs })
                .collect(),
        }
    }

    pub fn runs_for(&self, port: u16) -> Option<&[usize]> {
        self.discovered_by
            .iter()
            .find(|entry| entry.port == port)
            .map(|entry| entry.runs.as_slice())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PortScan {
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceSplit>,
}

impl PortScan {
    pub fn numbers(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self.ports.iter().map(|port| port.number).collect();
        set.into_iter().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServiceScan {
    pub services: Vec<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceSplit>,
}

impl ServiceScan {
    pub fn numbers(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self.services.iter().map(|svc| svc.port).collect();
        set.into_iter().collect()
    }
}

/// Normalized output of one tool step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolData {
    Ports(PortScan),
    Services(ServiceScan),
    Dns(DnsRecords),
    Raw { lines: usize },
}

impl ToolData {
    pub fn record_count(&self) -> usize {
        match self {
            ToolData::Ports(scan) => scan.ports.len(),
            ToolData::Services(scan) => scan.services.len(),
            ToolData::Dns(records) => {
                records.a.len()
                    + records.aaaa.len()
                    + records.cname.len()
                    + records.mx.len()
                    + records.ns.len()
                    + records.txt.len()
                    + records.ptr.len()
            }
            ToolData::Raw { lines } => *lines,
        }
    }

    /// Named value exposed to dependent steps as `{{step.<name>}}`.
    pub fn field(&self, name: &str) -> Option<String> {
        match (self, name) {
            (ToolData::Ports(scan), "ports") => Some(join_ports(&scan.numbers())),
            (ToolData::Ports(scan), "hosts") => {
                Some(unique_hosts(scan.ports.iter().map(|p| p.host.as_str())))
            }
            (ToolData::Services(scan), "ports") => Some(join_ports(&scan.numbers())),
            (ToolData::Services(scan), "hosts") => {
                Some(unique_hosts(scan.services.iter().map(|s| s.host.as_str())))
            }
            (ToolData::Dns(records), "hostname") => Some(records.hostname.clone()),
            (ToolData::Dns(records), "addresses") => Some(records.addresses().join(",")),
            (ToolData::Dns(records), "a") => Some(records.a.join(",")),
            (ToolData::Dns(records), "aaaa") => Some(records.aaaa.join(",")),
            (ToolData::Dns(records), "cname") => Some(records.cname.join(",")),
            (ToolData::Dns(records), "mx") => Some(records.mx.join(",")),
            (ToolData::Dns(records), "ns") => Some(records.ns.join(",")),
            (ToolData::Dns(records), "ptr") => Some(records.ptr.join(",")),
            (_, "count") => Some(self.record_count().to_string()),
            _ => None,
        }
    }
}

pub fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|port| port.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn unique_hosts<'a>(hosts: impl Iterator<Item = &'a str>) -> String {
    let mut seen = BTreeSet::new();
    hosts
        .filter(|host| !host.is_empty() && seen.insert(*host))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_runs_are_all_high_confidence() {
        let run: BTreeSet<u16> = [22, 80, 443].into_iter().collect();
        let split = ConfidenceSplit::from_runs(&[run.clone(), run.clone(), run]);
        assert_eq!(split.runs, 3);
        assert_eq!(split.high_confidence, vec![22, 80, 443]);
        assert!(split.unique.is_empty());
        assert_eq!(split.runs_for(80), Some(&[0, 1, 2][..]));
    }

    #[test]
    fn confidence_survives_a_json_round_trip_inside_tool_data() {
        let runs: Vec<BTreeSet<u16>> = vec![[22, 80].into_iter().collect(), [22].into_iter().collect()];
        let data = ToolData::Ports(PortScan {
            ports: Vec::new(),
            confidence: Some(ConfidenceSplit::from_runs(&runs)),
        });
        let json = serde_json::to_string(&data).unwrap();
        let back: ToolData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn disjoint_runs_are_all_unique() {
        let runs: Vec<BTreeSet<u16>> = vec![
            [22].into_iter().collect(),
            [80].into_iter().collect(),
            [443, 8443].into_iter().collect(),
        ];
        let split = ConfidenceSplit::from_runs(&runs);
        assert!(split.high_confidence.is_empty());
        assert_eq!(split.unique, vec![22, 80, 443, 8443]);
    }

    #[test]
    fn absorb_prefers_open_state_and_first_detail() {
        let mut first = Service {
            host: "10.0.0.1".into(),
            port: 22,
            protocol: "tcp".into(),
            state: PortState::Filtered,
            name: Some("ssh".into()),
            product: None,
            version: None,
            extra_info: None,
            confidence: None,
        };
        let second = Service {
            state: PortState::Open,
            name: Some("something-else".into()),
            product: Some("OpenSSH".into()),
            version: Some("9.6".into()),
            confidence: Some(10),
            ..first.clone()
        };
        first.absorb(&second);
        assert_eq!(first.state, PortState::Open);
        assert_eq!(first.name.as_deref(), Some("ssh"));
        assert_eq!(first.product.as_deref(), Some("OpenSSH"));
        assert_eq!(first.version.as_deref(), Some("9.6"));
        assert_eq!(first.confidence, Some(10));
    }

    #[test]
    fn tool_data_fields() {
        let data = ToolData::Ports(PortScan {
            ports: vec![
                Port {
                    number: 443,
                    protocol: "tcp".into(),
                    state: PortState::Open,
                    host: "10.0.0.2".into(),
                    tls: true,
                },
                Port {
                    number: 80,
                    protocol: "tcp".into(),
                    state: PortState::Open,
                    host: "10.0.0.2".into(),
                    tls: false,
                },
            ],
            confidence: None,
        });
        assert_eq!(data.field("ports").as_deref(), Some("80,443"));
        assert_eq!(data.field("hosts").as_deref(), Some("10.0.0.2"));
        assert_eq!(data.field("count").as_deref(), Some("2"));
        assert_eq!(data.field("missing"), None);
    }
}
