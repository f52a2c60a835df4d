use super::{AdapterError, RawOutput, ToolAdapter, ToolConfig};
use crate::adapter::config::DEFAULT_TOP_PORTS;
use crate::records::{ConfidenceSplit, PortState, Service, ServiceScan, ToolData};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use std::collections::{BTreeMap, BTreeSet};

pub const EMPTY_NMAP_XML: &str =
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<nmaprun scanner=\"nmap\">\n<runstats><hosts up=\"0\" down=\"0\" total=\"0\"/></runstats>\n</nmaprun>\n";

/// Service fingerprinting via nmap's XML report (`-oX -`).
#[derive(Debug, Clone)]
pub struct NmapAdapter {
    config: ToolConfig,
}

impl NmapAdapter {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    fn top_ports(&self) -> u32 {
        self.config.fallback_top_ports.unwrap_or(DEFAULT_TOP_PORTS)
    }
}

#[async_trait]
impl ToolAdapter for NmapAdapter {
    fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// An empty `-p` list means discovery found nothing; scan the top ports
    /// instead of letting nmap reject the argument.
    fn build_args(
        &self,
        flag_set: Option<&str>,
        overrides: &[String],
    ) -> Result<Vec<String>, AdapterError> {
        let args = self.config.base_args(flag_set, overrides)?;
        let mut rewritten = Vec::with_capacity(args.len());
        let mut iter = args.into_iter().peekable();
        while let Some(arg) = iter.next() {
            if arg == "-p" {
                match iter.peek() {
                    Some(value) if !value.trim().is_empty() => rewritten.push(arg),
                    Some(_) => {
                        iter.next();
                        rewritten.push("--top-ports".to_string());
                        rewritten.push(self.top_ports().to_string());
                    }
                    None => {
                        rewritten.push("--top-ports".to_string());
                        rewritten.push(self.top_ports().to_string());
                    }
                }
            } else {
                rewritten.push(arg);
            }
        }
        Ok(rewritten)
    }

    fn parse(&self, raw: &RawOutput) -> ToolData {
        let services = parse_nmap_xml(&raw.stdout)
            .into_iter()
            .filter(|svc| svc.state == PortState::Open)
            .collect();
        ToolData::Services(ServiceScan {
            services,
            confidence: None,
        })
    }

    fn combine(&self, runs: &[RawOutput]) -> ToolData {
        ToolData::Services(combine_service_runs(
            runs.iter().map(|raw| parse_nmap_xml(&raw.stdout)).collect(),
        ))
    }

    fn empty_output(&self, target: &str) -> RawOutput {
        RawOutput {
            tool: self.config.name.clone(),
            target: target.to_string(),
            stdout: EMPTY_NMAP_XML.to_string(),
            exit_code: Some(0),
            ..RawOutput::default()
        }
    }
}

/// Merges same-port records across runs: the most open state wins and detail
/// fields come from the first run that reported them. Only ports open in at
/// least one run are kept, and confidence counts open sightings only.
pub fn combine_service_runs(runs: Vec<Vec<Service>>) -> ServiceScan {
    let sets: Vec<BTreeSet<u16>> = runs
        .iter()
        .map(|services| {
            services
                .iter()
                .filter(|svc| svc.state == PortState::Open)
                .map(|svc| svc.port)
                .collect()
        })
        .collect();

    let mut merged: BTreeMap<u16, Service> = BTreeMap::new();
    for service in runs.into_iter().flatten() {
        match merged.get_mut(&service.port) {
            Some(existing) => existing.absorb(&service),
            None => {
                merged.insert(service.port, service);
            }
        }
    }

    ServiceScan {
        services: merged
            .into_values()
            .filter(|svc| svc.state == PortState::Open)
            .collect(),
        confidence: Some(ConfidenceSplit::from_runs(&sets)),
    }
}

#[derive(Default)]
struct HostBuilder {
    addresses: Vec<String>,
    hostnames: Vec<String>,
    ports: Vec<PortBuilder>,
}

#[derive(Default)]
struct PortBuilder {
    port: Option<u16>,
    protocol: Option<String>,
    state: Option<String>,
    name: Option<String>,
    product: Option<String>,
    version: Option<String>,
    extra_info: Option<String>,
    confidence: Option<u8>,
}

fn attr_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value).to_string()
}

fn apply_element(
    element: &BytesStart<'_>,
    current_host: &mut Option<HostBuilder>,
    current_port: &mut Option<PortBuilder>,
) {
    match element.name() {
        QName(b"address") => {
            if let Some(host) = current_host.as_mut() {
                let mut addr = None;
                let mut addr_type = None;
                for attr in element.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"addr" => addr = Some(attr_string(&attr.value)),
                        b"addrtype" => addr_type = Some(attr_string(&attr.value)),
                        _ => {}
                    }
                }
                // MAC addresses are not scan targets.
                if let Some(addr) = addr.filter(|_| addr_type.as_deref() != Some("mac")) {
                    host.addresses.push(addr);
                }
            }
        }
        QName(b"hostname") => {
            if let Some(host) = current_host.as_mut() {
                for attr in element.attributes().flatten() {
                    if attr.key.as_ref() == b"name" {
                        host.hostnames.push(attr_string(&attr.value));
                    }
                }
            }
        }
        QName(b"port") => {
            let mut builder = PortBuilder::default();
            for attr in element.attributes().flatten() {
                match attr.key.as_ref() {
                    b"protocol" => builder.protocol = Some(attr_string(&attr.value)),
                    b"portid" => builder.port = attr_string(&attr.value).parse::<u16>().ok(),
                    _ => {}
                }
            }
            *current_port = Some(builder);
        }
        QName(b"state") => {
            if let Some(port) = current_port.as_mut() {
                for attr in element.attributes().flatten() {
                    if attr.key.as_ref() == b"state" {
                        port.state = Some(attr_string(&attr.value));
                    }
                }
            }
        }
        QName(b"service") => {
            if let Some(port) = current_port.as_mut() {
                for attr in element.attributes().flatten() {
                    let value = attr_string(&attr.value);
                    match attr.key.as_ref() {
                        b"name" => port.name = Some(value),
                        b"product" => port.product = Some(value),
                        b"version" => port.version = Some(value),
                        b"extrainfo" => port.extra_info = Some(value),
                        b"conf" => port.confidence = value.parse::<u8>().ok(),
                        _ => {}
                    }
                }
            }
        }
        _ => {}
    }
}

/// Every port record in the report, whatever its state. Malformed XML yields
/// an empty list and a warning.
pub(crate) fn parse_nmap_xml(xml: &str) -> Vec<Service> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut hosts = Vec::new();
    let mut current_host: Option<HostBuilder> = None;
    let mut current_port: Option<PortBuilder> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => {
                if element.name() == QName(b"host") {
                    current_host = Some(HostBuilder::default());
                } else {
                    apply_element(&element, &mut current_host, &mut current_port);
                }
            }
            Ok(Event::Empty(element)) => {
                apply_element(&element, &mut current_host, &mut current_port);
                if element.name() == QName(b"port") {
                    if let (Some(host), Some(port)) = (current_host.as_mut(), current_port.take()) {
                        host.ports.push(port);
                    }
                }
            }
            Ok(Event::End(element)) => match element.name() {
                QName(b"port") => {
                    if let (Some(host), Some(port)) = (current_host.as_mut(), current_port.take()) {
                        host.ports.push(port);
                    }
                }
                QName(b"host") => {
                    if let Some(host) = current_host.take() {
                        hosts.push(host);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                tracing::warn!("discarding malformed nmap xml: {err}");
                return Vec::new();
            }
            _ => {}
        }
        buf.clear();
    }

    let mut services = Vec::new();
    for host in hosts {
        let Some(address) = host
            .addresses
            .first()
            .or_else(|| host.hostnames.first())
            .cloned()
        else {
            continue;
        };

        for port in host.ports {
            let Some(number) = port.port else {
                continue;
            };
            services.push(Service {
                host: address.clone(),
                port: number,
                protocol: port.protocol.unwrap_or_else(|| "tcp".to_string()),
                state: port
                    .state
                    .as_deref()
                    .map(PortState::parse)
                    .unwrap_or(PortState::Unknown),
                name: port.name,
                product: port.product,
                version: port.version,
                extra_info: port.extra_info,
                confidence: port.confidence,
            });
        }
    }
    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::builtin_tool_configs;

    fn adapter() -> NmapAdapter {
        let config = builtin_tool_configs()
            .into_iter()
            .find(|c| c.name == "nmap")
            .unwrap();
        NmapAdapter::new(config)
    }

    fn report(ports: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
  <host>
    <status state="up"/>
    <address addr="10.0.0.7" addrtype="ipv4"/>
    <address addr="00:11:22:33:44:55" addrtype="mac"/>
    <hostnames><hostname name="web.internal" type="PTR"/></hostnames>
    <ports>{ports}</ports>
  </host>
</nmaprun>"#
        )
    }

    const OPEN_SSH: &str = r#"<port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh" product="OpenSSH" version="9.6p1" extrainfo="Ubuntu" method="table" conf="10"/></port>"#;
    const CLOSED_HTTP: &str = r#"<port protocol="tcp" portid="80"><state state="closed" reason="reset"/><service name="http" method="table" conf="3"/></port>"#;

    #[test]
    fn parse_keeps_only_open_ports_with_details() {
        let raw = RawOutput::from_stdout("nmap", report(&format!("{OPEN_SSH}{CLOSED_HTTP}")));
        let ToolData::Services(scan) = adapter().parse(&raw) else {
            panic!("expected services");
        };
        assert_eq!(scan.services.len(), 1);
        let ssh = &scan.services[0];
        assert_eq!(ssh.host, "10.0.0.7");
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.name.as_deref(), Some("ssh"));
        assert_eq!(ssh.product.as_deref(), Some("OpenSSH"));
        assert_eq!(ssh.version.as_deref(), Some("9.6p1"));
        assert_eq!(ssh.extra_info.as_deref(), Some("Ubuntu"));
        assert_eq!(ssh.confidence, Some(10));
    }

    #[test]
    fn malformed_xml_is_empty_not_error() {
        let raw = RawOutput::from_stdout("nmap", "<nmaprun><host><ports></host>");
        assert_eq!(
            adapter().parse(&raw),
            ToolData::Services(ServiceScan::default())
        );
    }

    #[test]
    fn empty_output_parses_cleanly() {
        let raw = adapter().empty_output("10.0.0.1");
        assert_eq!(raw.exit_code, Some(0));
        assert_eq!(adapter().parse(&raw).record_count(), 0);
    }

    #[test]
    fn empty_port_list_falls_back_to_top_ports() {
        let args = adapter()
            .build_args(
                Some("service"),
                &["-p".to_string(), String::new(), "-iL".to_string(), "hosts.txt".to_string()],
            )
            .unwrap();
        assert_eq!(
            args,
            vec!["-oX", "-", "-sV", "-Pn", "--top-ports", "1000", "-iL", "hosts.txt"]
        );

        let kept = adapter()
            .build_args(None, &["-p".to_string(), "22,80".to_string()])
            .unwrap();
        assert_eq!(kept, vec!["-oX", "-", "-p", "22,80"]);
    }

    #[test]
    fn combine_prefers_open_state_and_first_detail() {
        let filtered_first = report(
            r#"<port protocol="tcp" portid="443"><state state="filtered"/><service name="https"/></port>"#,
        );
        let open_second = report(
            r#"<port protocol="tcp" portid="443"><state state="open"/><service name="http" product="nginx" version="1.25"/></port>"#,
        );
        let only_ssh = report(OPEN_SSH);

        let runs = [
            RawOutput::from_stdout("nmap", filtered_first),
            RawOutput::from_stdout("nmap", open_second),
            RawOutput::from_stdout("nmap", only_ssh),
        ];
        let ToolData::Services(scan) = adapter().combine(&runs) else {
            panic!("expected services");
        };

        let https = scan.services.iter().find(|s| s.port == 443).unwrap();
        assert_eq!(https.state, PortState::Open);
        assert_eq!(https.name.as_deref(), Some("https"));
        assert_eq!(https.product.as_deref(), Some("nginx"));

        // 443 was only open in one run.
        let split = scan.confidence.unwrap();
        assert!(split.high_confidence.is_empty());
        assert_eq!(split.unique, vec![22, 443]);
    }

    #[test]
    fn combine_drops_ports_never_seen_open() {
        let run = RawOutput::from_stdout("nmap", report(&format!("{OPEN_SSH}{CLOSED_HTTP}")));
        let single = adapter().parse(&run);
        let combined = adapter().combine(&[run.clone(), run]);

        assert_eq!(single.field("ports").as_deref(), Some("22"));
        assert_eq!(combined.field("ports").as_deref(), Some("22"));
        let ToolData::Services(scan) = combined else {
            panic!("expected services");
        };
        let split = scan.confidence.unwrap();
        assert_eq!(split.high_confidence, vec![22]);
        assert!(split.unique.is_empty());
        assert_eq!(split.runs_for(80), None);
    }
}
