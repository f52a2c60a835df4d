use super::{push_distinct, RawOutput, ToolAdapter, ToolConfig};
use crate::records::{DnsRecords, ToolData};
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

/// DNS lookups through `host` or `dig`. Both print free text, so records are
/// pulled out line by line and anything unrecognised is ignored.
#[derive(Debug, Clone)]
pub struct DnsAdapter {
    config: ToolConfig,
}

impl DnsAdapter {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ToolAdapter for DnsAdapter {
    fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn parse(&self, raw: &RawOutput) -> ToolData {
        let mut records = DnsRecords {
            hostname: strip_dot(raw.target.trim()).to_string(),
            ..DnsRecords::default()
        };
        collect_records(&raw.stdout, &mut records);
        ToolData::Dns(records)
    }

    fn combine(&self, runs: &[RawOutput]) -> ToolData {
        let mut records = DnsRecords {
            hostname: runs
                .iter()
                .map(|raw| strip_dot(raw.target.trim()))
                .find(|target| !target.is_empty())
                .unwrap_or_default()
                .to_string(),
            ..DnsRecords::default()
        };
        for raw in runs {
            collect_records(&raw.stdout, &mut records);
        }
        ToolData::Dns(records)
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Txt,
    Ptr,
}

struct Patterns {
    host: Vec<(Regex, Kind)>,
    dig: Option<Regex>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let host = [
            (r"^(\S+) has address (\S+)$", Kind::A),
            (r"^(\S+) has IPv6 address (\S+)$", Kind::Aaaa),
            (r"^(\S+) is an alias for (\S+)$", Kind::Cname),
            (r"^(\S+) mail is handled by (\d+ \S+)$", Kind::Mx),
            (r"^(\S+) name server (\S+)$", Kind::Ns),
            (r"^(\S+) descriptive text (.+)$", Kind::Txt),
            (r"^(\S+) domain name pointer (\S+)$", Kind::Ptr),
        ];
        Patterns {
            host: host
                .into_iter()
                .filter_map(|(re, kind)| Regex::new(re).ok().map(|regex| (regex, kind)))
                .collect(),
            dig: Regex::new(r"^(\S+)\s+\d+\s+IN\s+(A|AAAA|CNAME|MX|NS|TXT|PTR)\s+(.+)$").ok(),
        }
    })
}

fn collect_records(stdout: &str, records: &mut DnsRecords) {
    let patterns = patterns();
    for line in stdout.lines().map(str::trim) {
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        if let Some(captures) = patterns.dig.as_ref().and_then(|dig| dig.captures(line)) {
            let kind = match &captures[2] {
                "A" => Kind::A,
                "AAAA" => Kind::Aaaa,
                "CNAME" => Kind::Cname,
                "MX" => Kind::Mx,
                "NS" => Kind::Ns,
                "TXT" => Kind::Txt,
                _ => Kind::Ptr,
            };
            record(records, &captures[1], kind, captures[3].trim());
            continue;
        }

        for (regex, kind) in &patterns.host {
            if let Some(captures) = regex.captures(line) {
                record(records, &captures[1], *kind, &captures[2]);
                break;
            }
        }
    }
}

fn record(records: &mut DnsRecords, owner: &str, kind: Kind, value: &str) {
    if records.hostname.is_empty() {
        records.hostname = strip_dot(owner).to_string();
    }
    match kind {
        Kind::A => push_distinct(&mut records.a, value),
        Kind::Aaaa => push_distinct(&mut records.aaaa, value),
        Kind::Cname => push_distinct(&mut records.cname, strip_dot(value)),
        Kind::Mx => push_distinct(&mut records.mx, strip_dot(value)),
        Kind::Ns => push_distinct(&mut records.ns, strip_dot(value)),
        Kind::Txt => push_distinct(&mut records.txt, &unquote_txt(value)),
        Kind::Ptr => push_distinct(&mut records.ptr, strip_dot(value)),
    }
}

fn strip_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// `"v=spf1 " "include:x -all"` becomes `v=spf1 include:x -all`.
fn unquote_txt(value: &str) -> String {
    let value = value.trim();
    if !value.starts_with('"') {
        return value.to_string();
    }
    value
        .split('"')
        .enumerate()
        .filter(|(index, _)| index % 2 == 1)
        .map(|(_, chunk)| chunk)
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::builtin_tool_configs;

    fn adapter(name: &str) -> DnsAdapter {
        let config = builtin_tool_configs()
            .into_iter()
            .find(|c| c.name == name)
            .unwrap();
        DnsAdapter::new(config)
    }

    fn raw(tool: &str, target: &str, stdout: &str) -> RawOutput {
        RawOutput {
            target: target.to_string(),
            ..RawOutput::from_stdout(tool, stdout)
        }
    }

    const HOST_OUTPUT: &str = "www.example.com is an alias for example.com.
example.com has address 93.184.216.34
example.com has IPv6 address 2606:2800:220:1:248:1893:25c8:1946
example.com mail is handled by 10 mail.example.com.
example.com mail is handled by 10 mail.example.com.
example.com descriptive text \"v=spf1 -all\"
";

    #[test]
    fn parses_host_sentences() {
        let ToolData::Dns(records) = adapter("host").parse(&raw("host", "www.example.com", HOST_OUTPUT))
        else {
            panic!("expected dns records");
        };
        assert_eq!(records.hostname, "www.example.com");
        assert_eq!(records.a, vec!["93.184.216.34"]);
        assert_eq!(records.aaaa, vec!["2606:2800:220:1:248:1893:25c8:1946"]);
        assert_eq!(records.cname, vec!["example.com"]);
        assert_eq!(records.mx, vec!["10 mail.example.com"]);
        assert_eq!(records.txt, vec!["v=spf1 -all"]);
    }

    #[test]
    fn parses_dig_answer_lines() {
        let stdout = "; <<>> DiG 9.18 <<>> example.com\n\
example.com.\t\t3600\tIN\tA\t93.184.216.34\n\
example.com.\t\t86400\tIN\tNS\ta.iana-servers.net.\n\
example.com.\t\t300\tIN\tTXT\t\"v=spf1 \" \"-all\"\n";
        let ToolData::Dns(records) = adapter("dig").parse(&raw("dig", "", stdout)) else {
            panic!("expected dns records");
        };
        assert_eq!(records.hostname, "example.com");
        assert_eq!(records.a, vec!["93.184.216.34"]);
        assert_eq!(records.ns, vec!["a.iana-servers.net"]);
        assert_eq!(records.txt, vec!["v=spf1 -all"]);
    }

    #[test]
    fn reverse_lookup_records_pointer() {
        let stdout = "34.216.184.93.in-addr.arpa domain name pointer edge.example.net.\n";
        let data = adapter("host").parse(&raw("host", "93.184.216.34", stdout));
        assert_eq!(data.field("ptr").as_deref(), Some("edge.example.net"));
    }

    #[test]
    fn unmatched_output_is_empty() {
        let data = adapter("host").parse(&raw(
            "host",
            "nothing.example",
            "Host nothing.example not found: 3(NXDOMAIN)\n",
        ));
        let ToolData::Dns(records) = data else {
            panic!("expected dns records");
        };
        assert!(records.is_empty());
    }

    #[test]
    fn combine_merges_runs_without_duplicates() {
        let first = raw("host", "example.com", "example.com has address 93.184.216.34\n");
        let second = raw(
            "host",
            "example.com",
            "example.com has address 93.184.216.34\nexample.com has address 93.184.216.35\n",
        );
        let ToolData::Dns(records) = adapter("host").combine(&[first, second]) else {
            panic!("expected dns records");
        };
        assert_eq!(records.a, vec!["93.184.216.34", "93.184.216.35"]);
    }
}
