use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Ipv4,
    Ipv6,
    Domain,
    Hostname,
    Unknown,
}

impl TargetType {
    pub fn is_ip(self) -> bool {
        matches!(self, TargetType::Ipv4 | TargetType::Ipv6)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::Ipv4 => "ipv4",
            TargetType::Ipv6 => "ipv6",
            TargetType::Domain => "domain",
            TargetType::Hostname => "hostname",
            TargetType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a scan target, computed once per workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetInfo {
    pub original: String,
    pub kind: TargetType,
    pub is_local: bool,
    pub is_private: bool,
}

/// Restricts a step to a class of targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetRequirement {
    DomainOnly,
    IpOnly,
}

impl TargetRequirement {
    pub fn permits(self, target: &TargetInfo) -> bool {
        match self {
            TargetRequirement::DomainOnly => target.kind == TargetType::Domain,
            TargetRequirement::IpOnly => target.kind.is_ip(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetRequirement::DomainOnly => "domain_only",
            TargetRequirement::IpOnly => "ip_only",
        }
    }
}

/// Classifies `target`. Never fails: anything unrecognised is `Unknown`.
pub fn classify(target: &str) -> TargetInfo {
    let trimmed = target.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);

    if let Ok(addr) = unbracketed.parse::<IpAddr>() {
        return classify_ip(target, addr);
    }

    let name = trimmed.strip_suffix('.').unwrap_or(trimmed).to_ascii_lowercase();

    if is_domain_name(&name) {
        let is_local =
            name == "localhost" || name.ends_with(".localhost") || name.ends_with(".local");
        return TargetInfo {
            original: target.to_string(),
            kind: TargetType::Domain,
            is_local,
            is_private: false,
        };
    }

    let kind = if is_label(&name) {
        TargetType::Hostname
    } else {
        TargetType::Unknown
    };

    TargetInfo {
        original: target.to_string(),
        kind,
        is_local: false,
        is_private: false,
    }
}

fn classify_ip(original: &str, addr: IpAddr) -> TargetInfo {
    let (kind, is_local, is_private) = match addr {
        IpAddr::V4(v4) => {
            let local = v4.is_loopback() || v4.is_link_local();
            (TargetType::Ipv4, local, local || is_private_v4(v4))
        }
        IpAddr::V6(v6) => {
            let local = v6.is_loopback() || is_link_local_v6(v6);
            (TargetType::Ipv6, local, local || is_unique_local_v6(v6))
        }
    };

    TargetInfo {
        original: original.to_string(),
        kind,
        is_local,
        is_private,
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    addr.is_private()
}

fn is_link_local_v6(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn is_unique_local_v6(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

fn is_domain_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
        return false;
    }
    if name == "localhost" {
        return true;
    }
    if !name.contains('.') {
        return false;
    }
    name.split('.').all(is_label)
}

fn is_label(label: &str) -> bool {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return false;
    }
    let bytes = label.as_bytes();
    let bounded = bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    bounded
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documentation_address_is_public_ipv4() {
        let info = classify("192.0.2.10");
        assert_eq!(info.kind, TargetType::Ipv4);
        assert!(!info.is_private);
        assert!(!info.is_local);
    }

    #[test]
    fn rfc1918_address_is_private() {
        let info = classify("10.0.0.5");
        assert_eq!(info.kind, TargetType::Ipv4);
        assert!(info.is_private);
        assert!(!info.is_local);
    }

    #[test]
    fn loopback_is_local_and_private() {
        let info = classify("127.0.0.1");
        assert!(info.is_local);
        assert!(info.is_private);

        let v6 = classify("[::1]");
        assert_eq!(v6.kind, TargetType::Ipv6);
        assert!(v6.is_local);
    }

    #[test]
    fn ipv6_ranges() {
        assert!(classify("fe80::1").is_local);
        let ula = classify("fd12:3456::1");
        assert!(ula.is_private);
        assert!(!ula.is_local);
        let public = classify("2001:db8::1");
        assert_eq!(public.kind, TargetType::Ipv6);
        assert!(!public.is_private);
    }

    #[test]
    fn domains_and_local_names() {
        let api = classify("api.example.com");
        assert_eq!(api.kind, TargetType::Domain);
        assert!(!api.is_local);

        let localhost = classify("localhost");
        assert_eq!(localhost.kind, TargetType::Domain);
        assert!(localhost.is_local);

        assert!(classify("printer.local").is_local);
        assert!(classify("app.localhost").is_local);
        assert_eq!(classify("Example.COM.").kind, TargetType::Domain);
    }

    #[test]
    fn bare_label_is_hostname() {
        let info = classify("fileserver-01");
        assert_eq!(info.kind, TargetType::Hostname);
        assert!(!info.is_local);
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(classify("-bad.example.com").kind, TargetType::Unknown);
        assert_eq!(classify("bad-.example.com").kind, TargetType::Unknown);
        assert_eq!(classify("a..b").kind, TargetType::Unknown);
        assert_eq!(classify("").kind, TargetType::Unknown);
        assert_eq!(classify("under_score.com").kind, TargetType::Unknown);

        let long_label = format!("{}.com", "a".repeat(64));
        assert_eq!(classify(&long_label).kind, TargetType::Unknown);

        let long_name = vec!["abcdefghi"; 26].join(".");
        assert!(long_name.len() > MAX_DOMAIN_LEN);
        assert_eq!(classify(&long_name).kind, TargetType::Unknown);
    }

    #[test]
    fn requirements_gate_by_type() {
        let domain = classify("example.org");
        let ip = classify("198.51.100.7");
        let host = classify("intranet");

        assert!(TargetRequirement::DomainOnly.permits(&domain));
        assert!(!TargetRequirement::DomainOnly.permits(&ip));
        assert!(!TargetRequirement::DomainOnly.permits(&host));
        assert!(TargetRequirement::IpOnly.permits(&ip));
        assert!(!TargetRequirement::IpOnly.permits(&domain));
    }
}
