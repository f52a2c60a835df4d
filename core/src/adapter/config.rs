use super::AdapterError;
use crate::target::TargetRequirement;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_ARG_LENGTH: usize = 4096;
pub const DEFAULT_TOP_PORTS: u32 = 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jsonl,
    Xml,
    #[default]
    Text,
}

/// Declarative description of one external tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub default_args: Vec<String>,
    #[serde(default)]
    pub flag_sets: BTreeMap<String, FlagSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_flag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TargetRequirement>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub security: SecurityLimits,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_mappings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_top_ports: Option<u32>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "FlagSetDefinition")]
pub struct FlagSet {
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TargetRequirement>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FlagSetDefinition {
    Line(String),
    Detailed {
        args: ArgsDefinition,
        #[serde(default)]
        target_type: Option<TargetRequirement>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ArgsDefinition {
    Line(String),
    List(Vec<String>),
}

impl TryFrom<FlagSetDefinition> for FlagSet {
    type Error = String;

    fn try_from(def: FlagSetDefinition) -> Result<Self, Self::Error> {
        let (args, target_type) = match def {
            FlagSetDefinition::Line(line) => (ArgsDefinition::Line(line), None),
            FlagSetDefinition::Detailed { args, target_type } => (args, target_type),
        };
        let args = match args {
            ArgsDefinition::Line(line) => shell_words::split(&line)
                .map_err(|err| format!("failed to parse flag set '{line}': {err}"))?,
            ArgsDefinition::List(list) => list,
        };
        Ok(FlagSet { args, target_type })
    }
}

impl FlagSet {
    pub fn parse(line: &str) -> Result<Self, String> {
        FlagSet::try_from(FlagSetDefinition::Line(line.to_string()))
    }

    fn restricted(line: &str, requirement: TargetRequirement) -> Self {
        let mut set = FlagSet::parse(line).unwrap_or_else(|_| FlagSet {
            args: Vec::new(),
            target_type: None,
        });
        set.target_type = Some(requirement);
        set
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityLimits {
    #[serde(default = "default_max_arg_length")]
    pub max_arg_length: usize,
    #[serde(default = "default_forbidden")]
    pub forbidden_substrings: Vec<String>,
}

fn default_max_arg_length() -> usize {
    DEFAULT_MAX_ARG_LENGTH
}

fn default_forbidden() -> Vec<String> {
    [";", "&&", "||", "`", "$(", "\n"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_arg_length: DEFAULT_MAX_ARG_LENGTH,
            forbidden_substrings: default_forbidden(),
        }
    }
}

impl SecurityLimits {
    pub fn check(&self, tool: &str, arg: &str) -> Result<(), AdapterError> {
        if arg.len() > self.max_arg_length {
            return Err(AdapterError::ForbiddenArgument {
                tool: tool.to_string(),
                arg: truncate_arg(arg),
                reason: format!("exceeds {} characters", self.max_arg_length),
            });
        }
        if let Some(found) = self
            .forbidden_substrings
            .iter()
            .find(|needle| !needle.is_empty() && arg.contains(needle.as_str()))
        {
            return Err(AdapterError::ForbiddenArgument {
                tool: tool.to_string(),
                arg: truncate_arg(arg),
                reason: format!("contains forbidden sequence {found:?}"),
            });
        }
        Ok(())
    }
}

fn truncate_arg(arg: &str) -> String {
    const MAX: usize = 64;
    match arg.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &arg[..idx]),
        None => arg.to_string(),
    }
}

impl ToolConfig {
    pub fn new(name: impl Into<String>, output_format: OutputFormat) -> Self {
        let name = name.into();
        Self {
            command: name.clone(),
            name,
            description: String::new(),
            output_format,
            default_args: Vec::new(),
            flag_sets: BTreeMap::new(),
            target_flag: None,
            input_flags: Vec::new(),
            target_type: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            security: SecurityLimits::default(),
            field_mappings: BTreeMap::new(),
            fallback_top_ports: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Target restriction for a step using `flag_set`: the flag set's own
    /// restriction wins over the tool-wide one.
    pub fn requirement_for(&self, flag_set: Option<&str>) -> Option<TargetRequirement> {
        flag_set
            .and_then(|name| self.flag_sets.get(name))
            .and_then(|set| set.target_type)
            .or(self.target_type)
    }

    /// Default args, then the flag set's args, then explicit overrides.
    pub fn base_args(
        &self,
        flag_set: Option<&str>,
        overrides: &[String],
    ) -> Result<Vec<String>, AdapterError> {
        let mut args = self.default_args.clone();
        if let Some(name) = flag_set {
            let set = self
                .flag_sets
                .get(name)
                .ok_or_else(|| AdapterError::UnknownFlagSet {
                    tool: self.name.clone(),
                    flag_set: name.to_string(),
                })?;
            args.extend(set.args.iter().cloned());
        }
        args.extend(overrides.iter().cloned());

        for arg in &args {
            self.security.check(&self.name, arg)?;
        }
        Ok(args)
    }

    /// Path passed to one of the tool's input flags, if any.
    pub fn input_file<'a>(&self, args: &'a [String]) -> Option<&'a str> {
        args.windows(2)
            .find(|pair| self.input_flags.iter().any(|flag| flag == &pair[0]))
            .map(|pair| pair[1].as_str())
    }

    /// Full argument vector including the target, unless the args already
    /// carry it or read targets from an input file.
    pub fn command_args(&self, args: &[String], target: &str) -> Result<Vec<String>, AdapterError> {
        let mut full = args.to_vec();
        let reads_input = self.input_file(args).is_some();
        let has_target = target.is_empty() || args.iter().any(|arg| arg == target);
        if !reads_input && !has_target {
            self.security.check(&self.name, target)?;
            if let Some(flag) = &self.target_flag {
                full.push(flag.clone());
            }
            full.push(target.to_string());
        }
        Ok(full)
    }

    /// Projects raw output into named fields using `field_mappings`.
    pub fn project_fields(&self, stdout: &str) -> BTreeMap<String, Vec<Value>> {
        let mut projected = BTreeMap::new();
        for (field, path) in &self.field_mappings {
            let values = match self.output_format {
                OutputFormat::Jsonl => project_jsonl(stdout, path),
                OutputFormat::Xml => project_xml(stdout, path),
                OutputFormat::Text => project_text(stdout, path),
            };
            projected.insert(field.clone(), values);
        }
        projected
    }
}

fn push_unique(values: &mut Vec<Value>, value: Value) {
    if !value.is_null() && !values.contains(&value) {
        values.push(value);
    }
}

fn project_jsonl(stdout: &str, path: &str) -> Vec<Value> {
    let pointer = format!("/{}", path.replace('.', "/"));
    let mut values = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Ok(record) = serde_json::from_str::<Value>(line) {
            if let Some(found) = record.pointer(&pointer) {
                push_unique(&mut values, found.clone());
            }
        }
    }
    values
}

fn project_xml(stdout: &str, path: &str) -> Vec<Value> {
    let Some((element, attribute)) = path.split_once('@') else {
        tracing::warn!("xml field mapping '{path}' must look like element@attribute");
        return Vec::new();
    };

    let mut reader = Reader::from_str(stdout);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut values = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(tag)) | Ok(Event::Empty(tag)) => {
                if tag.name().as_ref() == element.as_bytes() {
                    for attr in tag.attributes().flatten() {
                        if attr.key.as_ref() == attribute.as_bytes() {
                            let value = String::from_utf8_lossy(&attr.value).to_string();
                            push_unique(&mut values, Value::String(value));
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                tracing::warn!("stopping xml field projection for '{path}': {err}");
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    values
}

fn project_text(stdout: &str, pattern: &str) -> Vec<Value> {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => {
            tracing::warn!("invalid text field mapping {pattern:?}: {err}");
            return Vec::new();
        }
    };
    let mut values = Vec::new();
    for captures in regex.captures_iter(stdout) {
        if let Some(found) = captures.get(1).or_else(|| captures.get(0)) {
            push_unique(&mut values, Value::String(found.as_str().to_string()));
        }
    }
    values
}

/// Configurations available without any tool documents on disk.
pub fn builtin_tool_configs() -> Vec<ToolConfig> {
    vec![naabu_config(), nmap_config(), host_config(), dig_config()]
}

fn flag_sets(entries: &[(&str, &str)]) -> BTreeMap<String, FlagSet> {
    entries
        .iter()
        .filter_map(|(name, line)| FlagSet::parse(line).ok().map(|set| (name.to_string(), set)))
        .collect()
}

fn naabu_config() -> ToolConfig {
    let mut config = ToolConfig::new("naabu", OutputFormat::Jsonl);
    config.description = "Fast TCP port discovery".to_string();
    config.default_args = vec!["-json".to_string(), "-silent".to_string()];
    config.flag_sets = flag_sets(&[
        ("fast", "-top-ports 100"),
        ("top1000", "-top-ports 1000"),
        ("full", "-p -"),
    ]);
    config.target_flag = Some("-host".to_string());
    config.input_flags = vec!["-list".to_string(), "-l".to_string()];
    config.field_mappings = BTreeMap::from([
        ("ip".to_string(), "ip".to_string()),
        ("port".to_string(), "port".to_string()),
    ]);
    config
}

fn nmap_config() -> ToolConfig {
    let mut config = ToolConfig::new("nmap", OutputFormat::Xml);
    config.description = "Service and version fingerprinting".to_string();
    config.default_args = vec!["-oX".to_string(), "-".to_string()];
    config.flag_sets = flag_sets(&[
        ("service", "-sV -Pn"),
        ("default_scripts", "-sV -sC -Pn"),
        ("fast", "-F -Pn"),
    ]);
    config.input_flags = vec!["-iL".to_string()];
    config.timeout_secs = 1800;
    config.fallback_top_ports = Some(DEFAULT_TOP_PORTS);
    config.field_mappings = BTreeMap::from([("address".to_string(), "address@addr".to_string())]);
    config
}

fn host_config() -> ToolConfig {
    let mut config = ToolConfig::new("host", OutputFormat::Text);
    config.description = "DNS lookups via host(1)".to_string();
    config.timeout_secs = 60;
    config.flag_sets = flag_sets(&[("a", "-t A"), ("aaaa", "-t AAAA"), ("any", "-a")]);
    for (name, line) in [("mx", "-t MX"), ("txt", "-t TXT"), ("spf", "-t TXT"), ("ns", "-t NS")] {
        config
            .flag_sets
            .insert(name.to_string(), FlagSet::restricted(line, TargetRequirement::DomainOnly));
    }
    config
}

fn dig_config() -> ToolConfig {
    let mut config = ToolConfig::new("dig", OutputFormat::Text);
    config.description = "DNS lookups via dig(1)".to_string();
    config.timeout_secs = 60;
    config.default_args = vec!["+noall".to_string(), "+answer".to_string()];
    config.flag_sets = flag_sets(&[("a", "A"), ("aaaa", "AAAA")]);
    for (name, line) in [("mx", "MX"), ("txt", "TXT"), ("spf", "TXT"), ("ns", "NS")] {
        config
            .flag_sets
            .insert(name.to_string(), FlagSet::restricted(line, TargetRequirement::DomainOnly));
    }
    config
        .flag_sets
        .insert("ptr".to_string(), FlagSet::restricted("-x", TargetRequirement::IpOnly));
    config
}
