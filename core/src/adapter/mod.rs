//! Tool adapters: argument building, process invocation, and normalization of
//! each tool's native output into [`ToolData`].

pub mod config;
pub mod dns;
pub mod naabu;
pub mod nmap;
pub mod process;

use crate::records::ToolData;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub use config::{builtin_tool_configs, FlagSet, OutputFormat, SecurityLimits, ToolConfig};
pub use dns::DnsAdapter;
pub use naabu::NaabuAdapter;
pub use nmap::NmapAdapter;
pub use process::{Invocation, ProcessOutput, ProcessRunner, TokioProcessRunner};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("{tool} exited with code {code:?}: {stderr}")]
    NonZeroExit {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to spawn '{program}' for {tool}: {source}")]
    Spawn {
        tool: String,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} timed out after {}s", timeout.as_secs())]
    Timeout { tool: String, timeout: Duration },
    #[error("{tool} was cancelled")]
    Cancelled { tool: String },
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("unknown flag set '{flag_set}' for tool '{tool}'")]
    UnknownFlagSet { tool: String, flag_set: String },
    #[error("{tool}: refusing argument {arg:?}: {reason}")]
    ForbiddenArgument {
        tool: String,
        arg: String,
        reason: String,
    },
}

impl AdapterError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AdapterError::Cancelled { .. })
    }
}

/// Captured output of one tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub tool: String,
    pub target: String,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl RawOutput {
    pub fn from_stdout(tool: &str, stdout: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            stdout: stdout.into(),
            exit_code: Some(0),
            ..RawOutput::default()
        }
    }
}

#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn config(&self) -> &ToolConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn build_args(
        &self,
        flag_set: Option<&str>,
        overrides: &[String],
    ) -> Result<Vec<String>, AdapterError> {
        self.config().base_args(flag_set, overrides)
    }

    /// Runs the tool once. A non-zero exit is an error carrying stderr.
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        runner: &dyn ProcessRunner,
        args: &[String],
        target: &str,
    ) -> Result<RawOutput, AdapterError> {
        let config = self.config();
        let invocation = Invocation {
            tool: config.name.clone(),
            program: config.command.clone(),
            args: config.command_args(args, target)?,
            timeout: config.timeout(),
        };
        tracing::debug!(tool = %config.name, args = ?invocation.args, "invoking tool");

        let started = Instant::now();
        let output = runner.run(cancel, &invocation).await?;
        if !output.success() {
            return Err(AdapterError::NonZeroExit {
                tool: config.name.clone(),
                code: output.exit_code,
                stderr: truncate_output(&output.stderr),
            });
        }

        Ok(RawOutput {
            tool: config.name.clone(),
            target: target.to_string(),
            args: invocation.args,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration: started.elapsed(),
        })
    }

    fn parse(&self, raw: &RawOutput) -> ToolData;

    fn combine(&self, runs: &[RawOutput]) -> ToolData;

    /// Well-formed output for a run that had nothing to scan.
    fn empty_output(&self, target: &str) -> RawOutput {
        RawOutput {
            tool: self.name().to_string(),
            target: target.to_string(),
            exit_code: Some(0),
            ..RawOutput::default()
        }
    }
}

/// Adapter for configured tools without a dedicated parser. Output is kept
/// verbatim; only configured field mappings are extracted.
#[derive(Debug, Clone)]
pub struct GenericAdapter {
    config: ToolConfig,
}

impl GenericAdapter {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ToolAdapter for GenericAdapter {
    fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn parse(&self, raw: &RawOutput) -> ToolData {
        ToolData::Raw {
            lines: raw.stdout.lines().filter(|l| !l.trim().is_empty()).count(),
        }
    }

    fn combine(&self, runs: &[RawOutput]) -> ToolData {
        let lines = runs
            .iter()
            .map(|raw| raw.stdout.lines().filter(|l| !l.trim().is_empty()).count())
            .sum();
        ToolData::Raw { lines }
    }
}

/// Picks the adapter implementation for a configuration.
pub fn adapter_for(config: ToolConfig) -> Arc<dyn ToolAdapter> {
    match config.name.as_str() {
        "naabu" => Arc::new(NaabuAdapter::new(config)),
        "nmap" => Arc::new(NmapAdapter::new(config)),
        "host" | "dig" => Arc::new(DnsAdapter::new(config)),
        _ => match config.output_format {
            OutputFormat::Jsonl if config.command.contains("naabu") => {
                Arc::new(NaabuAdapter::new(config))
            }
            OutputFormat::Xml if config.command.contains("nmap") => {
                Arc::new(NmapAdapter::new(config))
            }
            _ => Arc::new(GenericAdapter::new(config)),
        },
    }
}

/// Adapters by tool name. Built explicitly and handed to the executor.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    adapters: BTreeMap<String, Arc<dyn ToolAdapter>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for config in builtin_tool_configs() {
            registry.register_config(config);
        }
        registry
    }

    /// Registers (or replaces) the adapter for `config.name`.
    pub fn register_config(&mut self, config: ToolConfig) {
        let adapter = adapter_for(config);
        self.register(adapter);
    }

    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, tool: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(tool).cloned()
    }

    pub fn config(&self, tool: &str) -> Option<&ToolConfig> {
        self.adapters.get(tool).map(|adapter| adapter.config())
    }

    pub fn configs(&self) -> Vec<ToolConfig> {
        self.adapters.values().map(|a| a.config().clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

pub(crate) fn truncate_output(text: &str) -> String {
    const MAX: usize = 512;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Deduplicates while keeping first-seen order.
pub(crate) fn push_distinct(list: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned stdout per tool and records every invocation.
    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Mutex<BTreeMap<String, Vec<ProcessOutput>>>,
        pub calls: Mutex<Vec<Invocation>>,
        pub delay: Duration,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub fn respond(&self, tool: &str, stdout: &str) {
            self.push(
                tool,
                ProcessOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    exit_code: Some(0),
                },
            );
        }

        pub fn fail(&self, tool: &str, code: i32, stderr: &str) {
            self.push(
                tool,
                ProcessOutput {
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                    exit_code: Some(code),
                },
            );
        }

        fn push(&self, tool: &str, output: ProcessOutput) {
            self.responses
                .lock()
                .unwrap()
                .entry(tool.to_string())
                .or_default()
                .push(output);
        }

        pub fn calls_for(&self, tool: &str) -> Vec<Invocation> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|call| call.tool == tool)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(
            &self,
            cancel: &CancellationToken,
            invocation: &Invocation,
        ) -> Result<ProcessOutput, AdapterError> {
            self.calls.lock().unwrap().push(invocation.clone());
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(AdapterError::Cancelled { tool: invocation.tool.clone() });
                    }
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            let next = {
                let mut responses = self.responses.lock().unwrap();
                match responses.get_mut(&invocation.tool) {
                    Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
                    Some(queue) => queue.first().cloned(),
                    None => None,
                }
            };
            Ok(next.unwrap_or(ProcessOutput {
                exit_code: Some(0),
                ..ProcessOutput::default()
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    #[test]
    fn builtin_registry_has_specialised_adapters() {
        let registry = ToolRegistry::builtin();
        assert_eq!(registry.names(), vec!["dig", "host", "naabu", "nmap"]);
        assert_eq!(registry.config("nmap").map(|c| c.output_format), Some(OutputFormat::Xml));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn registering_a_config_replaces_builtin() {
        let mut registry = ToolRegistry::builtin();
        let mut custom = ToolConfig::new("nmap", OutputFormat::Xml);
        custom.command = "/opt/nmap/bin/nmap".to_string();
        registry.register_config(custom);
        assert_eq!(
            registry.config("nmap").map(|c| c.command.as_str()),
            Some("/opt/nmap/bin/nmap")
        );
    }

    #[tokio::test]
    async fn invoke_surfaces_non_zero_exit() {
        let runner = ScriptedRunner::new();
        runner.fail("host", 1, "Host example.invalid not found: 3(NXDOMAIN)");
        let registry = ToolRegistry::builtin();
        let adapter = registry.get("host").unwrap();
        let cancel = CancellationToken::new();

        let err = adapter
            .invoke(&cancel, &runner, &[], "example.invalid")
            .await
            .unwrap_err();
        match err {
            AdapterError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("NXDOMAIN"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_appends_target_and_records_args() {
        let runner = ScriptedRunner::new();
        runner.respond("naabu", "{\"ip\":\"10.0.0.1\",\"port\":22}\n");
        let registry = ToolRegistry::builtin();
        let adapter = registry.get("naabu").unwrap();
        let cancel = CancellationToken::new();

        let args = adapter.build_args(Some("fast"), &[]).unwrap();
        let raw = adapter.invoke(&cancel, &runner, &args, "10.0.0.1").await.unwrap();
        assert_eq!(raw.target, "10.0.0.1");
        assert_eq!(
            raw.args,
            vec!["-json", "-silent", "-top-ports", "100", "-host", "10.0.0.1"]
        );
        assert_eq!(runner.calls_for("naabu").len(), 1);
        assert_eq!(adapter.parse(&raw).record_count(), 1);
    }

    #[test]
    fn generic_adapter_counts_lines() {
        let adapter = GenericAdapter::new(ToolConfig::new("whatweb", OutputFormat::Text));
        let raw = RawOutput::from_stdout("whatweb", "one\n\ntwo\n");
        assert_eq!(adapter.parse(&raw), ToolData::Raw { lines: 2 });
        assert_eq!(
            adapter.combine(&[raw.clone(), raw]),
            ToolData::Raw { lines: 4 }
        );
    }
}
