use crate::adapter::{AdapterError, ProcessRunner, RawOutput, TokioProcessRunner, ToolRegistry};
use crate::monitor::{notify, Monitor, NoopMonitor};
use crate::records::{join_ports, ToolData};
use crate::target::{classify, TargetInfo, TargetRequirement};
use crate::template::{substitute, Placeholder, TemplateError};
use crate::transform::{self, ports_file_for, Hostlist, Merged, TransformError};
use crate::validation::{validate_workflow, ValidationError};
use crate::workflow::{Step, StepAction, ToolInvocation, TransformKind, Workflow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
    Blocked,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed | StepStatus::Blocked
        )
    }

    /// Dependents may start after this status.
    pub fn unblocks(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in progress",
            StepStatus::Completed => "completed",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
            StepStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished step produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepPayload {
    #[default]
    Empty,
    Tool {
        data: ToolData,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        fields: BTreeMap<String, Vec<Value>>,
    },
    Hostlist(Hostlist),
    Merged(Merged),
}

impl StepPayload {
    /// Value of `{{step.<name>}}` for dependents. Lists are comma-joined.
    pub fn field(&self, name: &str) -> Option<String> {
        match self {
            StepPayload::Empty => None,
            StepPayload::Tool { data, fields } => data
                .field(name)
                .or_else(|| fields.get(name).map(|values| join_values(values))),
            StepPayload::Hostlist(list) => match name {
                "hosts" => Some(list.hosts.join(",")),
                "ports" => Some(join_ports(&list.ports)),
                "ports_file" => Some(list.ports_file.clone()),
                "count" => Some(list.hosts.len().to_string()),
                _ => None,
            },
            StepPayload::Merged(merged) => match name {
                "records" | "count" => Some(merged.records.to_string()),
                "inputs" => Some(merged.inputs.to_string()),
                _ => None,
            },
        }
    }
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: String,
    pub step_type: String,
    pub status: StepStatus,
    pub output: Option<String>,
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub duration: Duration,
    pub payload: StepPayload,
}

impl StepResult {
    fn new(step: &Step, status: StepStatus) -> Self {
        Self {
            step: step.id.clone(),
            step_type: step.kind_label().to_string(),
            status,
            output: step.output.clone(),
            success: status.unblocks(),
            skipped: status == StepStatus::Skipped,
            error: None,
            started_at: None,
            completed_at: None,
            duration: Duration::ZERO,
            payload: StepPayload::Empty,
        }
    }

    pub fn completed(step: &Step, started: OffsetDateTime, payload: StepPayload) -> Self {
        Self {
            started_at: Some(started),
            payload,
            ..Self::new(step, StepStatus::Completed)
        }
        .finish(started)
    }

    pub fn failed(step: &Step, started: OffsetDateTime, error: impl Into<String>) -> Self {
        Self {
            started_at: Some(started),
            error: Some(error.into()),
            ..Self::new(step, StepStatus::Failed)
        }
        .finish(started)
    }

    pub fn skipped(step: &Step, reason: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            started_at: Some(now),
            error: Some(reason.into()),
            ..Self::new(step, StepStatus::Skipped)
        }
        .finish(now)
    }

    pub fn blocked(step: &Step, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(step, StepStatus::Blocked)
        }
    }

    fn finish(mut self, started: OffsetDateTime) -> Self {
        let completed = OffsetDateTime::now_utc();
        self.completed_at = Some(completed);
        self.duration = (completed - started).try_into().unwrap_or_default();
        self
    }

    /// Value of `{{step.<field>}}` for dependents.
    pub fn field(&self, field: &str) -> Option<String> {
        match field {
            "output" => self.output.clone(),
            "ports_file" => match &self.payload {
                StepPayload::Hostlist(list) => Some(list.ports_file.clone()),
                _ => self.output.as_deref().map(ports_file_for),
            },
            "error" => Some(self.error.clone().unwrap_or_default()),
            "status" => Some(self.status.to_string()),
            _ => self.payload.field(field),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("tool '{0}' is not registered")]
    UnknownTool(String),
    #[error("runs must be at least 1")]
    NoRuns,
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize combined output: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            StepError::Cancelled => true,
            StepError::Adapter(err) => err.is_cancelled(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}': {}", self.step, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("workflow '{workflow}' failed: {}", join_failures(failures))]
    StepsFailed {
        workflow: String,
        failures: Vec<StepFailure>,
    },
    #[error("workflow '{workflow}' was cancelled")]
    Cancelled { workflow: String },
}

impl WorkflowError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled { .. })
    }
}

fn join_failures(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-step results of one workflow run, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub workflow: String,
    pub target: TargetInfo,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration: Duration,
    pub steps: Vec<StepResult>,
}

impl ExecutionReport {
    fn empty(workflow: &str, target: TargetInfo) -> Self {
        Self {
            workflow: workflow.to_string(),
            target,
            started_at: OffsetDateTime::now_utc(),
            duration: Duration::ZERO,
            steps: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step.status, StepStatus::Failed | StepStatus::Blocked))
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.step == id)
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            writeln!(f, "No steps executed for {}.", self.workflow)?;
            return Ok(());
        }

        writeln!(
            f,
            "Workflow {} against {} ({}):",
            self.workflow, self.target.original, self.target.kind
        )?;
        for step in &self.steps {
            writeln!(
                f,
                "  - [{}] {} ({}, {} ms)",
                step.status,
                step.step,
                step.step_type,
                step.duration.as_millis()
            )?;
            if let Some(message) = &step.error {
                for line in message.lines() {
                    writeln!(f, "      {}", line)?;
                }
            }
        }
        Ok(())
    }
}

/// Outcome of [`Executor::run`]: the report is always present, even when the
/// run failed.
#[derive(Debug)]
pub struct WorkflowRun {
    pub report: ExecutionReport,
    pub result: Result<(), WorkflowError>,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Succeed without running a tool whose input-list file is missing or blank.
    pub recover_empty_inputs: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            recover_empty_inputs: true,
        }
    }
}

#[derive(Debug, Default)]
struct ExecutionState {
    statuses: BTreeMap<String, StepStatus>,
    results: BTreeMap<String, StepResult>,
}

/// Runs one workflow against one target. Every step becomes a task that
/// waits on its dependencies' completion signals.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<ToolRegistry>,
    runner: Arc<dyn ProcessRunner>,
    monitor: Arc<dyn Monitor>,
    config: ExecutorConfig,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            runner: Arc::new(TokioProcessRunner),
            monitor: Arc::new(NoopMonitor),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn run(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        target: &str,
    ) -> WorkflowRun {
        let info = classify(target);
        let started = Instant::now();
        notify(
            "workflow_started",
            self.monitor.workflow_started(&workflow.id, &info.original),
        );

        if let Err(err) = validate_workflow(workflow) {
            let err = WorkflowError::from(err);
            self.finish_workflow(workflow, &info, started, Some(&err));
            return WorkflowRun {
                report: ExecutionReport::empty(&workflow.id, info),
                result: Err(err),
            };
        }

        tracing::info!(
            workflow = %workflow.id,
            target = %info.original,
            kind = %info.kind,
            steps = workflow.steps.len(),
            "starting workflow"
        );

        let mut report = ExecutionReport::empty(&workflow.id, info.clone());
        let state = Arc::new(Mutex::new(ExecutionState::default()));
        let halt = CancellationToken::new();

        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for step in &workflow.steps {
            let (sender, receiver) = watch::channel(StepStatus::Pending);
            senders.insert(step.id.clone(), sender);
            receivers.insert(step.id.clone(), receiver);
        }
        {
            let mut guard = state.lock().await;
            for step in &workflow.steps {
                guard.statuses.insert(step.id.clone(), StepStatus::Pending);
            }
        }

        let mut tasks = JoinSet::new();
        for step in &workflow.steps {
            let Some(signal) = senders.remove(&step.id) else {
                continue;
            };
            let dependencies = step
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();
            let task = StepTask {
                executor: self.clone(),
                workflow: workflow.id.clone(),
                continue_on_error: workflow.continue_on_error,
                step: step.clone(),
                target: info.clone(),
                state: state.clone(),
                dependencies,
                signal,
                cancel: cancel.clone(),
                halt: halt.clone(),
            };
            tasks.spawn(task.run());
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(workflow = %workflow.id, "step task ended abnormally: {err}");
            }
        }

        let mut guard = state.lock().await;
        for step in &workflow.steps {
            let result = guard.results.remove(&step.id).unwrap_or_else(|| {
                let now = OffsetDateTime::now_utc();
                StepResult::failed(step, now, "step task ended without a result")
            });
            report.steps.push(result);
        }
        drop(guard);
        report.duration = started.elapsed();

        let result = if cancel.is_cancelled() {
            Err(WorkflowError::Cancelled {
                workflow: workflow.id.clone(),
            })
        } else {
            let failures = collect_failures(workflow, &report);
            if failures.is_empty() {
                Ok(())
            } else {
                Err(WorkflowError::StepsFailed {
                    workflow: workflow.id.clone(),
                    failures,
                })
            }
        };

        self.finish_workflow(workflow, &report.target, started, result.as_ref().err());
        WorkflowRun { report, result }
    }

    fn finish_workflow(
        &self,
        workflow: &Workflow,
        target: &TargetInfo,
        started: Instant,
        error: Option<&WorkflowError>,
    ) {
        let message = error.map(|err| err.to_string());
        match &message {
            Some(message) => {
                tracing::warn!(workflow = %workflow.id, target = %target.original, "workflow failed: {message}")
            }
            None => tracing::info!(workflow = %workflow.id, target = %target.original, "workflow completed"),
        }
        notify(
            "workflow_completed",
            self.monitor.workflow_completed(
                &workflow.id,
                &target.original,
                started.elapsed(),
                message.as_deref(),
            ),
        );
    }

    /// Restriction for `step`: its own, else its flag set's, else the tool's.
    fn requirement(&self, step: &Step) -> Option<TargetRequirement> {
        step.target_type.or_else(|| {
            step.tool_invocation().and_then(|invocation| {
                self.registry
                    .config(&invocation.tool)
                    .and_then(|config| config.requirement_for(invocation.flag_set.as_deref()))
            })
        })
    }

    async fn execute_tool(
        &self,
        cancel: &CancellationToken,
        step: &Step,
        invocation: &ToolInvocation,
        target: &TargetInfo,
        resolve: &(dyn Fn(&str) -> Result<String, TemplateError> + Sync),
    ) -> Result<StepPayload, StepError> {
        let adapter = self
            .registry
            .get(&invocation.tool)
            .ok_or_else(|| StepError::UnknownTool(invocation.tool.clone()))?;
        if invocation.runs == 0 {
            return Err(StepError::NoRuns);
        }

        let overrides = invocation
            .args
            .iter()
            .map(|arg| resolve(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let args = adapter.build_args(invocation.flag_set.as_deref(), &overrides)?;
        let target_arg = target.original.trim();

        let empty_input = adapter
            .config()
            .input_file(&args)
            .filter(|path| self.config.recover_empty_inputs && input_is_empty(Path::new(path)));

        let mut runs: Vec<RawOutput> = Vec::new();
        if let Some(path) = empty_input {
            tracing::info!(
                step = %step.id,
                tool = %invocation.tool,
                "input list {path} is empty; recording empty output without running"
            );
            runs.push(adapter.empty_output(target_arg));
        } else {
            for attempt in 1..=invocation.runs {
                tracing::debug!(step = %step.id, attempt, runs = invocation.runs, "running tool");
                let started = Instant::now();
                let outcome = adapter
                    .invoke(cancel, self.runner.as_ref(), &args, target_arg)
                    .await;
                let error = outcome.as_ref().err().map(|err| err.to_string());
                notify(
                    "tool_executed",
                    self.monitor.tool_executed(
                        &invocation.tool,
                        &args,
                        started.elapsed(),
                        error.as_deref(),
                    ),
                );
                let raw = outcome.map_err(|err| {
                    if err.is_cancelled() {
                        StepError::Cancelled
                    } else {
                        StepError::Adapter(err)
                    }
                })?;
                runs.push(raw);
            }
        }

        let data = match runs.as_slice() {
            [single] => adapter.parse(single),
            many => adapter.combine(many),
        };

        let mut fields: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for raw in &runs {
            for (name, values) in adapter.config().project_fields(&raw.stdout) {
                let merged = fields.entry(name).or_default();
                for value in values {
                    if !merged.contains(&value) {
                        merged.push(value);
                    }
                }
            }
        }

        if let Some(output) = &step.output {
            write_tool_output(output, &runs, &data)?;
        }

        Ok(StepPayload::Tool { data, fields })
    }

    fn execute_transform(
        &self,
        step: &Step,
        kind: TransformKind,
        resolve: &(dyn Fn(&str) -> Result<String, TemplateError> + Sync),
    ) -> Result<StepPayload, StepError> {
        let output = step
            .output
            .as_deref()
            .ok_or(TransformError::MissingOutput {
                transform: kind.as_str(),
            })?;
        let inputs = step
            .inputs
            .iter()
            .map(|input| resolve(input).map(PathBuf::from))
            .collect::<Result<Vec<_>, _>>()?;

        match kind {
            TransformKind::JsonToHostlist => {
                let [input] = inputs.as_slice() else {
                    return Err(TransformError::InputCount {
                        transform: kind.as_str(),
                        expected: 1,
                        found: inputs.len(),
                    }
                    .into());
                };
                Ok(StepPayload::Hostlist(transform::json_to_hostlist(
                    input,
                    Path::new(output),
                )?))
            }
            TransformKind::MergeFiles => Ok(StepPayload::Merged(transform::merge_files(
                &inputs,
                Path::new(output),
            )?)),
        }
    }
}

/// Failed required steps, plus required steps that never ran because a
/// failure upstream blocked them. Steps blocked only by a halt or a cancel
/// are left out.
fn collect_failures(workflow: &Workflow, report: &ExecutionReport) -> Vec<StepFailure> {
    let mut roots = BTreeMap::new();
    let mut failures = Vec::new();
    for step in workflow.steps.iter().filter(|step| !step.optional) {
        let Some(result) = report.step(&step.id) else {
            continue;
        };
        match result.status {
            StepStatus::Failed => failures.push(StepFailure {
                step: step.id.clone(),
                error: result.error.clone().unwrap_or_default(),
            }),
            StepStatus::Blocked => {
                if let Some(root) = failed_ancestor(&step.id, workflow, report, &mut roots) {
                    failures.push(StepFailure {
                        step: step.id.clone(),
                        error: format!("blocked by failed step '{root}'"),
                    });
                }
            }
            _ => {}
        }
    }
    failures
}

/// The failed step a blocked step traces back to, if any. The graph is
/// acyclic by the time a run finishes.
fn failed_ancestor(
    id: &str,
    workflow: &Workflow,
    report: &ExecutionReport,
    memo: &mut BTreeMap<String, Option<String>>,
) -> Option<String> {
    if let Some(known) = memo.get(id) {
        return known.clone();
    }
    let found = match report.step(id).map(|result| result.status) {
        Some(StepStatus::Failed) => Some(id.to_string()),
        Some(StepStatus::Blocked) => workflow.step(id).and_then(|step| {
            step.depends_on
                .iter()
                .find_map(|dep| failed_ancestor(dep, workflow, report, memo))
        }),
        _ => None,
    };
    memo.insert(id.to_string(), found.clone());
    found
}

fn input_is_empty(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(contents) => contents.trim().is_empty(),
        Err(err) => err.kind() == std::io::ErrorKind::NotFound,
    }
}

fn write_tool_output(output: &str, runs: &[RawOutput], data: &ToolData) -> Result<(), StepError> {
    match runs {
        [single] => write_file(Path::new(output), single.stdout.as_bytes()),
        many => {
            for (index, raw) in many.iter().enumerate() {
                let path = format!("{output}.run{}", index + 1);
                write_file(Path::new(&path), raw.stdout.as_bytes())?;
            }
            let combined = serde_json::to_vec_pretty(data)?;
            write_file(Path::new(output), &combined)
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StepError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StepError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| StepError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Everything one step task owns.
struct StepTask {
    executor: Executor,
    workflow: String,
    continue_on_error: bool,
    step: Step,
    target: TargetInfo,
    state: Arc<Mutex<ExecutionState>>,
    dependencies: Vec<(String, watch::Receiver<StepStatus>)>,
    signal: watch::Sender<StepStatus>,
    cancel: CancellationToken,
    halt: CancellationToken,
}

impl StepTask {
    async fn run(mut self) {
        let result = self.evaluate().await;
        let fatal = result.status == StepStatus::Failed
            && !self.step.optional
            && !self.continue_on_error
            && !self.cancel.is_cancelled();

        notify(
            "step_executed",
            self.executor.monitor.step_executed(
                &self.workflow,
                &self.step.id,
                &result.step_type,
                result.duration,
                result.error.as_deref().filter(|_| !result.success),
            ),
        );

        let status = result.status;
        {
            let mut state = self.state.lock().await;
            state.statuses.insert(self.step.id.clone(), status);
            state.results.insert(self.step.id.clone(), result);
        }
        self.signal.send_replace(status);

        if fatal {
            tracing::warn!(
                workflow = %self.workflow,
                step = %self.step.id,
                "fatal step failure; no further steps will start"
            );
            self.halt.cancel();
        }
    }

    async fn evaluate(&mut self) -> StepResult {
        let mut dependency_statuses = Vec::with_capacity(self.dependencies.len());
        for (dependency, receiver) in &mut self.dependencies {
            let status = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return StepResult::blocked(&self.step, "workflow cancelled before the step started");
                }
                changed = receiver.wait_for(|status| status.is_terminal()) => {
                    changed.map(|status| *status).unwrap_or(StepStatus::Blocked)
                }
            };
            dependency_statuses.push((dependency.clone(), status));
        }

        if let Some((dependency, status)) = dependency_statuses
            .iter()
            .find(|(_, status)| !status.unblocks())
        {
            tracing::info!(step = %self.step.id, "blocked by {dependency} ({status})");
            return StepResult::blocked(
                &self.step,
                format!("dependency '{dependency}' {status}"),
            );
        }
        if self.cancel.is_cancelled() {
            return StepResult::blocked(&self.step, "workflow cancelled before the step started");
        }
        if self.halt.is_cancelled() {
            return StepResult::blocked(&self.step, "workflow halted after a fatal failure");
        }

        if let Some(requirement) = self.executor.requirement(&self.step) {
            if !requirement.permits(&self.target) {
                let reason = format!(
                    "requires a {} target, got {}",
                    requirement.as_str(),
                    self.target.kind
                );
                tracing::info!(step = %self.step.id, "skipped: {reason}");
                return StepResult::skipped(&self.step, reason);
            }
        }

        let dependencies = {
            let mut state = self.state.lock().await;
            state
                .statuses
                .insert(self.step.id.clone(), StepStatus::InProgress);
            self.step
                .depends_on
                .iter()
                .filter_map(|dep| state.results.get(dep).map(|r| (dep.clone(), r.clone())))
                .collect::<BTreeMap<_, _>>()
        };
        self.signal.send_replace(StepStatus::InProgress);

        let started = OffsetDateTime::now_utc();
        tracing::info!(workflow = %self.workflow, step = %self.step.id, "step started");

        let target = self.target.clone();
        let resolve = |value: &str| resolve_runtime(value, &target, &dependencies);
        let outcome = match &self.step.action {
            StepAction::Tool(invocation) => {
                self.executor
                    .execute_tool(&self.cancel, &self.step, invocation, &target, &resolve)
                    .await
            }
            StepAction::Transform(kind) => {
                self.executor.execute_transform(&self.step, *kind, &resolve)
            }
        };

        match outcome {
            Ok(payload) => StepResult::completed(&self.step, started, payload),
            Err(err) => {
                let message = if err.is_cancelled() {
                    StepError::Cancelled.to_string()
                } else {
                    err.to_string()
                };
                StepResult::failed(&self.step, started, message)
            }
        }
    }
}

/// Resolves the placeholders left after rendering: `{{target}}` and fields of
/// completed dependencies. Fields of skipped dependencies are empty.
fn resolve_runtime(
    value: &str,
    target: &TargetInfo,
    dependencies: &BTreeMap<String, StepResult>,
) -> Result<String, TemplateError> {
    substitute(value, |placeholder| match placeholder {
        Placeholder::Name("target") => Ok(Some(target.original.trim().to_string())),
        Placeholder::Name(name) => Err(TemplateError::Undefined {
            name: name.to_string(),
        }),
        Placeholder::Field { step, field } => {
            let result = dependencies
                .get(step)
                .ok_or_else(|| TemplateError::UnresolvedReference {
                    step: step.to_string(),
                    field: field.to_string(),
                })?;
            if result.status == StepStatus::Skipped {
                return Ok(Some(String::new()));
            }
            result
                .field(field)
                .map(Some)
                .ok_or_else(|| TemplateError::UnknownField {
                    step: step.to_string(),
                    field: field.to_string(),
                })
        }
    })
}
