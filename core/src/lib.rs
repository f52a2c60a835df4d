pub mod adapter;
pub mod executor;
pub mod loader;
pub mod monitor;
pub mod orchestrator;
pub mod records;
pub mod target;
pub mod template;
pub mod transform;
pub mod validation;
pub mod workflow;

pub use adapter::{
    AdapterError, OutputFormat, ProcessRunner, RawOutput, ToolAdapter, ToolConfig, ToolRegistry,
    TokioProcessRunner,
};
pub use executor::{
    ExecutionReport, Executor, ExecutorConfig, StepError, StepPayload, StepResult, StepStatus,
    WorkflowError, WorkflowRun,
};
pub use loader::{
    load_registry, load_tool_configs, load_workflow_file, load_workflow_groups, LoadError,
    WorkflowGroup,
};
pub use monitor::{ChannelMonitor, Monitor, MonitorError, MonitorEvent, NoopMonitor, TracingMonitor};
pub use orchestrator::{OrchestrationError, OrchestrationRun, Orchestrator, WorkflowOutcome};
pub use records::{DnsRecords, Port, PortScan, PortState, Service, ServiceScan, ToolData};
pub use target::{classify, TargetInfo, TargetRequirement, TargetType};
pub use template::{render_workflow, TemplateError, TemplateVars};
pub use validation::{lint_workflow, validate_workflow, Diagnostic, DiagnosticLevel, ValidationError};
pub use workflow::{Step, StepAction, ToolInvocation, TransformKind, Workflow, WorkflowSummary};
