use crate::adapter::ToolRegistry;
use crate::workflow::{Step, StepAction, TransformKind, Workflow};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow id cannot be empty")]
    EmptyWorkflowId,
    #[error("workflow '{workflow}': step #{index} has an empty id")]
    EmptyStepId { workflow: String, index: usize },
    #[error("workflow '{workflow}': duplicate step id '{step}'")]
    DuplicateStepId { workflow: String, step: String },
    #[error("workflow '{workflow}': step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        workflow: String,
        step: String,
        dependency: String,
    },
    #[error("workflow '{workflow}': dependency cycle detected at step '{step}' ({})", cycle.join(" -> "))]
    Cycle {
        workflow: String,
        step: String,
        cycle: Vec<String>,
    },
}

/// Static checks that must pass before a workflow is scheduled.
///
/// Checks run in order: workflow id, step ids (non-empty, unique), dependency
/// existence, and finally cycle detection over the whole graph.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), ValidationError> {
    if workflow.id.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowId);
    }

    let mut seen = HashSet::new();
    for (index, step) in workflow.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(ValidationError::EmptyStepId {
                workflow: workflow.id.clone(),
                index,
            });
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId {
                workflow: workflow.id.clone(),
                step: step.id.clone(),
            });
        }
    }

    for step in &workflow.steps {
        for dependency in &step.depends_on {
            if !seen.contains(dependency.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    workflow: workflow.id.clone(),
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    detect_cycle(workflow)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn detect_cycle(workflow: &Workflow) -> Result<(), ValidationError> {
    let edges: HashMap<&str, &[String]> = workflow
        .steps
        .iter()
        .map(|step| (step.id.as_str(), step.depends_on.as_slice()))
        .collect();
    let mut colors: HashMap<&str, Color> = edges.keys().map(|id| (*id, Color::White)).collect();
    let mut path = Vec::new();

    for step in &workflow.steps {
        if colors.get(step.id.as_str()) == Some(&Color::White) {
            if let Some(cycle) = visit(step.id.as_str(), &edges, &mut colors, &mut path) {
                let step = cycle.last().cloned().unwrap_or_default();
                return Err(ValidationError::Cycle {
                    workflow: workflow.id.clone(),
                    step,
                    cycle,
                });
            }
        }
    }
    Ok(())
}

fn visit<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, &'a [String]>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(node, Color::Gray);
    path.push(node);

    for dependency in edges.get(node).copied().unwrap_or_default() {
        let dependency = dependency.as_str();
        match colors.get(dependency).copied() {
            Some(Color::Gray) => {
                let start = path.iter().position(|id| *id == dependency).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|id| id.to_string()).collect();
                cycle.push(dependency.to_string());
                return Some(cycle);
            }
            Some(Color::White) => {
                if let Some(cycle) = visit(dependency, edges, colors, path) {
                    return Some(cycle);
                }
            }
            _ => {}
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
    None
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub location: Option<String>,
    pub message: String,
}

impl Diagnostic {
    fn error(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            location,
            message: message.into(),
        }
    }

    fn warning(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            location,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level, DiagnosticLevel::Error)
    }
}

/// Advisory checks against the tool registry, reported at plan time.
pub fn lint_workflow(workflow: &Workflow, registry: &ToolRegistry) -> Vec<Diagnostic> {
    let mut ctx = LintContext::new();
    ctx.push(format!("workflow {}", workflow.id));

    let optional: HashSet<&str> = workflow
        .steps
        .iter()
        .filter(|step| step.optional)
        .map(|step| step.id.as_str())
        .collect();

    for step in &workflow.steps {
        ctx.push(format!("step {}", step.id));
        lint_step(step, registry, &mut ctx);
        for dependency in &step.depends_on {
            if optional.contains(dependency.as_str()) {
                ctx.warning(format!(
                    "depends on optional step '{dependency}'; if that step fails this one is blocked and the workflow fails"
                ));
            }
        }
        ctx.pop();
    }

    ctx.pop();
    ctx.finish()
}

struct LintContext {
    stack: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl LintContext {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn push(&mut self, label: String) {
        self.stack.push(label);
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    fn location(&self) -> Option<String> {
        if self.stack.is_empty() {
            None
        } else {
            Some(self.stack.join(" > "))
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::error(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn warning(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::warning(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn finish(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

fn lint_step(step: &Step, registry: &ToolRegistry, ctx: &mut LintContext) {
    match &step.action {
        StepAction::Tool(invocation) => {
            match registry.config(&invocation.tool) {
                Some(config) => {
                    if let Some(flag_set) = &invocation.flag_set {
                        if !config.flag_sets.contains_key(flag_set) {
                            ctx.error(format!(
                                "unknown flag set '{}' for tool '{}'",
                                flag_set, invocation.tool
                            ));
                        }
                    }
                }
                None => ctx.error(format!("unknown tool '{}'", invocation.tool)),
            }
            if invocation.runs == 0 {
                ctx.error("runs must be at least 1");
            }
            if step.output.is_none() {
                ctx.warning("tool step has no output path; raw output will not be kept");
            }
        }
        StepAction::Transform(kind) => {
            if step.output.is_none() {
                ctx.error(format!("{} requires an output path", kind.as_str()));
            }
            match kind {
                TransformKind::JsonToHostlist if step.inputs.len() != 1 => {
                    ctx.error(format!(
                        "json_to_hostlist takes exactly one input, found {}",
                        step.inputs.len()
                    ));
                }
                TransformKind::MergeFiles if step.inputs.is_empty() => {
                    ctx.warning("merge_files has no inputs; it will write an empty array");
                }
                _ => {}
            }
        }
    }
}
