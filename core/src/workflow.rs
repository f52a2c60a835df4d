use crate::target::TargetRequirement;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "StepDefinition", into = "StepDefinition")]
pub struct Step {
    pub id: String,
    pub action: StepAction,
    pub output: Option<String>,
    pub inputs: Vec<String>,
    pub depends_on: Vec<String>,
    pub optional: bool,
    pub target_type: Option<TargetRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Tool(ToolInvocation),
    Transform(TransformKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: String,
    pub flag_set: Option<String>,
    pub args: Vec<String>,
    pub runs: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    JsonToHostlist,
    MergeFiles,
}

impl TransformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransformKind::JsonToHostlist => "json_to_hostlist",
            TransformKind::MergeFiles => "merge_files",
        }
    }
}

impl Step {
    pub fn tool(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: StepAction::Tool(ToolInvocation {
                tool: tool.into(),
                flag_set: None,
                args: Vec::new(),
                runs: 1,
            }),
            output: None,
            inputs: Vec::new(),
            depends_on: Vec::new(),
            optional: false,
            target_type: None,
        }
    }

    pub fn transform(id: impl Into<String>, kind: TransformKind) -> Self {
        Self {
            id: id.into(),
            action: StepAction::Transform(kind),
            output: None,
            inputs: Vec::new(),
            depends_on: Vec::new(),
            optional: false,
            target_type: None,
        }
    }

    pub fn with_flag_set(mut self, flag_set: impl Into<String>) -> Self {
        if let StepAction::Tool(invocation) = &mut self.action {
            invocation.flag_set = Some(flag_set.into());
        }
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let StepAction::Tool(invocation) = &mut self.action {
            invocation.args = args.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn with_runs(mut self, runs: u32) -> Self {
        if let StepAction::Tool(invocation) = &mut self.action {
            invocation.runs = runs;
        }
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn requires(mut self, requirement: TargetRequirement) -> Self {
        self.target_type = Some(requirement);
        self
    }

    /// Label used in logs and monitor events: the tool name or transform type.
    pub fn kind_label(&self) -> &str {
        match &self.action {
            StepAction::Tool(invocation) => &invocation.tool,
            StepAction::Transform(kind) => kind.as_str(),
        }
    }

    pub fn tool_invocation(&self) -> Option<&ToolInvocation> {
        match &self.action {
            StepAction::Tool(invocation) => Some(invocation),
            StepAction::Transform(_) => None,
        }
    }
}

/// Declarative shape of a step as written in workflow documents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StepDefinition {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    transform: Option<TransformKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flags: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_type: Option<TargetRequirement>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StepDefinitionError {
    #[error("step '{0}' declares both a tool and a transform type")]
    Ambiguous(String),
    #[error("step '{0}' declares neither a tool nor a transform type")]
    MissingAction(String),
    #[error("transform step '{0}' cannot take tool options (flags, args, runs)")]
    ToolOptionsOnTransform(String),
}

impl TryFrom<StepDefinition> for Step {
    type Error = StepDefinitionError;

    fn try_from(def: StepDefinition) -> Result<Self, Self::Error> {
        let action = match (def.tool, def.transform) {
            (Some(_), Some(_)) => return Err(StepDefinitionError::Ambiguous(def.id)),
            (None, None) => return Err(StepDefinitionError::MissingAction(def.id)),
            (Some(tool), None) => StepAction::Tool(ToolInvocation {
                tool,
                flag_set: def.flags,
                args: def.args,
                runs: def.runs.unwrap_or(1),
            }),
            (None, Some(kind)) => {
                if def.flags.is_some() || !def.args.is_empty() || def.runs.is_some() {
                    return Err(StepDefinitionError::ToolOptionsOnTransform(def.id));
                }
                StepAction::Transform(kind)
            }
        };

        Ok(Step {
            id: def.id,
            action,
            output: def.output,
            inputs: def.inputs,
            depends_on: def.depends_on,
            optional: def.optional,
            target_type: def.target_type,
        })
    }
}

impl From<Step> for StepDefinition {
    fn from(step: Step) -> Self {
        let mut def = StepDefinition {
            id: step.id,
            output: step.output,
            inputs: step.inputs,
            depends_on: step.depends_on,
            optional: step.optional,
            target_type: step.target_type,
            ..StepDefinition::default()
        };
        match step.action {
            StepAction::Tool(invocation) => {
                def.tool = Some(invocation.tool);
                def.flags = invocation.flag_set;
                def.args = invocation.args;
                if invocation.runs != 1 {
                    def.runs = Some(invocation.runs);
                }
            }
            StepAction::Transform(kind) => def.transform = Some(kind),
        }
        def
    }
}

impl Workflow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            parallel: false,
            continue_on_error: false,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn summary(&self) -> WorkflowSummary {
        let tools: BTreeSet<String> = self
            .steps
            .iter()
            .filter_map(|step| step.tool_invocation().map(|inv| inv.tool.clone()))
            .collect();
        WorkflowSummary {
            id: self.id.clone(),
            description: self.description.clone(),
            parallel: self.parallel,
            continue_on_error: self.continue_on_error,
            tools: tools.into_iter().collect(),
            steps: self
                .steps
                .iter()
                .map(|step| StepSummary {
                    id: step.id.clone(),
                    kind: step.kind_label().to_string(),
                    output: step.output.clone(),
                    depends_on: step.depends_on.clone(),
                    optional: step.optional,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub description: String,
    pub parallel: bool,
    pub continue_on_error: bool,
    pub tools: Vec<String>,
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub id: String,
    pub kind: String,
    pub output: Option<String>,
    pub depends_on: Vec<String>,
    pub optional: bool,
}

impl fmt::Display for WorkflowSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.parallel { "parallel" } else { "sequential" };
        writeln!(f, "Workflow {} ({mode})", self.id)?;
        if !self.description.is_empty() {
            writeln!(f, "  {}", self.description)?;
        }
        if self.continue_on_error {
            writeln!(f, "  continue_on_error: true")?;
        }
        if !self.tools.is_empty() {
            writeln!(f, "  Tools: {}", self.tools.join(", "))?;
        }
        writeln!(f, "  Steps: {}", self.steps.len())?;
        for step in &self.steps {
            let output = step.output.as_deref().unwrap_or("<none>");
            let marker = if step.optional { " (optional)" } else { "" };
            if step.depends_on.is_empty() {
                writeln!(f, "    - {} via {} -> {}{}", step.id, step.kind, output, marker)?;
            } else {
                writeln!(
                    f,
                    "    - {} via {} -> {}{} [after {}]",
                    step.id,
                    step.kind,
                    output,
                    marker,
                    step.depends_on.join(", ")
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
id: recon
description: port discovery and fingerprinting
parallel: true
steps:
  - id: discover
    tool: naabu
    flags: fast
    args: ["-rate", "500"]
    runs: 2
    output: out/naabu.jsonl
  - id: hosts
    type: json_to_hostlist
    inputs: ["{{discover.output}}"]
    output: out/hosts.txt
    depends_on: [discover]
  - id: fingerprint
    tool: nmap
    depends_on: [hosts]
    optional: true
    target_type: ip_only
"#;

    #[test]
    fn parses_tagged_step_actions() {
        let workflow: Workflow = serde_yaml::from_str(SAMPLE).expect("workflow parses");
        assert_eq!(workflow.id, "recon");
        assert!(workflow.parallel);
        assert!(!workflow.continue_on_error);
        assert_eq!(workflow.steps.len(), 3);

        let discover = workflow.step("discover").expect("discover step");
        let invocation = discover.tool_invocation().expect("tool step");
        assert_eq!(invocation.tool, "naabu");
        assert_eq!(invocation.flag_set.as_deref(), Some("fast"));
        assert_eq!(invocation.runs, 2);

        let hosts = workflow.step("hosts").expect("hosts step");
        assert_eq!(hosts.action, StepAction::Transform(TransformKind::JsonToHostlist));
        assert_eq!(hosts.depends_on, vec!["discover".to_string()]);

        let fingerprint = workflow.step("fingerprint").expect("fingerprint step");
        assert!(fingerprint.optional);
        assert_eq!(fingerprint.target_type, Some(TargetRequirement::IpOnly));
        assert_eq!(fingerprint.tool_invocation().map(|inv| inv.runs), Some(1));
    }

    #[test]
    fn rejects_step_with_tool_and_type() {
        let source = r#"
id: broken
steps:
  - id: both
    tool: nmap
    type: merge_files
"#;
        let err = serde_yaml::from_str::<Workflow>(source).unwrap_err();
        assert!(err.to_string().contains("both a tool and a transform"));
    }

    #[test]
    fn rejects_step_without_action() {
        let source = r#"
id: broken
steps:
  - id: nothing
    output: x.txt
"#;
        let err = serde_yaml::from_str::<Workflow>(source).unwrap_err();
        assert!(err.to_string().contains("neither a tool nor a transform"));
    }

    #[test]
    fn serializes_back_to_declarative_shape() {
        let workflow: Workflow = serde_yaml::from_str(SAMPLE).expect("workflow parses");
        let yaml = serde_yaml::to_string(&workflow).expect("serializes");
        assert!(yaml.contains("type: json_to_hostlist"));
        assert!(yaml.contains("tool: naabu"));
        let reparsed: Workflow = serde_yaml::from_str(&yaml).expect("round trip parses");
        assert_eq!(reparsed, workflow);
    }

    #[test]
    fn summary_lists_steps_and_tools() {
        let workflow: Workflow = serde_yaml::from_str(SAMPLE).expect("workflow parses");
        let summary = workflow.summary();
        assert_eq!(summary.tools, vec!["naabu".to_string(), "nmap".to_string()]);
        let rendered = summary.to_string();
        assert!(rendered.contains("Workflow recon (parallel)"));
        assert!(rendered.contains("hosts via json_to_hostlist -> out/hosts.txt [after discover]"));
        assert!(rendered.contains("fingerprint via nmap -> <none> (optional)"));
    }
}
