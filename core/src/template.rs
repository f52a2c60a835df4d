//! `{{name}}` and `{{step.field}}` placeholders in step outputs, inputs and
//! arguments.

use crate::transform::ports_file_for;
use crate::workflow::{StepAction, Workflow};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder in {value:?}")]
    Unterminated { value: String },
    #[error("empty placeholder in {value:?}")]
    Empty { value: String },
    #[error("undefined variable '{name}'")]
    Undefined { name: String },
    #[error("'{step}.{field}' does not refer to a completed dependency")]
    UnresolvedReference { step: String, field: String },
    #[error("step '{step}' has no field '{field}'")]
    UnknownField { step: String, field: String },
    #[error("workflow '{workflow}', step '{step}': {source}")]
    InStep {
        workflow: String,
        step: String,
        #[source]
        source: Box<TemplateError>,
    },
}

/// A parsed placeholder body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder<'a> {
    Name(&'a str),
    Field { step: &'a str, field: &'a str },
}

impl<'a> Placeholder<'a> {
    fn parse(token: &'a str) -> Self {
        match token.split_once('.') {
            Some((step, field)) if !step.is_empty() && !field.is_empty() => {
                Placeholder::Field { step, field }
            }
            _ => Placeholder::Name(token),
        }
    }
}

/// Variables available to `{{name}}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new(target: &str, output_dir: &str) -> Self {
        let mut vars = Self::default();
        vars.insert("target", target);
        vars.insert("output_dir", output_dir);
        vars
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TemplateVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = Self::default();
        for (name, value) in iter {
            vars.insert(name, value);
        }
        vars
    }
}

/// Replaces every `{{...}}` in `value` with what `resolve` returns. `None`
/// keeps the placeholder verbatim for a later pass.
pub fn substitute<F>(value: &str, mut resolve: F) -> Result<String, TemplateError>
where
    F: FnMut(Placeholder<'_>) -> Result<Option<String>, TemplateError>,
{
    let mut result = String::with_capacity(value.len());
    let mut cursor = 0;

    while let Some(start_offset) = value[cursor..].find("{{") {
        let start_idx = cursor + start_offset;
        result.push_str(&value[cursor..start_idx]);

        let remainder = &value[start_idx + 2..];
        let end_offset = remainder
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated {
                value: value.to_string(),
            })?;
        let end_idx = start_idx + 2 + end_offset + 2;
        let token = remainder[..end_offset].trim();

        if token.is_empty() {
            return Err(TemplateError::Empty {
                value: value.to_string(),
            });
        }

        match resolve(Placeholder::parse(token))? {
            Some(replacement) => result.push_str(&replacement),
            None => result.push_str(&value[start_idx..end_idx]),
        }
        cursor = end_idx;
    }

    result.push_str(&value[cursor..]);
    Ok(result)
}

/// Resolves variables and static step references (`{{step.output}}`,
/// `{{step.ports_file}}`). Other step references stay for execution time.
pub fn render_workflow(workflow: &Workflow, vars: &TemplateVars) -> Result<Workflow, TemplateError> {
    let mut vars = vars.clone();
    if vars.get("workflow").is_none() {
        vars.insert("workflow", workflow.id.clone());
    }

    let mut rendered = workflow.clone();
    let in_step = |step: &str, source: TemplateError| TemplateError::InStep {
        workflow: workflow.id.clone(),
        step: step.to_string(),
        source: Box::new(source),
    };

    let mut outputs = BTreeMap::new();
    for step in &mut rendered.steps {
        if let Some(output) = &step.output {
            let value = substitute(output, |placeholder| match placeholder {
                Placeholder::Name(name) => resolve_var(&vars, name).map(Some),
                Placeholder::Field { .. } => Ok(None),
            })
            .map_err(|err| in_step(&step.id, err))?;
            outputs.insert(step.id.clone(), value.clone());
            step.output = Some(value);
        }
    }

    let resolve = |placeholder: Placeholder<'_>| match placeholder {
        Placeholder::Name(name) => resolve_var(&vars, name).map(Some),
        Placeholder::Field { step, field } => Ok(outputs.get(step).and_then(|output| {
            match field {
                "output" => Some(output.clone()),
                "ports_file" => Some(ports_file_for(output)),
                _ => None,
            }
        })),
    };

    for step in &mut rendered.steps {
        let mut inputs = Vec::with_capacity(step.inputs.len());
        for input in &step.inputs {
            inputs.push(substitute(input, resolve).map_err(|err| in_step(&step.id, err))?);
        }
        step.inputs = inputs;

        if let StepAction::Tool(invocation) = &mut step.action {
            let mut args = Vec::with_capacity(invocation.args.len());
            for arg in &invocation.args {
                args.push(substitute(arg, resolve).map_err(|err| in_step(&step.id, err))?);
            }
            invocation.args = args;
        }
    }

    Ok(rendered)
}

fn resolve_var(vars: &TemplateVars, name: &str) -> Result<String, TemplateError> {
    vars.get(name)
        .map(str::to_string)
        .ok_or_else(|| TemplateError::Undefined {
            name: name.to_string(),
        })
}
