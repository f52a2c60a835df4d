use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use comfy_table::{presets::ASCII_FULL, Table};
use reconflow_core::orchestrator::DEFAULT_CONCURRENCY;
use reconflow_core::{
    classify, lint_workflow, load_registry, load_workflow_file, load_workflow_groups,
    render_workflow, Diagnostic, DiagnosticLevel, ExecutionReport, Executor, Orchestrator,
    TargetInfo, TargetRequirement, TemplateVars, ToolConfig, ToolRegistry, TracingMonitor,
    Workflow, WorkflowOutcome,
};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Placeholder target used when planning without one.
const PLAN_TARGET: &str = "<target>";

#[derive(Debug, Parser)]
#[command(author, version, about = "Dependency-ordered security scan orchestration")]
struct ReconflowCli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct WorkflowArgs {
    /// Workflow file, or a directory of workflow groups
    input: PathBuf,
    /// Only use the named workflow. Repeat for several.
    #[arg(long = "workflow", value_name = "ID", action = ArgAction::Append)]
    workflows: Vec<String>,
    /// Directory of tool configuration files overriding the builtins
    #[arg(long)]
    tools: Option<PathBuf>,
    /// Directory that `{{output_dir}}` expands to
    #[arg(long, default_value = "artifacts")]
    output_dir: PathBuf,
    /// Set a template variable (format: key=value). Repeat for multiple variables.
    #[arg(long = "var", value_parser = parse_key_val, value_name = "KEY=VALUE", action = ArgAction::Append)]
    vars: Vec<(String, String)>,
    /// Output JSON instead of a human-readable summary
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load workflows, render templates and print the plan with diagnostics
    Plan {
        #[command(flatten)]
        args: WorkflowArgs,
        /// Target used to render templates
        #[arg(long)]
        target: Option<String>,
    },
    /// Run workflows against a target
    Run {
        #[command(flatten)]
        args: WorkflowArgs,
        /// Target to scan (IP address, domain or hostname)
        #[arg(long)]
        target: String,
        /// Maximum number of parallel workflows running at once
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
    /// Classify a target and print which target-restricted steps run or skip
    Classify {
        target: String,
        /// Output JSON instead of a human-readable summary
        #[arg(long)]
        json: bool,
    },
    /// Export tool configurations
    Tools {
        /// Filter by tool name
        #[arg(long)]
        tool: Option<String>,
        /// Directory of tool configuration files overriding the builtins
        #[arg(long)]
        tools: Option<PathBuf>,
        /// Output format
        #[arg(long, default_value_t = ToolsFormat::Yaml)]
        format: ToolsFormat,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ReconflowCli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Plan { args, target } => {
            let registry = load_registry(args.tools.as_deref())?;
            let workflows = load_workflows(&args.input, &args.workflows)?;
            let target = target.unwrap_or_else(|| PLAN_TARGET.to_string());
            let vars = template_vars(&target, &args.output_dir, &args.vars);
            let has_errors = output_plan(&workflows, &registry, &vars, args.json)?;
            if has_errors {
                anyhow::bail!("validation failed");
            }
        }
        Command::Run {
            args,
            target,
            concurrency,
        } => {
            let registry = load_registry(args.tools.as_deref())?;
            let workflows = load_workflows(&args.input, &args.workflows)?;
            let vars = template_vars(&target, &args.output_dir, &args.vars);

            let executor =
                Executor::new(Arc::new(registry)).with_monitor(Arc::new(TracingMonitor));
            let orchestrator = Orchestrator::new(executor).with_concurrency(concurrency);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling running steps");
                    on_signal.cancel();
                }
            });

            let run = orchestrator.run(&cancel, &workflows, &target, &vars).await;
            output_run(&run.outcomes, args.json)?;
            run.result?;
        }
        Command::Classify { target, json } => {
            let info = classify(&target);
            let (runs, skips) = step_applicability(&info);
            if json {
                let payload = json!({
                    "target": info,
                    "runs": runs,
                    "skips": skips,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("Target: {}", info.original);
                println!("  type: {}", info.kind);
                println!("  local: {}", info.is_local);
                println!("  private: {}", info.is_private);
                println!("  runs steps: unrestricted{}", join_prefixed(&runs));
                if !skips.is_empty() {
                    println!("  skips steps: {}", skips.join(", "));
                }
            }
        }
        Command::Tools {
            tool,
            tools,
            format,
        } => {
            let registry = load_registry(tools.as_deref())?;
            output_tools(&registry, tool, format)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_workflows(input: &Path, only: &[String]) -> anyhow::Result<Vec<Workflow>> {
    let mut workflows = if input.is_dir() {
        load_workflow_groups(input)?
            .into_iter()
            .flat_map(|group| group.workflows)
            .collect()
    } else {
        vec![load_workflow_file(input)?]
    };

    if !only.is_empty() {
        for id in only {
            if !workflows.iter().any(|workflow| &workflow.id == id) {
                anyhow::bail!("unknown workflow '{id}'");
            }
        }
        workflows.retain(|workflow| only.contains(&workflow.id));
    }

    if workflows.is_empty() {
        anyhow::bail!("no workflows found in {}", input.display());
    }
    Ok(workflows)
}

fn template_vars(target: &str, output_dir: &Path, vars: &[(String, String)]) -> TemplateVars {
    let mut template_vars = TemplateVars::new(target, &output_dir.to_string_lossy());
    for (key, value) in vars {
        template_vars.insert(key.clone(), value.clone());
    }
    template_vars
}

fn output_plan(
    workflows: &[Workflow],
    registry: &ToolRegistry,
    vars: &TemplateVars,
    json: bool,
) -> anyhow::Result<bool> {
    let mut plans = Vec::with_capacity(workflows.len());
    let mut has_errors = false;

    for workflow in workflows {
        let (rendered, mut diagnostics) = match render_workflow(workflow, vars) {
            Ok(rendered) => (rendered, Vec::new()),
            Err(err) => (
                workflow.clone(),
                vec![Diagnostic {
                    level: DiagnosticLevel::Error,
                    location: Some(format!("workflow {}", workflow.id)),
                    message: err.to_string(),
                }],
            ),
        };
        diagnostics.extend(lint_workflow(&rendered, registry));
        has_errors |= diagnostics.iter().any(Diagnostic::is_error);
        plans.push((rendered, diagnostics));
    }

    if json {
        let payload: Vec<_> = plans
            .iter()
            .map(|(workflow, diagnostics)| {
                json!({
                    "summary": workflow.summary(),
                    "diagnostics": diagnostics,
                })
            })
            .collect();
        let variables: Vec<_> = vars.iter().collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "workflows": payload,
                "variables": variables,
            }))?
        );
    } else {
        for (workflow, diagnostics) in &plans {
            print_diagnostics(diagnostics);
            println!("{}", workflow.summary());
        }
        println!("Variables (--var):");
        for (key, value) in vars.iter() {
            println!("  - {key} = {value}");
        }
    }

    Ok(has_errors)
}

#[derive(Debug, Serialize)]
struct RunResponse<'a> {
    workflow: &'a str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a ExecutionReport>,
}

fn output_run(outcomes: &[WorkflowOutcome], json: bool) -> anyhow::Result<()> {
    if json {
        let response: Vec<RunResponse<'_>> = outcomes
            .iter()
            .map(|outcome| RunResponse {
                workflow: &outcome.workflow,
                success: outcome.result.is_ok(),
                error: outcome.result.as_ref().err().map(ToString::to_string),
                report: outcome.report.as_ref(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    for outcome in outcomes {
        match &outcome.report {
            Some(report) => {
                println!(
                    "Workflow {} against {} ({}), started {}",
                    report.workflow,
                    report.target.original,
                    report.target.kind,
                    format_time(report.started_at)
                );
                println!("{}", render_steps(report));
                if report.has_failures() {
                    println!("[warn] some steps failed");
                }
            }
            None => println!("Workflow {} was not run", outcome.workflow),
        }
        if let Err(err) = &outcome.result {
            println!("[error] {err}");
        }
        println!();
    }
    Ok(())
}

fn render_steps(report: &ExecutionReport) -> String {
    let mut display = Table::new();
    display.load_preset(ASCII_FULL);
    display.set_header(vec!["Step", "Type", "Status", "Duration", "Output", "Error"]);

    for step in &report.steps {
        display.add_row(vec![
            step.step.clone(),
            step.step_type.clone(),
            step.status.to_string(),
            format!("{:.2}s", step.duration.as_secs_f64()),
            step.output.clone().unwrap_or_default(),
            step.error.clone().unwrap_or_default(),
        ]);
    }

    display.to_string()
}

fn format_time(moment: OffsetDateTime) -> String {
    moment
        .format(&Rfc3339)
        .unwrap_or_else(|_| moment.unix_timestamp().to_string())
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ToolsFormat {
    Json,
    Yaml,
}

impl std::fmt::Display for ToolsFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ToolsFormat::Json => "json",
            ToolsFormat::Yaml => "yaml",
        };
        write!(f, "{value}")
    }
}

fn output_tools(
    registry: &ToolRegistry,
    tool: Option<String>,
    format: ToolsFormat,
) -> anyhow::Result<()> {
    let mut tools: Vec<ToolConfig> = registry.configs();

    if let Some(filter) = tool {
        tools.retain(|config| config.name == filter);
        if tools.is_empty() {
            anyhow::bail!("unknown tool '{filter}'");
        }
    }

    match format {
        ToolsFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&tools)?);
        }
        ToolsFormat::Yaml => {
            let yaml = serde_yaml::to_string(&tools).context("failed to encode tools as YAML")?;
            print!("{yaml}");
        }
    }

    Ok(())
}

/// Target restrictions split into those that let a step run and those that
/// skip it.
fn step_applicability(info: &TargetInfo) -> (Vec<&'static str>, Vec<&'static str>) {
    let mut runs = Vec::new();
    let mut skips = Vec::new();
    for requirement in [TargetRequirement::DomainOnly, TargetRequirement::IpOnly] {
        if requirement.permits(info) {
            runs.push(requirement.as_str());
        } else {
            skips.push(requirement.as_str());
        }
    }
    (runs, skips)
}

fn join_prefixed(values: &[&str]) -> String {
    values.iter().map(|value| format!(", {value}")).collect()
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }

    println!("Diagnostics:");
    for diagnostic in diagnostics {
        let level = match diagnostic.level {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warn",
        };
        match &diagnostic.location {
            Some(location) => println!("  - [{level}] {location}: {}", diagnostic.message),
            None => println!("  - [{level}] {}", diagnostic.message),
        }
    }
    println!();
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_pairs() {
        assert_eq!(
            parse_key_val("profile=fast=1").unwrap(),
            ("profile".to_string(), "fast=1".to_string())
        );
        assert!(parse_key_val("=oops").is_err());
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn user_variables_override_defaults() {
        let vars = template_vars(
            "10.0.0.1",
            Path::new("out"),
            &[("output_dir".to_string(), "elsewhere".to_string())],
        );
        assert_eq!(vars.get("target"), Some("10.0.0.1"));
        assert_eq!(vars.get("output_dir"), Some("elsewhere"));
    }

    #[test]
    fn applicability_follows_target_kind() {
        assert_eq!(
            step_applicability(&classify("10.0.0.5")),
            (vec!["ip_only"], vec!["domain_only"])
        );
        assert_eq!(
            step_applicability(&classify("api.example.com")),
            (vec!["domain_only"], vec!["ip_only"])
        );
        let (runs, skips) = step_applicability(&classify("not a target"));
        assert!(runs.is_empty());
        assert_eq!(skips, vec!["domain_only", "ip_only"]);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        ReconflowCli::command().debug_assert();
    }
}
