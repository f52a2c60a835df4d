//! Reads workflow groups and tool configurations from YAML documents on disk.

use crate::adapter::{ToolConfig, ToolRegistry};
use crate::validation::{validate_workflow, ValidationError};
use crate::workflow::Workflow;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid workflow in {path:?}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: ValidationError,
    },
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("workflow '{id}' is defined in both {first:?} and {second:?}")]
    DuplicateWorkflow {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Workflows found in one directory.
#[derive(Debug, Clone)]
pub struct WorkflowGroup {
    pub name: String,
    pub workflows: Vec<Workflow>,
}

impl WorkflowGroup {
    pub fn workflow(&self, id: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|workflow| workflow.id == id)
    }
}

pub fn parse_workflow(source: &str, path: &Path) -> Result<Workflow, LoadError> {
    let workflow: Workflow = serde_yaml::from_str(source).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate_workflow(&workflow).map_err(|source| LoadError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(workflow)
}

pub fn load_workflow_file(path: &Path) -> Result<Workflow, LoadError> {
    let source = read(path)?;
    parse_workflow(&source, path)
}

/// One group per subdirectory of `root`; files directly in `root` form a
/// group named after `root` itself. Groups and workflows are sorted by name.
pub fn load_workflow_groups(root: &Path) -> Result<Vec<WorkflowGroup>, LoadError> {
    if !root.is_dir() {
        return Err(LoadError::NotADirectory(root.to_path_buf()));
    }

    let root_name = root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "workflows".to_string());

    let mut groups = Vec::new();
    let top_level = load_directory(root)?;
    if !top_level.is_empty() {
        groups.push(WorkflowGroup {
            name: root_name,
            workflows: top_level,
        });
    }

    for dir in sorted_entries(root)?.into_iter().filter(|path| path.is_dir()) {
        let workflows = load_directory(&dir)?;
        if workflows.is_empty() {
            continue;
        }
        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        groups.push(WorkflowGroup { name, workflows });
    }

    tracing::debug!(
        root = %root.display(),
        groups = groups.len(),
        "loaded workflow groups"
    );
    Ok(groups)
}

fn load_directory(dir: &Path) -> Result<Vec<Workflow>, LoadError> {
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut workflows = Vec::new();
    for path in sorted_entries(dir)?.into_iter().filter(|p| is_yaml(p)) {
        let workflow = load_workflow_file(&path)?;
        if let Some(first) = seen.insert(workflow.id.clone(), path.clone()) {
            return Err(LoadError::DuplicateWorkflow {
                id: workflow.id,
                first,
                second: path,
            });
        }
        workflows.push(workflow);
    }
    Ok(workflows)
}

/// Tool configurations from every YAML file in `dir`.
pub fn load_tool_configs(dir: &Path) -> Result<Vec<ToolConfig>, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::NotADirectory(dir.to_path_buf()));
    }
    let mut configs = Vec::new();
    for path in sorted_entries(dir)?.into_iter().filter(|p| is_yaml(p)) {
        let source = read(&path)?;
        let config: ToolConfig =
            serde_yaml::from_str(&source).map_err(|source| LoadError::Parse {
                path: path.clone(),
                source,
            })?;
        configs.push(config);
    }
    Ok(configs)
}

/// Built-in tools, overridden by name with anything found in `tools_dir`.
pub fn load_registry(tools_dir: Option<&Path>) -> Result<ToolRegistry, LoadError> {
    let mut registry = ToolRegistry::builtin();
    if let Some(dir) = tools_dir {
        for config in load_tool_configs(dir)? {
            tracing::debug!(tool = %config.name, command = %config.command, "registering tool");
            registry.register_config(config);
        }
    }
    Ok(registry)
}

fn read(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let io_err = |source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        entries.push(entry.map_err(io_err)?.path());
    }
    entries.sort();
    Ok(entries)
}

fn is_yaml(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetRequirement;
    use crate::workflow::{StepAction, TransformKind};
    use tempfile::tempdir;

    const DISCOVERY: &str = r#"
id: discovery
description: Port discovery followed by fingerprinting
parallel: true
steps:
  - id: ports
    tool: naabu
    flags: fast
    output: "{{output_dir}}/ports.json"
  - id: hosts
    type: json_to_hostlist
    inputs: ["{{ports.output}}"]
    output: "{{output_dir}}/hosts.txt"
    depends_on: [ports]
  - id: services
    tool: nmap
    flags: service
    args: ["-p", "{{hosts.ports}}", "-iL", "{{hosts.output}}"]
    runs: 2
    depends_on: [hosts]
"#;

    const DNS: &str = r#"
id: dns
steps:
  - id: mx
    tool: host
    flags: mx
  - id: ptr
    tool: dig
    flags: ptr
    target_type: ip_only
    optional: true
"#;

    #[test]
    fn loads_groups_from_root_and_subdirectories() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("workflows");
        fs::create_dir_all(root.join("recon")).unwrap();
        fs::write(root.join("dns.yaml"), DNS).unwrap();
        fs::write(root.join("recon/discovery.yml"), DISCOVERY).unwrap();
        fs::write(root.join("recon/notes.txt"), "ignored").unwrap();

        let groups = load_workflow_groups(&root).unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["workflows", "recon"]);

        let discovery = groups[1].workflow("discovery").unwrap();
        assert!(discovery.parallel);
        assert_eq!(discovery.steps.len(), 3);
        assert_eq!(
            discovery.steps[1].action,
            StepAction::Transform(TransformKind::JsonToHostlist)
        );
        let services = discovery.steps[2].tool_invocation().unwrap();
        assert_eq!(services.runs, 2);
        assert_eq!(services.flag_set.as_deref(), Some("service"));

        let dns = groups[0].workflow("dns").unwrap();
        assert_eq!(dns.steps[1].target_type, Some(TargetRequirement::IpOnly));
        assert!(dns.steps[1].optional);
    }

    #[test]
    fn step_with_tool_and_type_is_rejected() {
        let source = "id: bad\nsteps:\n  - id: x\n    tool: naabu\n    type: merge_files\n";
        let err = parse_workflow(source, Path::new("bad.yaml")).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn cyclic_workflow_is_rejected_at_load() {
        let source = "id: loop\nsteps:\n  - id: a\n    tool: host\n    depends_on: [b]\n  - id: b\n    tool: host\n    depends_on: [a]\n";
        let err = parse_workflow(source, Path::new("loop.yaml")).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Invalid {
                source: ValidationError::Cycle { .. },
                ..
            }
        ));
    }

    #[test]
    fn duplicate_workflow_ids_in_a_group_are_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), DNS).unwrap();
        fs::write(dir.path().join("b.yaml"), DNS).unwrap();
        assert!(matches!(
            load_workflow_groups(dir.path()),
            Err(LoadError::DuplicateWorkflow { .. })
        ));
    }

    #[test]
    fn tool_files_override_builtins() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("nmap.yaml"),
            "name: nmap\ncommand: /opt/nmap/bin/nmap\noutput_format: xml\ndefault_args: [\"-oX\", \"-\"]\nflag_sets:\n  quick: \"-F\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("whatweb.yml"),
            "name: whatweb\ncommand: whatweb\n",
        )
        .unwrap();

        let registry = load_registry(Some(dir.path())).unwrap();
        let nmap = registry.config("nmap").unwrap();
        assert_eq!(nmap.command, "/opt/nmap/bin/nmap");
        assert!(nmap.flag_sets.contains_key("quick"));
        assert!(registry.get("whatweb").is_some());
        assert!(registry.get("naabu").is_some());
    }

    #[test]
    fn missing_directory_is_reported() {
        assert!(matches!(
            load_tool_configs(Path::new("/definitely/not/here")),
            Err(LoadError::NotADirectory(_))
        ));
    }
}
