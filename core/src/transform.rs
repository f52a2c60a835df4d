//! Built-in transforms that reshape tool output between steps.

use crate::adapter::push_distinct;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("{transform} expects {expected} input(s), got {found}")]
    InputCount {
        transform: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{transform} requires an output path")]
    MissingOutput { transform: &'static str },
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize merged records: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result of `json_to_hostlist`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Hostlist {
    pub hosts: Vec<String>,
    pub ports: Vec<u16>,
    pub ports_file: String,
}

/// Result of `merge_files`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Merged {
    pub records: usize,
    pub inputs: usize,
    pub skipped: Vec<String>,
}

/// `hosts.txt` -> `hosts.ports`, next to the output. An output that already
/// ends in `.ports` gets a second `.ports` so the two files never coincide.
pub fn ports_file_for(output: &str) -> String {
    let path = Path::new(output);
    if path.extension().and_then(|ext| ext.to_str()) == Some("ports") {
        return format!("{output}.ports");
    }
    path.with_extension("ports").to_string_lossy().to_string()
}

/// Extracts hosts and ports from one JSON, JSON array, or JSONL file.
///
/// Hosts (`ip` then `host` of each record, first seen first) go to `output`
/// one per line; ports go to the sibling ports file, ascending and
/// comma-joined. A missing or empty input writes two empty files.
pub fn json_to_hostlist(input: &Path, output: &Path) -> Result<Hostlist, TransformError> {
    let contents = match fs::read_to_string(input) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::warn!("hostlist input {:?} does not exist; writing empty lists", input);
            String::new()
        }
        Err(source) => {
            return Err(TransformError::Read {
                path: input.to_path_buf(),
                source,
            })
        }
    };

    let mut hosts = Vec::new();
    let mut ports = BTreeSet::new();
    for record in parse_records(&contents).unwrap_or_else(|bad| {
        tracing::warn!("hostlist input {:?} has {bad} malformed line(s)", input);
        lenient_records(&contents)
    }) {
        for key in ["ip", "host"] {
            if let Some(value) = record.get(key).and_then(Value::as_str) {
                push_distinct(&mut hosts, value.trim());
            }
        }
        if let Some(port) = record.get("port").and_then(port_number) {
            ports.insert(port);
        }
    }

    let ports: Vec<u16> = ports.into_iter().collect();
    let ports_file = ports_file_for(&output.to_string_lossy());

    let mut host_text = hosts.join("\n");
    if !host_text.is_empty() {
        host_text.push('\n');
    }
    write_file(output, host_text.as_bytes())?;
    write_file(
        Path::new(&ports_file),
        crate::records::join_ports(&ports).as_bytes(),
    )?;

    tracing::info!(
        "wrote {} host(s) to {:?} and {} port(s) to {}",
        hosts.len(),
        output,
        ports.len(),
        ports_file
    );

    Ok(Hostlist {
        hosts,
        ports,
        ports_file,
    })
}

/// Concatenates the records of every input into one pretty-printed JSON
/// array. Unreadable or malformed inputs are skipped with a warning.
pub fn merge_files(inputs: &[PathBuf], output: &Path) -> Result<Merged, TransformError> {
    let mut merged = Vec::new();
    let mut skipped = Vec::new();

    for input in inputs {
        let contents = match fs::read_to_string(input) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!("skipping merge input {:?}: {err}", input);
                skipped.push(input.to_string_lossy().to_string());
                continue;
            }
        };
        match parse_records(&contents) {
            Ok(records) => merged.extend(records),
            Err(bad) => {
                tracing::warn!("skipping merge input {:?}: {bad} malformed line(s)", input);
                skipped.push(input.to_string_lossy().to_string());
            }
        }
    }

    let records = merged.len();
    let bytes = serde_json::to_vec_pretty(&Value::Array(merged))?;
    write_file(output, &bytes)?;

    Ok(Merged {
        records,
        inputs: inputs.len(),
        skipped,
    })
}

/// Whole-document JSON first (arrays are flattened one level), then JSONL.
/// On JSONL failure returns the number of lines that did not parse.
fn parse_records(contents: &str) -> Result<Vec<Value>, usize> {
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(match value {
            Value::Array(items) => items,
            other => vec![other],
        });
    }

    let mut records = Vec::new();
    let mut bad = 0usize;
    for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => records.push(value),
            Err(_) => bad += 1,
        }
    }
    if bad > 0 {
        Err(bad)
    } else {
        Ok(records)
    }
}

fn lenient_records(contents: &str) -> Vec<Value> {
    contents
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .collect()
}

fn port_number(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), TransformError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| TransformError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| TransformError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn hostlist_from_jsonl_port_scan() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("ports.json");
        fs::write(
            &input,
            "{\"host\":\"example.com\",\"ip\":\"93.184.216.34\",\"port\":443}\n\
             {\"host\":\"example.com\",\"ip\":\"93.184.216.34\",\"port\":80}\n\
             {\"ip\":\"10.0.0.2\",\"port\":\"8080\"}\n",
        )
        .unwrap();
        let output = dir.path().join("hosts.txt");

        let list = json_to_hostlist(&input, &output).unwrap();
        assert_eq!(list.hosts, vec!["93.184.216.34", "example.com", "10.0.0.2"]);
        assert_eq!(list.ports, vec![80, 443, 8080]);
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "93.184.216.34\nexample.com\n10.0.0.2\n"
        );
        let ports_file = dir.path().join("hosts.ports");
        assert_eq!(list.ports_file, ports_file.to_string_lossy());
        assert_eq!(fs::read_to_string(ports_file).unwrap(), "80,443,8080");
    }

    #[test]
    fn hostlist_from_missing_or_empty_input_is_empty() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("nested/hosts.txt");

        let list = json_to_hostlist(&dir.path().join("absent.json"), &output).unwrap();
        assert!(list.hosts.is_empty());
        assert!(list.ports.is_empty());
        assert_eq!(fs::read_to_string(&output).unwrap(), "");
        assert_eq!(fs::read_to_string(dir.path().join("nested/hosts.ports")).unwrap(), "");

        let empty = dir.path().join("empty.json");
        fs::write(&empty, "  \n").unwrap();
        let list = json_to_hostlist(&empty, &output).unwrap();
        assert_eq!(list, Hostlist {
            ports_file: list.ports_file.clone(),
            ..Hostlist::default()
        });
    }

    #[test]
    fn hostlist_accepts_json_array() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("hosts.json");
        fs::write(&input, json!([{"ip": "10.0.0.1", "port": 22}]).to_string()).unwrap();
        let list = json_to_hostlist(&input, &dir.path().join("out.txt")).unwrap();
        assert_eq!(list.hosts, vec!["10.0.0.1"]);
        assert_eq!(list.ports, vec![22]);
    }

    #[test]
    fn merge_concatenates_in_input_order() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.jsonl");
        fs::write(&first, json!([{"a": 1}]).to_string()).unwrap();
        fs::write(&second, "{\"b\":2}\n{\"c\":3}").unwrap();
        let output = dir.path().join("merged.json");

        let merged = merge_files(&[first, second], &output).unwrap();
        assert_eq!(merged.records, 3);

        let written: Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written, json!([{"a": 1}, {"b": 2}, {"c": 3}]));
    }

    #[test]
    fn merge_skips_unreadable_and_malformed_inputs() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        fs::write(&good, "{\"ok\":true}").unwrap();
        fs::write(&bad, "{not json\n").unwrap();
        let missing = dir.path().join("missing.json");
        let output = dir.path().join("merged.json");

        let merged = merge_files(&[missing, bad, good], &output).unwrap();
        assert_eq!(merged.records, 1);
        assert_eq!(merged.skipped.len(), 2);
        let written: Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written, json!([{"ok": true}]));
    }

    #[test]
    fn ports_file_sits_beside_output() {
        assert_eq!(ports_file_for("out/hosts.txt"), "out/hosts.ports");
        assert_eq!(ports_file_for("hosts"), "hosts.ports");
        assert_eq!(ports_file_for("out/targets.ports"), "out/targets.ports.ports");
    }

    #[test]
    fn hostlist_named_like_a_ports_file_keeps_its_hosts() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("scan.json");
        fs::write(&input, "{\"ip\":\"10.0.0.9\",\"port\":22}\n").unwrap();
        let output = dir.path().join("targets.ports");

        let list = json_to_hostlist(&input, &output).unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "10.0.0.9\n");
        assert_eq!(fs::read_to_string(&list.ports_file).unwrap(), "22");
    }
}
