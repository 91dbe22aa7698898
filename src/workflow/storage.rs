//! Workflow file loading
//!
//! Workflows are stored as JSON documents, one workflow per file.

use crate::workflow::types::Workflow;
use anyhow::{Context, Result};
use std::path::Path;

/// Parse a workflow document
pub fn parse_workflow(document: &str) -> Result<Workflow> {
    let workflow: Workflow = serde_json::from_str(document).context("invalid workflow document")?;
    Ok(workflow)
}

/// Read and parse the workflow stored at `path`
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file {}", path.display()))?;
    let workflow = parse_workflow(&document).with_context(|| format!("in {}", path.display()))?;
    tracing::debug!(workflow_id = %workflow.id, path = %path.display(), "📂 Loaded workflow");
    Ok(workflow)
}

/// Serialize a workflow back into its document form
pub fn to_document(workflow: &Workflow) -> Result<String> {
    serde_json::to_string_pretty(workflow).context("failed to serialize workflow")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOCUMENT: &str = r#"{
        "id": "report",
        "nodes": [
            {"id": "load", "type": "set", "config": {"values": {"rows": 3}}},
            {"id": "emit", "type": "passthrough"}
        ],
        "connections": [{"source": "load", "target": "emit", "source_port": "rows"}],
        "triggers": [{"type": "interval", "every_ms": 5000}]
    }"#;

    #[test]
    fn loads_a_workflow_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOCUMENT.as_bytes()).unwrap();

        let workflow = load_workflow(file.path()).unwrap();
        assert_eq!(workflow.id, "report");
        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.connections[0].input_key(), "load");

        let reparsed = parse_workflow(&to_document(&workflow).unwrap()).unwrap();
        assert_eq!(reparsed, workflow);
    }

    #[test]
    fn errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let err = load_workflow(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("missing.json"));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{\"id\": ").unwrap();
        let err = load_workflow(&broken).unwrap_err();
        assert!(format!("{err:#}").contains("invalid workflow document"));
    }
}
