//! Schema Document Loader
//!
//! Reads one declaration document per cube from a directory. JSON and YAML
//! are both accepted; a document may hold a single cube or `{cubes: [...]}`.

use crate::error::{ChatBiError, Result};
use crate::semantic::model::{Cube, SemanticSchema};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SchemaDocument {
    Many { cubes: Vec<Cube> },
    One(Cube),
}

/// Parse a single document. `format_hint` is the file extension.
pub fn parse_document(text: &str, format_hint: &str) -> Result<Vec<Cube>> {
    let document: SchemaDocument = match format_hint {
        "yaml" | "yml" => serde_yaml::from_str(text)?,
        _ => serde_json::from_str(text)?,
    };
    Ok(match document {
        SchemaDocument::Many { cubes } => cubes,
        SchemaDocument::One(cube) => vec![cube],
    })
}

/// Load every `*.json`, `*.yaml` and `*.yml` file in `dir`, in file name
/// order.
pub fn load_schema_dir(dir: &Path) -> Result<SemanticSchema> {
    if !dir.is_dir() {
        return Err(ChatBiError::Semantic(format!(
            "Schema directory {} does not exist",
            dir.display()
        )));
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut cubes = Vec::new();
    for path in paths {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !matches!(ext.as_str(), "json" | "yaml" | "yml") {
            continue;
        }
        let text = std::fs::read_to_string(&path)?;
        let parsed = parse_document(&text, &ext).map_err(|e| {
            ChatBiError::Semantic(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        debug!("Loaded {} cube(s) from {}", parsed.len(), path.display());
        cubes.extend(parsed);
    }

    let schema = SemanticSchema::new(cubes)?;
    info!(
        "Loaded schema from {}: {} cubes, {} measures, {} dimensions",
        dir.display(),
        schema.cubes.len(),
        schema.measure_count(),
        schema.dimension_count()
    );
    Ok(schema)
}
