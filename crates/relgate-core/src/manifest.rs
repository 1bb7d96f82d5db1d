//! Reading the declared version from the project manifest.
//!
//! Supported locations:
//! - `pyproject.toml`: `project.version`, then `tool.poetry.version`
//! - `Cargo.toml`: `package.version`, then `workspace.package.version`
//! - anything else: the first non-empty line (a plain `VERSION` file)

use std::path::Path;

use crate::error::{ReleaseError, Result};

const PYPROJECT_KEYS: &[&[&str]] = &[&["project", "version"], &["tool", "poetry", "version"]];
const CARGO_KEYS: &[&[&str]] = &[&["package", "version"], &["workspace", "package", "version"]];

/// Read the manifest version string from `path`.
pub fn read_manifest_version(path: &Path) -> Result<String> {
    let manifest_err = |reason: String| ReleaseError::Manifest {
        path: path.display().to_string(),
        reason,
    };

    let contents = std::fs::read_to_string(path).map_err(|e| manifest_err(e.to_string()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    match file_name {
        "pyproject.toml" => version_from_toml(&contents, PYPROJECT_KEYS).map_err(manifest_err),
        "Cargo.toml" => version_from_toml(&contents, CARGO_KEYS).map_err(manifest_err),
        _ => contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| manifest_err("file is empty".to_string())),
    }
}

/// Look up the first key path that resolves to a string.
pub fn version_from_toml(
    contents: &str,
    key_paths: &[&[&str]],
) -> std::result::Result<String, String> {
    let doc: toml::Value = contents
        .parse()
        .map_err(|e: toml::de::Error| format!("invalid TOML: {}", e.message()))?;

    for keys in key_paths {
        let found = keys
            .iter()
            .try_fold(&doc, |value, key| value.get(*key))
            .and_then(toml::Value::as_str);
        if let Some(version) = found {
            return Ok(version.trim().to_string());
        }
    }

    let tried: Vec<String> = key_paths.iter().map(|keys| keys.join(".")).collect();
    Err(format!("no version declared (looked for {})", tried.join(", ")))
}
