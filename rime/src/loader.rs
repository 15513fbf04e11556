//! Application tree loading.
//!
//! Controllers ship their configuration as TOML, YAML or JSON. Whatever the
//! format, the kernel sees one `serde_json::Value` tree: a `system` section
//! for the kernel itself and one section per module.

use serde_json::Value;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported config format '{0}' (expected toml, yaml, yml or json)")]
    UnsupportedFormat(String),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration root must be a table, found {0}")]
    NotATable(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Yaml,
    Json,
}

impl Format {
    /// Format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Ok(Format::Toml),
            "yaml" | "yml" => Ok(Format::Yaml),
            "json" => Ok(Format::Json),
            other => Err(LoadError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Read and parse a configuration file into a tree.
pub fn load_tree(path: impl AsRef<Path>) -> Result<Value, LoadError> {
    let path = path.as_ref();
    let format = Format::from_path(path)?;
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    log::debug!(target: "rime::loader", "loaded {} ({:?})", path.display(), format);
    parse_tree(&text, format)
}

/// Parse configuration text into a tree.
pub fn parse_tree(text: &str, format: Format) -> Result<Value, LoadError> {
    let tree: Value = match format {
        Format::Toml => toml::from_str(text)?,
        Format::Yaml => serde_yaml::from_str(text)?,
        Format::Json => serde_json::from_str(text)?,
    };
    match tree {
        Value::Object(_) => Ok(tree),
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Array(_) => Err(LoadError::NotATable("an array")),
        _ => Err(LoadError::NotATable("a scalar")),
    }
}
