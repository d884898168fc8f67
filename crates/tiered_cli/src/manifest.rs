//! Function manifests and engine configuration files.

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tiered_core::FunctionMetadata;
use tiered_dispatch::DispatchConfig;
use tiered_loader::LoaderConfig;
use tiered_registry::MemoryStore;

/// One deployable function
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionEntry {
    /// Metadata for this version
    pub metadata: FunctionMetadata,
    /// Source text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Inline JSON template, used as source when `code` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
}

impl FunctionEntry {
    fn source(&self) -> Option<String> {
        self.code
            .clone()
            .or_else(|| self.template.as_ref().map(Value::to_string))
    }
}

/// Functions deployed in file order; later versions of an id become current
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Entries to deploy
    pub functions: Vec<FunctionEntry>,
}

impl Manifest {
    /// Read a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading manifest {}", path.display()))?;
        serde_json::from_str(&text).wrap_err_with(|| format!("parsing manifest {}", path.display()))
    }

    /// Deploy every entry into a fresh store
    pub fn into_store(self) -> Result<MemoryStore> {
        let store = MemoryStore::new();
        for entry in self.functions {
            let source = entry.source();
            let label = format!("{}@{}", entry.metadata.id, entry.metadata.version);
            store
                .deploy(entry.metadata, source)
                .wrap_err_with(|| format!("deploying {label}"))?;
        }
        Ok(store)
    }
}

/// Engine configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Loader settings
    pub loader: LoaderConfig,
    /// Dispatcher settings
    pub dispatch: DispatchConfig,
}

impl EngineConfig {
    /// Read a config file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).wrap_err_with(|| format!("parsing config {}", path.display()))
    }
}

/// Parse a JSON argument, reading it from a file when prefixed with `@`
pub fn json_argument(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).wrap_err_with(|| format!("reading {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).wrap_err("argument is not valid JSON")
}
