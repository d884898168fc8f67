//! Versioned function store.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tiered_core::{CoreError, CoreResult, FunctionMetadata, Version};

/// Read contract for metadata and code.
///
/// Both reads are idempotent. Implementations report absence as
/// [`CoreError::NotFound`] and backend trouble as
/// [`CoreError::TransientStorage`]; callers only retry the latter.
/// `version: None` resolves the function's current version.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Fetch metadata for a function
    async fn get_metadata(&self, id: &str, version: Option<&Version>)
        -> CoreResult<FunctionMetadata>;

    /// Fetch source or compiled code for a function
    async fn get_code(&self, id: &str, version: Option<&Version>) -> CoreResult<String>;
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Number of function ids
    pub function_count: usize,
    /// Number of retained version snapshots
    pub version_count: usize,
    /// Metadata reads served
    pub metadata_reads: u64,
    /// Code reads served
    pub code_reads: u64,
}

/// One immutable version snapshot
#[derive(Debug, Clone)]
struct Snapshot {
    metadata: FunctionMetadata,
    code: Option<String>,
}

/// All versions of one function plus the mutable current pointer
#[derive(Debug, Clone)]
struct FunctionRecord {
    versions: BTreeMap<Version, Snapshot>,
    current: Version,
}

impl FunctionRecord {
    fn snapshot(&self, version: Option<&Version>) -> Option<&Snapshot> {
        self.versions.get(version.unwrap_or(&self.current))
    }
}

/// In-memory function store
///
/// Every deploy adds a snapshot; nothing is mutated in place except the
/// current pointer.
#[derive(Debug, Default)]
pub struct MemoryStore {
    functions: RwLock<HashMap<String, FunctionRecord>>,
    metadata_reads: AtomicU64,
    code_reads: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a new version and make it current.
    ///
    /// `created_at` of the first version is carried forward; `updated_at` is
    /// stamped now. Returns the stored metadata.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if this exact version was deployed before.
    pub fn deploy(
        &self,
        mut metadata: FunctionMetadata,
        code: Option<String>,
    ) -> CoreResult<FunctionMetadata> {
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        metadata.updated_at = now;

        match functions.get_mut(&metadata.id) {
            Some(record) => {
                if record.versions.contains_key(&metadata.version) {
                    return Err(CoreError::AlreadyExists {
                        kind: "version".to_string(),
                        id: format!("{}@{}", metadata.id, metadata.version),
                    });
                }
                if let Some(first) = record.versions.values().next() {
                    metadata.created_at = first.metadata.created_at;
                }
                record.current = metadata.version.clone();
                record.versions.insert(
                    metadata.version.clone(),
                    Snapshot {
                        metadata: metadata.clone(),
                        code,
                    },
                );
            }
            None => {
                metadata.created_at = now;
                let mut versions = BTreeMap::new();
                versions.insert(
                    metadata.version.clone(),
                    Snapshot {
                        metadata: metadata.clone(),
                        code,
                    },
                );
                functions.insert(
                    metadata.id.clone(),
                    FunctionRecord {
                        versions,
                        current: metadata.version.clone(),
                    },
                );
            }
        }

        tracing::debug!(
            function_id = %metadata.id,
            version = %metadata.version,
            "Deployed function version"
        );
        Ok(metadata)
    }

    /// Point the current version at an already-deployed version
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the function or version is unknown
    pub fn promote(&self, id: &str, version: &Version) -> CoreResult<()> {
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let record = functions
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found("function", id))?;
        if !record.versions.contains_key(version) {
            return Err(CoreError::not_found("version", format!("{}@{}", id, version)));
        }
        record.current = version.clone();
        Ok(())
    }

    /// Current version of a function
    #[must_use]
    pub fn current_version(&self, id: &str) -> Option<Version> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|r| r.current.clone())
    }

    /// All versions of a function, oldest first
    #[must_use]
    pub fn versions(&self, id: &str) -> Vec<Version> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|r| r.versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Registered function ids
    #[must_use]
    pub fn function_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Get store statistics
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        StoreStats {
            function_count: functions.len(),
            version_count: functions.values().map(|r| r.versions.len()).sum(),
            metadata_reads: self.metadata_reads.load(Ordering::Relaxed),
            code_reads: self.code_reads.load(Ordering::Relaxed),
        }
    }

    fn describe(id: &str, version: Option<&Version>) -> String {
        match version {
            Some(v) => format!("{}@{}", id, v),
            None => id.to_string(),
        }
    }
}

#[async_trait]
impl FunctionStore for MemoryStore {
    async fn get_metadata(
        &self,
        id: &str,
        version: Option<&Version>,
    ) -> CoreResult<FunctionMetadata> {
        self.metadata_reads.fetch_add(1, Ordering::Relaxed);
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        functions
            .get(id)
            .and_then(|r| r.snapshot(version))
            .map(|s| s.metadata.clone())
            .ok_or_else(|| CoreError::not_found("function", Self::describe(id, version)))
    }

    async fn get_code(&self, id: &str, version: Option<&Version>) -> CoreResult<String> {
        self.code_reads.fetch_add(1, Ordering::Relaxed);
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        functions
            .get(id)
            .and_then(|r| r.snapshot(version))
            .and_then(|s| s.code.clone())
            .ok_or_else(|| CoreError::not_found("code", Self::describe(id, version)))
    }
}
