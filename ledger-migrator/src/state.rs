//! Mutable state of one run (or one shard of a run).

use ledger_migrator_types::{MigrationErrorEntry, NodeComparison, RunSummary};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{MigrationError, Result};

#[derive(Debug, Default)]
pub struct RunState {
    /// Ordinal-keyed (`"1"`, `"2"`, ...) non-fatal errors.
    pub errors: BTreeMap<String, MigrationErrorEntry>,
    pub old_comparison: BTreeMap<String, NodeComparison>,
    pub new_comparison: BTreeMap<String, NodeComparison>,
    pub old_ignored: BTreeMap<String, NodeComparison>,
    pub new_ignored: BTreeMap<String, NodeComparison>,
    pub summary: RunSummary,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_error(&mut self, error: &str, node: &str, contractor: Option<&str>) {
        let key = (self.errors.len() + 1).to_string();
        self.errors.insert(
            key,
            MigrationErrorEntry {
                error: error.to_string(),
                node: node.to_string(),
                contractor: contractor.map(str::to_string),
            },
        );
    }

    /// Records a typed per-node failure.
    pub fn record(&mut self, node: &str, err: &MigrationError) {
        let contractor = match err {
            MigrationError::PeerNotFound { peer, .. } | MigrationError::UnpairedTrustLine { peer, .. } => {
                Some(peer.as_str())
            }
            _ => None,
        };
        self.append_error(&err.to_string(), node, contractor);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Pretty-printed JSON with sorted keys, as every run artifact is written.
pub fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}
