//! Immutable, versioned records of evaluated candidates and rollback.

use crate::error::{EvoGuardError, Result};
use crate::sandbox::ExecutionResult;
use crate::security::{SecurityPolicyValidator, ValidationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod store;

pub use store::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};

/// Above this many DP cells the diff degrades to whole-block replacement.
const MAX_DIFF_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotMetadata {
    /// Defaults to the per-sandbox sequence number (`1`, `2`, ...)
    pub version: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    pub id: String,
    pub sandbox_id: String,
    pub timestamp: DateTime<Utc>,
    pub code: String,
    pub tests: String,
    pub execution_result: Option<ExecutionResult>,
    pub metadata: SnapshotMetadata,
    /// BLAKE3 of code and tests
    pub checksum: String,
}

impl SnapshotData {
    pub fn verify_checksum(&self) -> bool {
        checksum(&self.code, &self.tests) == self.checksum
    }
}

fn checksum(code: &str, tests: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(code.as_bytes());
    hasher.update(&[0]);
    hasher.update(tests.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineDiff {
    pub added: usize,
    pub removed: usize,
    /// `+`/`-`/` ` prefixed lines
    pub rendered: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotComparison {
    pub code_diff: bool,
    pub test_diff: bool,
    pub code: LineDiff,
    pub tests: LineDiff,
}

/// Line-level diff using a longest-common-subsequence table on the part
/// between the common prefix and suffix.
pub fn line_diff(before: &str, after: &str) -> LineDiff {
    let a: Vec<&str> = before.lines().collect();
    let b: Vec<&str> = after.lines().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let mut ops: Vec<(char, &str)> = a[..prefix].iter().map(|l| (' ', *l)).collect();
    if a_mid.len().saturating_mul(b_mid.len()) > MAX_DIFF_CELLS {
        ops.extend(a_mid.iter().map(|l| ('-', *l)));
        ops.extend(b_mid.iter().map(|l| ('+', *l)));
    } else {
        let (n, m) = (a_mid.len(), b_mid.len());
        let mut table = vec![vec![0usize; m + 1]; n + 1];
        for i in (0..n).rev() {
            for j in (0..m).rev() {
                table[i][j] = if a_mid[i] == b_mid[j] {
                    table[i + 1][j + 1] + 1
                } else {
                    table[i + 1][j].max(table[i][j + 1])
                };
            }
        }
        let (mut i, mut j) = (0, 0);
        while i < n && j < m {
            if a_mid[i] == b_mid[j] {
                ops.push((' ', a_mid[i]));
                i += 1;
                j += 1;
            } else if table[i + 1][j] >= table[i][j + 1] {
                ops.push(('-', a_mid[i]));
                i += 1;
            } else {
                ops.push(('+', b_mid[j]));
                j += 1;
            }
        }
        ops.extend(a_mid[i..].iter().map(|l| ('-', *l)));
        ops.extend(b_mid[j..].iter().map(|l| ('+', *l)));
    }
    ops.extend(a[a.len() - suffix..].iter().map(|l| (' ', *l)));

    let mut diff = LineDiff::default();
    let mut rendered = Vec::with_capacity(ops.len());
    for (op, line) in ops {
        match op {
            '+' => diff.added += 1,
            '-' => diff.removed += 1,
            _ => {}
        }
        rendered.push(format!("{}{}", op, line));
    }
    diff.rendered = rendered.join("\n");
    diff
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub snapshot_id: String,
    #[serde(default)]
    pub validate_before_rollback: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    /// Content for the caller to apply
    pub snapshot: SnapshotData,
    pub validation: Option<ValidationResult>,
    pub reason: Option<String>,
}

pub struct SnapshotManager {
    store: Arc<dyn SnapshotStore>,
    validator: Option<Arc<SecurityPolicyValidator>>,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            validator: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySnapshotStore::new()))
    }

    /// Validator used by `rollback` when re-validation is requested.
    pub fn with_validator(mut self, validator: Arc<SecurityPolicyValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn create_snapshot(
        &self,
        sandbox_id: &str,
        code: &str,
        tests: &str,
        execution_result: Option<ExecutionResult>,
        metadata: Option<SnapshotMetadata>,
    ) -> Result<String> {
        let snapshot = SnapshotData {
            id: format!("snap-{}", uuid::Uuid::new_v4().simple()),
            sandbox_id: sandbox_id.to_string(),
            timestamp: Utc::now(),
            code: code.to_string(),
            tests: tests.to_string(),
            execution_result,
            checksum: checksum(code, tests),
            metadata: metadata.unwrap_or_default(),
        };
        let snapshot = self
            .store
            .insert(snapshot)
            .map_err(|e| EvoGuardError::storage("insert snapshot", e))?;

        tracing::info!(
            snapshot_id = %snapshot.id,
            sandbox_id,
            version = %snapshot.metadata.version,
            "Snapshot created"
        );
        Ok(snapshot.id)
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotData>> {
        self.store
            .get(snapshot_id)
            .map_err(|e| EvoGuardError::storage("get snapshot", e))
    }

    pub fn list_snapshots(&self, sandbox_id: &str) -> Result<Vec<SnapshotData>> {
        self.store
            .list_by_sandbox(sandbox_id)
            .map_err(|e| EvoGuardError::storage("list snapshots", e))
    }

    fn require(&self, snapshot_id: &str) -> Result<SnapshotData> {
        self.get_snapshot(snapshot_id)?
            .ok_or_else(|| EvoGuardError::SnapshotNotFound(snapshot_id.to_string()))
    }

    pub fn compare_snapshots(&self, first: &str, second: &str) -> Result<SnapshotComparison> {
        let a = self.require(first)?;
        let b = self.require(second)?;
        Ok(SnapshotComparison {
            code_diff: a.code != b.code,
            test_diff: a.tests != b.tests,
            code: line_diff(&a.code, &b.code),
            tests: line_diff(&a.tests, &b.tests),
        })
    }

    /// Reads the snapshot back for the caller to apply, optionally
    /// re-validating its code first. The store is never modified.
    pub fn rollback(&self, request: &RollbackRequest) -> Result<RollbackOutcome> {
        let snapshot = self.require(&request.snapshot_id)?;

        if !snapshot.verify_checksum() {
            tracing::error!(snapshot_id = %snapshot.id, "Snapshot checksum mismatch");
            return Ok(RollbackOutcome {
                success: false,
                snapshot,
                validation: None,
                reason: Some("checksum mismatch".to_string()),
            });
        }

        let validation = if request.validate_before_rollback {
            let validator = self.validator.as_ref().ok_or_else(|| {
                EvoGuardError::Config(
                    "rollback validation requested but no validator is configured".to_string(),
                )
            })?;
            Some(validator.validate_code(&snapshot.code))
        } else {
            None
        };
        let success = validation.as_ref().map(|v| v.valid).unwrap_or(true);

        tracing::info!(
            snapshot_id = %snapshot.id,
            success,
            reason = request.reason.as_deref().unwrap_or(""),
            "Rollback requested"
        );

        Ok(RollbackOutcome {
            success,
            snapshot,
            validation,
            reason: request.reason.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityPolicy;

    #[test]
    fn test_line_diff_counts() {
        let diff = line_diff("a\nb\nc\n", "a\nx\nc\nd\n");
        assert_eq!(diff.added, 2);
        assert_eq!(diff.removed, 1);
        assert_eq!(diff.rendered, " a\n-b\n+x\n c\n+d");
        assert_eq!(line_diff("same", "same").added, 0);
    }

    #[test]
    fn test_default_versions_are_sequential() {
        let manager = SnapshotManager::in_memory();
        manager.create_snapshot("sbx-1", "a", "t", None, None).unwrap();
        manager.create_snapshot("sbx-1", "b", "t", None, None).unwrap();
        let tagged = manager
            .create_snapshot(
                "sbx-1",
                "c",
                "t",
                None,
                Some(SnapshotMetadata {
                    version: "release-7".to_string(),
                    ..Default::default()
                }),
            )
            .unwrap();
        let versions: Vec<String> = manager
            .list_snapshots("sbx-1")
            .unwrap()
            .into_iter()
            .map(|s| s.metadata.version)
            .collect();
        assert_eq!(versions, vec!["1", "2", "release-7"]);
        assert!(manager.get_snapshot(&tagged).unwrap().unwrap().verify_checksum());
    }

    #[test]
    fn test_compare_snapshots() {
        let manager = SnapshotManager::in_memory();
        let a = manager.create_snapshot("s", "x = 1", "t", None, None).unwrap();
        let b = manager.create_snapshot("s", "x = 2", "t", None, None).unwrap();
        let cmp = manager.compare_snapshots(&a, &b).unwrap();
        assert!(cmp.code_diff);
        assert!(!cmp.test_diff);
        assert_eq!(cmp.code.added, 1);
        assert!(matches!(
            manager.compare_snapshots(&a, "missing"),
            Err(EvoGuardError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_rollback_with_validation() {
        let validator = Arc::new(SecurityPolicyValidator::new(SecurityPolicy::default()).unwrap());
        let manager = SnapshotManager::in_memory().with_validator(validator);
        let good = manager.create_snapshot("s", "const a = 1;", "", None, None).unwrap();
        let bad = manager.create_snapshot("s", "eval('a')", "", None, None).unwrap();

        let outcome = manager
            .rollback(&RollbackRequest {
                snapshot_id: good,
                validate_before_rollback: true,
                reason: Some("regression".to_string()),
            })
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.snapshot.code, "const a = 1;");

        let outcome = manager
            .rollback(&RollbackRequest {
                snapshot_id: bad.clone(),
                validate_before_rollback: true,
                reason: None,
            })
            .unwrap();
        assert!(!outcome.success);
        assert!(!outcome.validation.unwrap().valid);

        // Without validation the stored content is returned as-is
        let outcome = manager
            .rollback(&RollbackRequest {
                snapshot_id: bad,
                ..Default::default()
            })
            .unwrap();
        assert!(outcome.success);
    }

    #[test]
    fn test_rollback_validation_needs_validator() {
        let manager = SnapshotManager::in_memory();
        let id = manager.create_snapshot("s", "1", "", None, None).unwrap();
        let err = manager
            .rollback(&RollbackRequest {
                snapshot_id: id,
                validate_before_rollback: true,
                reason: None,
            })
            .unwrap_err();
        assert!(matches!(err, EvoGuardError::Config(_)));
    }
}
