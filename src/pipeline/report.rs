//! JSON summary of one run, written next to the store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Entity;
use crate::error::Result;
use crate::pipeline::context::{CollapsedKey, RejectReason, Rejection, RunLedger, Stage, StageCount};
use crate::pipeline::storage::TableCount;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store: PathBuf,
    pub stages: Vec<StageCount>,
    pub duplicates_merged: BTreeMap<Entity, usize>,
    /// Per-key merge counts, only for keys that had duplicates
    pub collapsed_keys: Vec<CollapsedKey>,
    pub rejected_by_reason: BTreeMap<RejectReason, usize>,
    pub rejections: Vec<Rejection>,
    pub table_counts: Vec<TableCount>,
    /// SHA-256 of the store contents after the load
    pub content_digest: String,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        store: PathBuf,
        ledger: RunLedger,
        table_counts: Vec<TableCount>,
        content_digest: String,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            store,
            stages: ledger.stages,
            duplicates_merged: ledger.duplicates_merged,
            collapsed_keys: ledger.collapsed_keys,
            rejected_by_reason: ledger.rejected_by_reason,
            rejections: ledger.rejections,
            table_counts,
            content_digest,
        }
    }

    /// Source rows read across all three inputs, blank lines included.
    pub fn total_rows_processed(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.stage == Stage::Read)
            .map(|s| s.input)
            .sum()
    }

    pub fn total_rejected(&self) -> usize {
        self.rejected_by_reason.values().sum()
    }

    pub fn rejected(&self, reason: RejectReason) -> usize {
        self.rejected_by_reason.get(&reason).copied().unwrap_or(0)
    }

    pub fn duplicates(&self, entity: Entity) -> usize {
        self.duplicates_merged.get(&entity).copied().unwrap_or(0)
    }

    /// Rows merged into `key` of `entity`, zero if it had no duplicates.
    pub fn collapsed(&self, entity: Entity, key: &str) -> usize {
        self.collapsed_keys
            .iter()
            .find(|c| c.entity == entity && c.key == key)
            .map(|c| c.merged)
            .unwrap_or(0)
    }

    pub fn rows_in(&self, table: &str) -> Option<i64> {
        self.table_counts.iter().find(|c| c.table == table).map(|c| c.rows)
    }

    pub fn stage(&self, entity: Entity, stage: Stage) -> Option<&StageCount> {
        self.stages.iter().find(|s| s.entity == entity && s.stage == stage)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::RunContext;

    fn report() -> RunReport {
        let mut ctx = RunContext::default();
        ctx.record_stage(Entity::Customer, Stage::Read, 4, 3);
        ctx.record_stage(Entity::Sale, Stage::Read, 10, 10);
        ctx.record_duplicates(Entity::Customer, 1);
        ctx.record_collapsed(Entity::Customer, "n:1", 1);
        ctx.reject(Entity::Sale, 5, Stage::Resolve, RejectReason::OrphanReference, "product_id \"99\"");
        RunReport::new(
            Uuid::new_v4(),
            Utc::now(),
            PathBuf::from("dw.db"),
            ctx.finish(),
            vec![TableCount {
                table: "sales".to_string(),
                rows: 9,
            }],
            "abc".to_string(),
        )
    }

    #[test]
    fn test_summaries() {
        let report = report();
        assert_eq!(report.total_rows_processed(), 14);
        assert_eq!(report.total_rejected(), 1);
        assert_eq!(report.rejected(RejectReason::OrphanReference), 1);
        assert_eq!(report.rejected(RejectReason::SchemaViolation), 0);
        assert_eq!(report.duplicates(Entity::Customer), 1);
        assert_eq!(report.collapsed(Entity::Customer, "n:1"), 1);
        assert_eq!(report.collapsed(Entity::Customer, "n:2"), 0);
        assert_eq!(report.rows_in("sales"), Some(9));
        assert_eq!(report.stage(Entity::Sale, Stage::Read).map(|s| s.output), Some(10));
    }

    #[test]
    fn test_json_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");
        let report = report();
        report.write_json(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"ORPHAN_REFERENCE\""));
        assert_eq!(RunReport::read_json(&path).unwrap(), report);
    }
}
