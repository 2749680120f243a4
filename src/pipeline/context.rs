//! Explicit run state threaded through every stage: the rejection log,
//! per-stage counts and merged-duplicate tallies.
//!
//! Each dimension pipeline gets its own context and the orchestrator folds
//! them back with [`RunContext::absorb`] in a fixed order, so the log order
//! does not depend on which task finished first.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Read,
    Normalize,
    Deduplicate,
    Resolve,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Read => "READ",
            Stage::Normalize => "NORMALIZE",
            Stage::Deduplicate => "DEDUPLICATE",
            Stage::Resolve => "RESOLVE",
            Stage::Load => "LOAD",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recoverable, per-row reasons for dropping or merging a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    SchemaViolation,
    OrphanReference,
    AttributeConflict,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SchemaViolation => "SCHEMA_VIOLATION",
            RejectReason::OrphanReference => "ORPHAN_REFERENCE",
            RejectReason::AttributeConflict => "ATTRIBUTE_CONFLICT",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the rejection log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub entity: Entity,
    /// Line number in the source file (the header is line 1)
    pub source_row: usize,
    pub stage: Stage,
    pub reason: RejectReason,
    pub detail: String,
}

/// Input and output row counts of one stage for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCount {
    pub entity: Entity,
    pub stage: Stage,
    pub input: usize,
    pub output: usize,
}

/// An identity key that absorbed duplicate rows during deduplication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollapsedKey {
    pub entity: Entity,
    pub key: String,
    /// Rows folded into the surviving one
    pub merged: usize,
}

#[derive(Debug, Default)]
pub struct RunContext {
    rejections: Vec<Rejection>,
    stages: Vec<StageCount>,
    duplicates: BTreeMap<Entity, usize>,
    collapsed: Vec<CollapsedKey>,
}

impl RunContext {
    pub fn reject(
        &mut self,
        entity: Entity,
        source_row: usize,
        stage: Stage,
        reason: RejectReason,
        detail: impl Into<String>,
    ) {
        self.rejections.push(Rejection {
            entity,
            source_row,
            stage,
            reason,
            detail: detail.into(),
        });
    }

    pub fn record_stage(&mut self, entity: Entity, stage: Stage, input: usize, output: usize) {
        self.stages.push(StageCount {
            entity,
            stage,
            input,
            output,
        });
    }

    pub fn record_duplicates(&mut self, entity: Entity, merged: usize) {
        *self.duplicates.entry(entity).or_insert(0) += merged;
    }

    pub fn record_collapsed(&mut self, entity: Entity, key: impl Into<String>, merged: usize) {
        self.collapsed.push(CollapsedKey {
            entity,
            key: key.into(),
            merged,
        });
    }

    /// Append another context's entries after this one's.
    pub fn absorb(&mut self, other: RunContext) {
        self.rejections.extend(other.rejections);
        self.stages.extend(other.stages);
        self.collapsed.extend(other.collapsed);
        for (entity, merged) in other.duplicates {
            self.record_duplicates(entity, merged);
        }
    }

    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    pub fn stages(&self) -> &[StageCount] {
        &self.stages
    }

    pub fn collapsed_keys(&self) -> &[CollapsedKey] {
        &self.collapsed
    }

    pub fn duplicates_merged(&self, entity: Entity) -> usize {
        self.duplicates.get(&entity).copied().unwrap_or(0)
    }

    pub fn rejected_by_reason(&self) -> BTreeMap<RejectReason, usize> {
        let mut counts = BTreeMap::new();
        for rejection in &self.rejections {
            *counts.entry(rejection.reason).or_insert(0) += 1;
        }
        counts
    }

    /// Close the run. The returned log is never appended to again.
    pub fn finish(self) -> RunLedger {
        RunLedger {
            rejected_by_reason: self.rejected_by_reason(),
            rejections: self.rejections,
            stages: self.stages,
            duplicates_merged: self.duplicates,
            collapsed_keys: self.collapsed,
        }
    }
}

/// Frozen contents of a finished [`RunContext`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLedger {
    pub stages: Vec<StageCount>,
    pub duplicates_merged: BTreeMap<Entity, usize>,
    pub collapsed_keys: Vec<CollapsedKey>,
    pub rejected_by_reason: BTreeMap<RejectReason, usize>,
    pub rejections: Vec<Rejection>,
}
