//! Collapses records that share an identity key.
//!
//! Policy: last write wins. The canonical row sits where its key first
//! appeared and carries the attributes of the key's last occurrence in input
//! order. A superseded row that disagrees with its successor is logged as an
//! attribute conflict; byte-identical copies are only counted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{Record, Sourced};
use crate::observability::metrics::{emit_counter, MetricName};
use crate::pipeline::context::{RejectReason, RunContext, Stage};
use crate::pipeline::processing::keys::NaturalKey;

/// Grouping key produced by an identity extractor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_natural(key: &NaturalKey) -> Self {
        match key {
            NaturalKey::Numeric(n) => Self(format!("n:{n}")),
            NaturalKey::Text(s) => Self(format!("t:{s}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of a deduplication pass
#[derive(Debug, Clone)]
pub struct Deduplicated<R> {
    /// One canonical row per identity key
    pub rows: Vec<Sourced<R>>,
    /// Number of rows folded into each key, only for keys that had duplicates
    pub collapsed: BTreeMap<IdentityKey, usize>,
}

impl<R> Deduplicated<R> {
    pub fn total_collapsed(&self) -> usize {
        self.collapsed.values().sum()
    }
}

type Extractor<R> = Box<dyn Fn(&R) -> IdentityKey + Send + Sync>;

pub struct Deduplicator<R> {
    extractor: Extractor<R>,
}

impl<R: Record> Deduplicator<R> {
    /// Deduplicate with a custom identity key extractor
    pub fn new(extractor: impl Fn(&R) -> IdentityKey + Send + Sync + 'static) -> Self {
        Self {
            extractor: Box::new(extractor),
        }
    }

    /// Deduplicate on the record type's own identity
    pub fn by_identity() -> Self {
        Self::new(R::identity)
    }

    pub fn run(&self, rows: Vec<Sourced<R>>, ctx: &mut RunContext) -> Deduplicated<R> {
        let input = rows.len();
        let mut position: HashMap<IdentityKey, usize> = HashMap::with_capacity(input);
        let mut canonical: Vec<Sourced<R>> = Vec::with_capacity(input);
        let mut collapsed: BTreeMap<IdentityKey, usize> = BTreeMap::new();
        let mut conflicts = 0usize;

        for row in rows {
            let key = (self.extractor)(&row.record);
            match position.get(&key) {
                None => {
                    position.insert(key, canonical.len());
                    canonical.push(row);
                }
                Some(&idx) => {
                    let winner_row = row.source_row;
                    let superseded = std::mem::replace(&mut canonical[idx], row);
                    if superseded.record != canonical[idx].record {
                        conflicts += 1;
                        debug!(
                            entity = %R::ENTITY,
                            key = %key,
                            superseded = superseded.source_row,
                            winner = winner_row,
                            "Duplicate disagrees on attributes; keeping the later row"
                        );
                        ctx.reject(
                            R::ENTITY,
                            superseded.source_row,
                            Stage::Deduplicate,
                            RejectReason::AttributeConflict,
                            format!("identity {key} superseded by row {winner_row}"),
                        );
                    }
                    *collapsed.entry(key).or_insert(0) += 1;
                }
            }
        }

        let merged: usize = collapsed.values().sum();
        emit_counter(MetricName::DuplicatesMerged, R::ENTITY, merged as u64);
        info!(
            entity = %R::ENTITY,
            input,
            output = canonical.len(),
            merged,
            conflicts,
            "Deduplication finished"
        );
        ctx.record_stage(R::ENTITY, Stage::Deduplicate, input, canonical.len());
        ctx.record_duplicates(R::ENTITY, merged);
        for (key, count) in &collapsed {
            ctx.record_collapsed(R::ENTITY, key.as_str(), *count);
        }

        Deduplicated {
            rows: canonical,
            collapsed,
        }
    }
}
