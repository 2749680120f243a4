//! Surrogate key assignment and foreign-key resolution.
//!
//! [`Dimension::assign`] turns deduplicated dimension rows into keyed
//! records plus a natural-key map. [`KeyResolver`] only exists over a
//! complete [`Dimensions`] pair, so facts cannot be resolved against a
//! half-built dimension.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::domain::{
    Customer, DimensionRecord, Entity, Keyed, Product, Record, Sale, SaleDraft, Sourced,
    SurrogateKey,
};
use crate::observability::metrics::{emit_counter, MetricName};
use crate::pipeline::context::{RejectReason, RunContext, Stage};
use crate::pipeline::processing::keys::NaturalKey;
use crate::pipeline::processing::normalize::schemas::round4;

/// Canonical natural key to surrogate key for one dimension
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    keys: HashMap<NaturalKey, SurrogateKey>,
}

impl KeyMap {
    pub fn get(&self, key: &NaturalKey) -> Option<SurrogateKey> {
        self.keys.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A dimension table with surrogate keys assigned
#[derive(Debug, Clone)]
pub struct Dimension<R> {
    records: Vec<Keyed<R>>,
    keys: KeyMap,
}

impl<R: DimensionRecord> Dimension<R> {
    /// Assign surrogate keys `1..=n` in row order. Rows whose natural keys
    /// collide merge into the first key's record, later attributes winning.
    pub fn assign(rows: Vec<Sourced<R>>) -> Self {
        let mut records: Vec<Keyed<R>> = Vec::with_capacity(rows.len());
        let mut keys: HashMap<NaturalKey, SurrogateKey> = HashMap::with_capacity(rows.len());

        for row in rows {
            match keys.get(row.record.natural_key()) {
                Some(&existing) => {
                    warn!(entity = %R::ENTITY, key = %row.record.natural_key(), "Natural key collision after deduplication; merging");
                    let slot = &mut records[(existing - 1) as usize];
                    slot.source_row = row.source_row;
                    slot.record = row.record;
                }
                None => {
                    let key = records.len() as SurrogateKey + 1;
                    keys.insert(row.record.natural_key().clone(), key);
                    records.push(Keyed {
                        key,
                        source_row: row.source_row,
                        record: row.record,
                    });
                }
            }
        }

        debug!(entity = %R::ENTITY, records = records.len(), "Surrogate keys assigned");
        Self {
            records,
            keys: KeyMap { keys },
        }
    }
}

impl<R> Dimension<R> {
    pub fn records(&self) -> &[Keyed<R>] {
        &self.records
    }

    pub fn keys(&self) -> &KeyMap {
        &self.keys
    }

    pub fn get(&self, key: SurrogateKey) -> Option<&Keyed<R>> {
        usize::try_from(key - 1).ok().and_then(|idx| self.records.get(idx))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<Keyed<R>> {
        self.records
    }
}

/// Both finished dimensions. The only input the fact phase accepts.
#[derive(Debug, Clone)]
pub struct Dimensions {
    pub customers: Dimension<Customer>,
    pub products: Dimension<Product>,
}

pub struct KeyResolver<'a> {
    dimensions: &'a Dimensions,
}

impl<'a> KeyResolver<'a> {
    pub fn new(dimensions: &'a Dimensions) -> Self {
        Self { dimensions }
    }

    /// Replace natural references with surrogate keys. Facts with an
    /// unresolvable reference are logged as orphans and dropped. Surviving
    /// facts are numbered `1..=n` in input order.
    pub fn resolve(&self, drafts: Vec<Sourced<SaleDraft>>, ctx: &mut RunContext) -> Vec<Sale> {
        let input = drafts.len();
        let mut sales = Vec::with_capacity(input);

        for draft in drafts {
            let customer_key = self.dimensions.customers.keys().get(&draft.record.customer_ref);
            let product_key = self.dimensions.products.keys().get(&draft.record.product_ref);

            let (customer_key, product_key) = match (customer_key, product_key) {
                (Some(c), Some(p)) => (c, p),
                (c, p) => {
                    let mut missing = Vec::new();
                    if c.is_none() {
                        missing.push(orphan_detail(&draft, "customer_id", &draft.record.customer_ref));
                    }
                    if p.is_none() {
                        missing.push(orphan_detail(&draft, "product_id", &draft.record.product_ref));
                    }
                    let detail = missing.join("; ");
                    debug!(row = draft.source_row, %detail, "Orphan fact rejected");
                    ctx.reject(
                        Entity::Sale,
                        draft.source_row,
                        Stage::Resolve,
                        RejectReason::OrphanReference,
                        detail,
                    );
                    continue;
                }
            };

            let record = draft.record;
            let profit_margin = record
                .profit_margin
                .or_else(|| self.derived_margin(product_key, record.unit_price));

            sales.push(Sale {
                sale_id: sales.len() as i64 + 1,
                source_row: draft.source_row,
                transaction_id: record.transaction_id,
                customer_key,
                product_key,
                sale_date: record.sale_date,
                quantity: record.quantity,
                unit_price: record.unit_price,
                revenue: record.revenue,
                profit_margin,
            });
        }

        let orphans = input - sales.len();
        emit_counter(MetricName::OrphanReferences, SaleDraft::ENTITY, orphans as u64);
        info!(input, resolved = sales.len(), orphans, "Key resolution finished");
        ctx.record_stage(Entity::Sale, Stage::Resolve, input, sales.len());
        sales
    }

    /// `(unit_price - unit_cost) / unit_price` from the product's cost.
    fn derived_margin(&self, product_key: SurrogateKey, unit_price: f64) -> Option<f64> {
        let cost = self.dimensions.products.get(product_key)?.record.unit_cost?;
        if unit_price <= 0.0 {
            return None;
        }
        Some(round4((unit_price - cost) / unit_price))
    }
}

fn orphan_detail(draft: &Sourced<SaleDraft>, field: &str, canonical: &NaturalKey) -> String {
    let raw = draft.origin.cells.get(field).map(String::as_str).unwrap_or("");
    format!("{field} {raw:?} (canonical {canonical}) has no matching dimension record")
}
