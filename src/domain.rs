//! Domain shapes shared by every pipeline stage.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::pipeline::ingestion::RawRow;
use crate::pipeline::processing::dedupe::IdentityKey;
use crate::pipeline::processing::keys::NaturalKey;
use crate::pipeline::processing::normalize::{TableSchema, TypedRow};

/// Integer key generated by the pipeline, used for every internal reference.
pub type SurrogateKey = i64;

/// The three source tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Customer,
    Product,
    Sale,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Customer => "customer",
            Entity::Product => "product",
            Entity::Sale => "sale",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record together with the source line it came from and the raw cells it was built from.
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    pub source_row: usize,
    pub record: T,
    pub origin: RawRow,
}

/// A dimension record after surrogate key assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed<T> {
    pub key: SurrogateKey,
    pub source_row: usize,
    pub record: T,
}

/// An entity that can be built from a normalized row of its table.
pub trait Record: Clone + PartialEq + Send + 'static {
    const ENTITY: Entity;

    fn schema() -> &'static TableSchema;

    /// Build the record from a schema-conformant row. An `Err` carries the
    /// reason the row still violates the entity's rules.
    fn from_row(row: &TypedRow) -> Result<Self, String>;

    /// Default identity used by the deduplicator.
    fn identity(&self) -> IdentityKey;
}

/// A record that lives in a dimension table and is identified by a natural key.
pub trait DimensionRecord: Record {
    fn natural_key(&self) -> &NaturalKey;
}

/// Customer dimension
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Customer {
    pub customer_id: NaturalKey,
    pub name: Option<String>,
    pub segment: Option<String>,
}

/// Product dimension
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub product_id: NaturalKey,
    pub name: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub unit_cost: Option<f64>,
}

/// A sales row after normalization, still referencing dimensions by natural key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaleDraft {
    pub transaction_id: Option<i64>,
    pub customer_ref: NaturalKey,
    pub product_ref: NaturalKey,
    pub sale_date: NaiveDate,
    pub quantity: i64,
    pub unit_price: f64,
    pub revenue: f64,
    /// Margin supplied by the source, if any
    pub profit_margin: Option<f64>,
}

/// A fact row ready for loading. Only surrogate keys from here on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sale {
    pub sale_id: i64,
    pub source_row: usize,
    pub transaction_id: Option<i64>,
    pub customer_key: SurrogateKey,
    pub product_key: SurrogateKey,
    pub sale_date: NaiveDate,
    pub quantity: i64,
    pub unit_price: f64,
    pub revenue: f64,
    pub profit_margin: Option<f64>,
}
