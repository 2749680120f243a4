//! Column schemas of the three source tables and how each entity is built
//! from a normalized row.
//!
//! Aliases cover the header spellings found in the raw exports
//! (`CustomerSegmentID`, `ProductVariant`, `UnitsSold`, ...) once headers are
//! standardized to lower snake case.

use tracing::debug;

use crate::domain::{Customer, DimensionRecord, Entity, Product, Record, SaleDraft};
use crate::pipeline::processing::dedupe::IdentityKey;
use crate::pipeline::processing::keys::NaturalKey;
use crate::pipeline::processing::normalize::{FieldKind, FieldSpec, TableSchema, TrimRule, TypedRow};

pub const CUSTOMER_PREFIX: char = 'C';
pub const PRODUCT_PREFIX: char = 'P';

const CUSTOMER_KEY: FieldKind = FieldKind::Key { prefix: Some(CUSTOMER_PREFIX) };
const PRODUCT_KEY: FieldKind = FieldKind::Key { prefix: Some(PRODUCT_PREFIX) };

pub static CUSTOMER_SCHEMA: TableSchema = TableSchema {
    fields: &[
        FieldSpec {
            name: "customer_id",
            aliases: &["customersegmentid", "customer_segmentid", "customerid", "customer_email", "email"],
            kind: CUSTOMER_KEY,
            required: true,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "name",
            aliases: &["customer_name", "full_name"],
            kind: FieldKind::Text,
            required: false,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "segment",
            aliases: &["customersegment", "customer_segment", "segment_name"],
            kind: FieldKind::Text,
            required: false,
            trim: TrimRule::Collapse,
        },
    ],
};

pub static PRODUCT_SCHEMA: TableSchema = TableSchema {
    fields: &[
        FieldSpec {
            name: "product_id",
            aliases: &["productid", "sku", "product_sku"],
            kind: PRODUCT_KEY,
            required: true,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "name",
            aliases: &["product_name", "productvariant", "product_variant"],
            kind: FieldKind::Text,
            required: false,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "category",
            aliases: &["product_category", "productcategory"],
            kind: FieldKind::Text,
            required: false,
            trim: TrimRule::Collapse,
        },
        FieldSpec {
            name: "price",
            aliases: &["list_price", "unit_price", "unitprice"],
            kind: FieldKind::Decimal,
            required: false,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "unit_cost",
            aliases: &["unitcost", "cost"],
            kind: FieldKind::Decimal,
            required: false,
            trim: TrimRule::Edges,
        },
    ],
};

pub static SALE_SCHEMA: TableSchema = TableSchema {
    fields: &[
        FieldSpec {
            name: "transaction_id",
            aliases: &["transactionid", "sales_id", "sale_id"],
            kind: FieldKind::Integer,
            required: false,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "customer_id",
            aliases: &["customersegmentid", "customer_segmentid", "customerid", "customer_email", "email"],
            kind: CUSTOMER_KEY,
            required: true,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "product_id",
            aliases: &["productid", "sku", "product_sku"],
            kind: PRODUCT_KEY,
            required: true,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "sale_date",
            aliases: &["date", "transaction_date", "saledate"],
            kind: FieldKind::Date,
            required: true,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "units_sold",
            aliases: &["unitssold", "quantity", "qty"],
            kind: FieldKind::Integer,
            required: true,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "unit_price",
            aliases: &["unitprice", "price"],
            kind: FieldKind::Decimal,
            required: false,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "revenue",
            aliases: &["sale_amount", "saleamount", "amount"],
            kind: FieldKind::Decimal,
            required: false,
            trim: TrimRule::Edges,
        },
        FieldSpec {
            name: "profit_margin",
            aliases: &["profitmargin", "margin"],
            kind: FieldKind::Decimal,
            required: false,
            trim: TrimRule::Edges,
        },
    ],
};

/// Round a derived amount to four decimal places.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn required_key(row: &TypedRow, field: &str) -> Result<NaturalKey, String> {
    row.key(field)
        .ok_or_else(|| format!("required field '{field}' is empty"))
}

impl Record for Customer {
    const ENTITY: Entity = Entity::Customer;

    fn schema() -> &'static TableSchema {
        &CUSTOMER_SCHEMA
    }

    fn from_row(row: &TypedRow) -> Result<Self, String> {
        Ok(Customer {
            customer_id: required_key(row, "customer_id")?,
            name: row.text("name"),
            segment: row.text("segment"),
        })
    }

    fn identity(&self) -> IdentityKey {
        IdentityKey::from_natural(&self.customer_id)
    }
}

impl DimensionRecord for Customer {
    fn natural_key(&self) -> &NaturalKey {
        &self.customer_id
    }
}

impl Record for Product {
    const ENTITY: Entity = Entity::Product;

    fn schema() -> &'static TableSchema {
        &PRODUCT_SCHEMA
    }

    fn from_row(row: &TypedRow) -> Result<Self, String> {
        let price = row.decimal("price").filter(|p| {
            let valid = *p >= 0.0;
            if !valid {
                debug!(row = row.source_row, price = *p, "Negative product price nulled");
            }
            valid
        });
        Ok(Product {
            product_id: required_key(row, "product_id")?,
            name: row.text("name"),
            category: row.text("category"),
            price,
            unit_cost: row.decimal("unit_cost"),
        })
    }

    fn identity(&self) -> IdentityKey {
        IdentityKey::from_natural(&self.product_id)
    }
}

impl DimensionRecord for Product {
    fn natural_key(&self) -> &NaturalKey {
        &self.product_id
    }
}

impl Record for SaleDraft {
    const ENTITY: Entity = Entity::Sale;

    fn schema() -> &'static TableSchema {
        &SALE_SCHEMA
    }

    fn from_row(row: &TypedRow) -> Result<Self, String> {
        let quantity = row
            .integer("units_sold")
            .ok_or_else(|| "required field 'units_sold' is empty".to_string())?;
        if quantity <= 0 {
            return Err(format!("field 'units_sold' must be positive, got {quantity}"));
        }
        let sale_date = row
            .date("sale_date")
            .ok_or_else(|| "required field 'sale_date' is empty".to_string())?;

        let (unit_price, revenue) = match (row.decimal("unit_price"), row.decimal("revenue")) {
            (Some(price), Some(revenue)) => (price, revenue),
            (Some(price), None) => (price, round4(price * quantity as f64)),
            (None, Some(revenue)) => (round4(revenue / quantity as f64), revenue),
            (None, None) => {
                return Err("neither 'unit_price' nor 'revenue' is present".to_string());
            }
        };
        if unit_price < 0.0 {
            return Err(format!("field 'unit_price' must not be negative, got {unit_price}"));
        }

        Ok(SaleDraft {
            transaction_id: row.integer("transaction_id"),
            customer_ref: required_key(row, "customer_id")?,
            product_ref: required_key(row, "product_id")?,
            sale_date,
            quantity,
            unit_price,
            revenue,
            profit_margin: row.decimal("profit_margin"),
        })
    }

    /// Transaction id when the source has one. Otherwise the whole normalized
    /// row, so only exact copies collapse.
    fn identity(&self) -> IdentityKey {
        match self.transaction_id {
            Some(id) => IdentityKey::new(format!("txn:{id}")),
            None => IdentityKey::new(format!(
                "row:{}|{}|{}|{}|{}|{}|{:?}",
                self.customer_ref,
                self.product_ref,
                self.sale_date,
                self.quantity,
                self.unit_price,
                self.revenue,
                self.profit_margin
            )),
        }
    }
}
