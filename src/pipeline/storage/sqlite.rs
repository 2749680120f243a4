//! Schema-enforced loader for the star-schema warehouse.
//!
//! A run never touches the live file. Everything is written to
//! `<store>.partial` inside one transaction with foreign keys enforced, and
//! the finished file is renamed over the store only on
//! [`StagedStore::commit`]. Any earlier failure deletes the partial file,
//! leaving the previous store as it was.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::constants::{
    CUSTOMER_TABLE, DATE_TABLE, PARTIAL_SUFFIX, PRODUCT_TABLE, REJECTION_TABLE, SALES_TABLE,
    WAREHOUSE_TABLES,
};
use crate::domain::{Customer, Keyed, Product, Sale};
use crate::error::{EtlError, Result};
use crate::pipeline::context::Rejection;
use crate::pipeline::processing::calendar::CalendarDay;

const SCHEMA_SQL: &str = include_str!("../../../migrations/001_create_star_schema.sql");
const INDEX_SQL: &str = include_str!("../../../migrations/002_create_indexes.sql");

/// Everything a run writes to the store
#[derive(Debug, Clone, Default)]
pub struct LoadBatch {
    pub calendar: Vec<CalendarDay>,
    pub customers: Vec<Keyed<Customer>>,
    pub products: Vec<Keyed<Product>>,
    pub sales: Vec<Sale>,
    pub rejections: Vec<Rejection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCount {
    pub table: String,
    pub rows: i64,
}

pub struct SqliteStore {
    path: PathBuf,
}

/// A fully built `.partial` store that has not replaced the live one yet.
///
/// Dropping it without [`StagedStore::commit`] deletes the partial file.
#[derive(Debug)]
pub struct StagedStore {
    partial: PathBuf,
    target: PathBuf,
    table_counts: Vec<TableCount>,
    content_digest: String,
    committed: bool,
}

impl StagedStore {
    pub fn table_counts(&self) -> &[TableCount] {
        &self.table_counts
    }

    pub fn content_digest(&self) -> &str {
        &self.content_digest
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    /// Atomically swap the staged file over the live store.
    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.partial, &self.target)?;
        self.committed = true;
        info!(store = %self.target.display(), "Store replaced");
        Ok(())
    }
}

impl Drop for StagedStore {
    fn drop(&mut self) {
        if !self.committed {
            debug!(partial = %self.partial.display(), "Discarding uncommitted store");
            let _ = remove_if_exists(&self.partial);
        }
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    }

    /// Rebuild the store from `batch` and swap it into place.
    pub fn replace(&self, batch: &LoadBatch) -> Result<Vec<TableCount>> {
        let staged = self.stage(batch)?;
        let counts = staged.table_counts().to_vec();
        staged.commit()?;
        Ok(counts)
    }

    /// Build `batch` into `<store>.partial` without touching the live store.
    pub fn stage(&self, batch: &LoadBatch) -> Result<StagedStore> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let partial = self.partial_path();
        remove_if_exists(&partial)?;

        match build(&partial, batch) {
            Ok((table_counts, content_digest)) => Ok(StagedStore {
                partial,
                target: self.path.clone(),
                table_counts,
                content_digest,
                committed: false,
            }),
            Err(e) => {
                error!(store = %self.path.display(), error = %e, "Load aborted; previous store left in place");
                let _ = remove_if_exists(&partial);
                Err(e)
            }
        }
    }

    fn open_read_only(&self) -> Result<Connection> {
        if !self.path.exists() {
            return Err(EtlError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no store at {}", self.path.display()),
            )));
        }
        Ok(Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?)
    }

    /// Row count of every warehouse table.
    pub fn table_counts(&self) -> Result<Vec<TableCount>> {
        count_tables(&self.open_read_only()?)
    }

    /// SHA-256 over the ordered contents of every warehouse table.
    pub fn content_digest(&self) -> Result<String> {
        digest_tables(&self.open_read_only()?)
    }
}

fn build(partial: &Path, batch: &LoadBatch) -> Result<(Vec<TableCount>, String)> {
    let mut conn = Connection::open(partial)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.execute_batch(SCHEMA_SQL)?;

    let tx = conn.transaction()?;
    // Dimensions strictly before facts
    insert_calendar(&tx, &batch.calendar)?;
    insert_customers(&tx, &batch.customers)?;
    insert_products(&tx, &batch.products)?;
    insert_sales(&tx, &batch.sales)?;
    insert_rejections(&tx, &batch.rejections)?;
    tx.execute_batch(INDEX_SQL)?;
    tx.commit()?;

    let counts = count_tables(&conn)?;
    let digest = digest_tables(&conn)?;
    conn.close().map_err(|(_, e)| EtlError::Store(e))?;
    Ok((counts, digest))
}

fn digest_tables(conn: &Connection) -> Result<String> {
    let mut hasher = Sha256::new();
    for table in WAREHOUSE_TABLES {
        hasher.update(table.as_bytes());
        hasher.update([0x1e]);
        let mut stmt = conn.prepare(&format!("SELECT * FROM {table} ORDER BY 1"))?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for idx in 0..columns {
                match row.get_ref(idx)? {
                    ValueRef::Null => hasher.update(b"\x00null"),
                    ValueRef::Integer(i) => hasher.update(i.to_string().as_bytes()),
                    ValueRef::Real(f) => hasher.update(f.to_string().as_bytes()),
                    ValueRef::Text(t) => hasher.update(t),
                    ValueRef::Blob(b) => hasher.update(hex::encode(b).as_bytes()),
                }
                hasher.update([0x1f]);
            }
            hasher.update([0x1e]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn count_tables(conn: &Connection) -> Result<Vec<TableCount>> {
    WAREHOUSE_TABLES
        .iter()
        .map(|table| {
            let rows: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
            Ok(TableCount {
                table: table.to_string(),
                rows,
            })
        })
        .collect()
}

/// Turn a constraint failure into the fatal [`EtlError::ConstraintViolation`].
fn insert_error(table: &str, source_row: usize, err: rusqlite::Error) -> EtlError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) if failure.code == ErrorCode::ConstraintViolation => {
            EtlError::ConstraintViolation {
                table: table.to_string(),
                detail: format!(
                    "source row {source_row}: {}",
                    message.clone().unwrap_or_else(|| failure.to_string())
                ),
            }
        }
        _ => EtlError::Store(err),
    }
}

fn iso(date: chrono::NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn insert_calendar(conn: &Connection, days: &[CalendarDay]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO dim_date (date_id, full_date, year, month, month_name, day, week)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for day in days {
        stmt.execute(params![
            day.date_id,
            iso(day.full_date),
            day.year,
            day.month,
            day.month_name,
            day.day,
            day.week
        ])
        .map_err(|e| insert_error(DATE_TABLE, 0, e))?;
    }
    debug!(rows = days.len(), "Inserted {DATE_TABLE}");
    Ok(())
}

fn insert_customers(conn: &Connection, customers: &[Keyed<Customer>]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO customer (customer_key, customer_id, name, segment, source_row)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for c in customers {
        stmt.execute(params![
            c.key,
            c.record.customer_id.to_string(),
            c.record.name,
            c.record.segment,
            c.source_row as i64
        ])
        .map_err(|e| insert_error(CUSTOMER_TABLE, c.source_row, e))?;
    }
    info!(rows = customers.len(), "Inserted customers");
    Ok(())
}

fn insert_products(conn: &Connection, products: &[Keyed<Product>]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO product (product_key, product_id, name, category, price, unit_cost, source_row)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for p in products {
        stmt.execute(params![
            p.key,
            p.record.product_id.to_string(),
            p.record.name,
            p.record.category,
            p.record.price,
            p.record.unit_cost,
            p.source_row as i64
        ])
        .map_err(|e| insert_error(PRODUCT_TABLE, p.source_row, e))?;
    }
    info!(rows = products.len(), "Inserted products");
    Ok(())
}

fn insert_sales(conn: &Connection, sales: &[Sale]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO sales (sale_id, transaction_id, customer_key, product_key, sale_date,
                            quantity, unit_price, revenue, profit_margin, source_row)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    for s in sales {
        stmt.execute(params![
            s.sale_id,
            s.transaction_id,
            s.customer_key,
            s.product_key,
            iso(s.sale_date),
            s.quantity,
            s.unit_price,
            s.revenue,
            s.profit_margin,
            s.source_row as i64
        ])
        .map_err(|e| insert_error(SALES_TABLE, s.source_row, e))?;
    }
    info!(rows = sales.len(), "Inserted sales");
    Ok(())
}

fn insert_rejections(conn: &Connection, rejections: &[Rejection]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO rejection_log (seq, entity, source_row, stage, reason, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (seq, r) in rejections.iter().enumerate() {
        stmt.execute(params![
            seq as i64 + 1,
            r.entity.as_str(),
            r.source_row as i64,
            r.stage.as_str(),
            r.reason.as_str(),
            r.detail
        ])
        .map_err(|e| insert_error(REJECTION_TABLE, r.source_row, e))?;
    }
    debug!(rows = rejections.len(), "Inserted {REJECTION_TABLE}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Entity;
    use crate::pipeline::context::{RejectReason, Stage};
    use crate::pipeline::processing::calendar::calendar_days;
    use crate::pipeline::processing::keys::NaturalKey;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sale(sale_id: i64, customer_key: i64, product_key: i64) -> Sale {
        Sale {
            sale_id,
            source_row: sale_id as usize + 1,
            transaction_id: Some(100 + sale_id),
            customer_key,
            product_key,
            sale_date: ymd(2024, 1, 2),
            quantity: 1,
            unit_price: 4.5,
            revenue: 4.5,
            profit_margin: Some(0.2),
        }
    }

    fn batch() -> LoadBatch {
        LoadBatch {
            calendar: calendar_days(ymd(2024, 1, 1), ymd(2024, 1, 3)),
            customers: vec![Keyed {
                key: 1,
                source_row: 2,
                record: Customer {
                    customer_id: NaturalKey::Numeric(1),
                    name: Some("Alice B".to_string()),
                    segment: None,
                },
            }],
            products: vec![Keyed {
                key: 1,
                source_row: 2,
                record: Product {
                    product_id: NaturalKey::Text("kl-9".to_string()),
                    name: Some("Key Lime Pie".to_string()),
                    category: Some("Pies".to_string()),
                    price: Some(4.5),
                    unit_cost: Some(3.6),
                },
            }],
            sales: vec![sale(1, 1, 1), sale(2, 1, 1)],
            rejections: vec![Rejection {
                entity: Entity::Sale,
                source_row: 4,
                stage: Stage::Resolve,
                reason: RejectReason::OrphanReference,
                detail: "product_id \"99\" has no matching dimension record".to_string(),
            }],
        }
    }

    fn count(counts: &[TableCount], table: &str) -> i64 {
        counts.iter().find(|c| c.table == table).map(|c| c.rows).unwrap()
    }

    #[test]
    fn test_replace_loads_every_table() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("dw").join("sales.db"));
        let counts = store.replace(&batch()).unwrap();

        assert_eq!(count(&counts, DATE_TABLE), 3);
        assert_eq!(count(&counts, CUSTOMER_TABLE), 1);
        assert_eq!(count(&counts, PRODUCT_TABLE), 1);
        assert_eq!(count(&counts, SALES_TABLE), 2);
        assert_eq!(count(&counts, REJECTION_TABLE), 1);
        assert_eq!(store.table_counts().unwrap(), counts);
        assert!(!store.partial_path().exists());
    }

    #[test]
    fn test_schema_has_keys_and_indexes() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sales.db"));
        store.replace(&batch()).unwrap();

        let conn = Connection::open(store.path()).unwrap();
        let fk_targets: Vec<String> = conn
            .prepare("SELECT \"table\" FROM pragma_foreign_key_list('sales') ORDER BY \"table\"")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(fk_targets, vec!["customer".to_string(), "product".to_string()]);

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'sales' AND name LIKE 'idx_%' ORDER BY name")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(indexes, vec!["idx_sales_customer", "idx_sales_date", "idx_sales_product"]);

        let natural: String = conn
            .query_row("SELECT product_id FROM product WHERE product_key = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(natural, "kl-9");
    }

    #[test]
    fn test_dangling_fact_is_fatal_and_keeps_previous_store() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sales.db"));
        store.replace(&batch()).unwrap();
        let before = store.content_digest().unwrap();

        let mut broken = batch();
        broken.sales.push(sale(3, 42, 1));
        let err = store.replace(&broken).unwrap_err();

        assert_eq!(err.code(), "CONSTRAINT_VIOLATION");
        match &err {
            EtlError::ConstraintViolation { table, detail } => {
                assert_eq!(table, SALES_TABLE);
                assert!(detail.contains("source row 4"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.content_digest().unwrap(), before);
        assert!(!store.partial_path().exists());
    }

    #[test]
    fn test_failed_first_load_leaves_no_store() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sales.db"));
        let mut broken = batch();
        broken.sales = vec![sale(1, 1, 7)];
        assert!(store.replace(&broken).is_err());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_uncommitted_stage_is_discarded() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sales.db"));
        store.replace(&batch()).unwrap();
        let before = store.content_digest().unwrap();

        let mut changed = batch();
        changed.sales.pop();
        let staged = store.stage(&changed).unwrap();
        let partial = staged.partial_path().to_path_buf();
        assert!(partial.exists());
        assert_eq!(count(staged.table_counts(), SALES_TABLE), 1);
        assert_ne!(staged.content_digest(), before);
        assert_eq!(store.content_digest().unwrap(), before);

        drop(staged);
        assert!(!partial.exists());
        assert_eq!(store.content_digest().unwrap(), before);
    }

    #[test]
    fn test_staged_digest_matches_committed_store() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sales.db"));
        let staged = store.stage(&batch()).unwrap();
        let digest = staged.content_digest().to_string();
        staged.commit().unwrap();

        assert_eq!(store.content_digest().unwrap(), digest);
        assert!(!store.partial_path().exists());
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sales.db"));
        store.replace(&batch()).unwrap();
        let first = fs::read(store.path()).unwrap();
        let digest = store.content_digest().unwrap();

        store.replace(&batch()).unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), first);
        assert_eq!(store.content_digest().unwrap(), digest);
    }

    #[test]
    fn test_digest_tracks_content() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sales.db"));
        store.replace(&batch()).unwrap();
        let original = store.content_digest().unwrap();

        let mut changed = batch();
        changed.sales[0].quantity = 2;
        store.replace(&changed).unwrap();
        assert_ne!(store.content_digest().unwrap(), original);
    }

    #[test]
    fn test_counts_without_store_is_an_error() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("missing.db"));
        assert!(matches!(store.table_counts(), Err(EtlError::Io(_))));
    }
}
