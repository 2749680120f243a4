use std::fs;
use std::path::{Path, PathBuf};

use keylime_etl::domain::Entity;
use keylime_etl::pipeline::storage::SqliteStore;
use keylime_etl::pipeline::{RejectReason, Stage};
use keylime_etl::{Pipeline, PipelineConfig, RunReport};
use rusqlite::Connection;
use tempfile::TempDir;

const CUSTOMERS: &str = "\
CustomerSegmentID,Customer Name,Customer Segment
1, Alice ,Retail
2,Bob,Wholesale
01,Alice B,Retail
,Nobody,Retail
";

const PRODUCTS: &str = "\
ProductID,ProductVariant,Category,Price,Unit Cost
P1,Key Lime Pie,Pies,$24.00,18.00
2,Lime Tart,Tarts,6.50,
P03, Lime Bar ,Bars,3.00,1.50
";

const SALES: &str = "\
TransactionID,CustomerSegmentID,ProductID,Date,UnitsSold,UnitPrice,Revenue
1001,1,1,2024-01-02,2,24.00,48.00
1002,C002,P2,01/03/2024,3,6.50,
1003,2,99,2024-01-04,1,3.00,3.00
1004,007,3,2024-01-05,1,3.00,3.00
1005,2,003,2024-01-05,4,,12.00
1001,1,1,2024-01-02,2,24.00,48.00
1006,1,1,not a date,1,24.00,24.00
";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fixture.write("customers.csv", CUSTOMERS);
        fixture.write("products.csv", PRODUCTS);
        fixture.write("sales.csv", SALES);
        fixture
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, content: &str) {
        fs::write(self.path(name), content).unwrap();
    }

    fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.inputs.customers = self.path("customers.csv");
        config.inputs.products = self.path("products.csv");
        config.inputs.sales = self.path("sales.csv");
        config.store.path = self.path("dw/keylime_sales.db");
        config
    }

    fn store(&self) -> PathBuf {
        self.path("dw/keylime_sales.db")
    }

    async fn run(&self) -> RunReport {
        Pipeline::new(self.config()).run().await.unwrap()
    }
}

fn query_i64(db: &Path, sql: &str) -> i64 {
    let conn = Connection::open(db).unwrap();
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}

#[tokio::test]
async fn test_duplicate_customers_collapse_to_latest() {
    let fixture = Fixture::new();
    let report = fixture.run().await;

    let conn = Connection::open(fixture.store()).unwrap();
    let (key, name): (i64, String) = conn
        .query_row("SELECT customer_key, name FROM customer WHERE customer_id = '1'", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(key, 1);
    assert_eq!(name, "Alice B");

    let conflicts: Vec<_> = report
        .rejections
        .iter()
        .filter(|r| r.entity == Entity::Customer && r.reason == RejectReason::AttributeConflict)
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].source_row, 2);
    assert_eq!(conflicts[0].stage, Stage::Deduplicate);
    assert_eq!(report.duplicates(Entity::Customer), 1);
    assert_eq!(report.collapsed(Entity::Customer, "n:1"), 1);
    assert_eq!(report.collapsed_keys.len(), 2);
}

#[tokio::test]
async fn test_orphan_product_is_rejected_not_loaded() {
    let fixture = Fixture::new();
    let report = fixture.run().await;

    let orphans: Vec<_> = report
        .rejections
        .iter()
        .filter(|r| r.reason == RejectReason::OrphanReference)
        .collect();
    assert_eq!(orphans.len(), 2);
    assert_eq!(orphans[0].source_row, 4);
    assert!(orphans[0].detail.contains("product_id \"99\""));
    // Customer 7 was never defined
    assert!(orphans[1].detail.contains("customer_id \"007\""));

    let loaded = query_i64(&fixture.store(), "SELECT COUNT(*) FROM sales WHERE transaction_id IN (1003, 1004)");
    assert_eq!(loaded, 0);
    let logged = query_i64(
        &fixture.store(),
        "SELECT COUNT(*) FROM rejection_log WHERE reason = 'ORPHAN_REFERENCE'",
    );
    assert_eq!(logged, 2);
}

#[tokio::test]
async fn test_representation_drift_resolves_to_same_keys() {
    let fixture = Fixture::new();
    fixture.run().await;

    let conn = Connection::open(fixture.store()).unwrap();
    let mut stmt = conn
        .prepare("SELECT transaction_id, customer_key, product_key FROM sales ORDER BY sale_id")
        .unwrap();
    let rows: Vec<(i64, i64, i64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    // 1002 references "C002"/"P2", 1005 references "2"/"003"
    assert_eq!(rows, vec![(1001, 1, 1), (1002, 2, 2), (1005, 2, 3)]);
}

#[tokio::test]
async fn test_facts_never_dangle() {
    let fixture = Fixture::new();
    fixture.run().await;
    let store = fixture.store();

    let dangling = query_i64(
        &store,
        "SELECT COUNT(*) FROM sales s
         LEFT JOIN customer c ON c.customer_key = s.customer_key
         LEFT JOIN product p ON p.product_key = s.product_key
         WHERE c.customer_key IS NULL OR p.product_key IS NULL",
    );
    assert_eq!(dangling, 0);

    let conn = Connection::open(&store).unwrap();
    let violations = conn
        .prepare("PRAGMA foreign_key_check")
        .unwrap()
        .query_map([], |_| Ok(()))
        .unwrap()
        .count();
    assert_eq!(violations, 0);
}

#[tokio::test]
async fn test_report_counts_and_derivations() {
    let fixture = Fixture::new();
    let report = fixture.run().await;

    assert_eq!(report.total_rows_processed(), 4 + 3 + 7);
    assert_eq!(report.rejected(RejectReason::SchemaViolation), 2);
    assert_eq!(report.rejected(RejectReason::OrphanReference), 2);
    assert_eq!(report.duplicates(Entity::Sale), 1);
    assert_eq!(report.rows_in("customer"), Some(2));
    assert_eq!(report.rows_in("product"), Some(3));
    assert_eq!(report.rows_in("sales"), Some(3));
    // 2024-01-02 ..= 2024-01-05
    assert_eq!(report.rows_in("dim_date"), Some(4));
    assert_eq!(report.rows_in("rejection_log"), Some(report.rejections.len() as i64));

    let load = report.stage(Entity::Sale, Stage::Load).unwrap();
    assert_eq!((load.input, load.output), (3, 3));

    let conn = Connection::open(fixture.store()).unwrap();
    let (price, revenue, margin): (f64, f64, Option<f64>) = conn
        .query_row(
            "SELECT unit_price, revenue, profit_margin FROM sales WHERE transaction_id = 1005",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(price, 3.0);
    assert_eq!(revenue, 12.0);
    assert_eq!(margin, Some(0.5));

    let margin: Option<f64> = conn
        .query_row("SELECT profit_margin FROM sales WHERE transaction_id = 1002", [], |r| r.get(0))
        .unwrap();
    assert_eq!(margin, None);

    let written = RunReport::read_json(&fixture.path("dw/keylime_sales_report.json")).unwrap();
    assert_eq!(written.run_id, report.run_id);
}

#[tokio::test]
async fn test_rerun_is_byte_identical() {
    let fixture = Fixture::new();
    let first = fixture.run().await;
    let first_bytes = fs::read(fixture.store()).unwrap();

    let second = fixture.run().await;
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.content_digest, second.content_digest);
    assert_eq!(fs::read(fixture.store()).unwrap(), first_bytes);
}

#[tokio::test]
async fn test_missing_source_aborts_before_any_stage() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.inputs.sales = fixture.path("absent.csv");

    let err = Pipeline::new(config).run().await.unwrap_err();
    assert_eq!(err.code(), "SOURCE_UNAVAILABLE");
    assert!(err.to_string().contains("absent.csv"));
    assert!(!fixture.store().exists());
    assert!(!fixture.path("dw/keylime_sales_report.json").exists());
}

#[tokio::test]
async fn test_failed_run_keeps_previous_store() {
    let fixture = Fixture::new();
    fixture.run().await;
    let store = SqliteStore::new(fixture.store());
    let before = store.content_digest().unwrap();

    fixture.write("products.csv", "Name,Category\nPie,Pies\n");
    let err = Pipeline::new(fixture.config()).run().await.unwrap_err();
    assert_eq!(err.code(), "SOURCE_UNAVAILABLE");
    assert_eq!(store.content_digest().unwrap(), before);
}

#[tokio::test]
async fn test_unwritable_report_keeps_previous_store() {
    let fixture = Fixture::new();
    fixture.run().await;
    let store = SqliteStore::new(fixture.store());
    let before = store.content_digest().unwrap();

    fixture.write("customers.csv", "customer_id,name\n1,Alice\n");
    let mut config = fixture.config();
    config.store.report = Some(fixture.path("report_dir"));
    fs::create_dir(fixture.path("report_dir")).unwrap();

    let err = Pipeline::new(config).run().await.unwrap_err();
    assert_eq!(err.code(), "IO_FAILURE");
    assert_eq!(store.content_digest().unwrap(), before);
    assert!(!fixture.path("dw/keylime_sales.db.partial").exists());
}

#[tokio::test]
async fn test_unparseable_price_keeps_product_and_its_sales() {
    let fixture = Fixture::new();
    fixture.write("products.csv", "ProductID,ProductVariant,Price\nP1,Key Lime Pie,n/a\nP2,Lime Tart,-6.50\nP3,Lime Bar,3.00\n");
    let report = fixture.run().await;

    assert_eq!(report.rows_in("product"), Some(3));
    assert_eq!(report.rejected(RejectReason::SchemaViolation), 2);
    let product_rejections = report.rejections.iter().filter(|r| r.entity == Entity::Product).count();
    assert_eq!(product_rejections, 0);

    let nulled = query_i64(&fixture.store(), "SELECT COUNT(*) FROM product WHERE price IS NULL");
    assert_eq!(nulled, 2);
    let loaded = query_i64(&fixture.store(), "SELECT COUNT(*) FROM sales WHERE transaction_id IN (1001, 1002)");
    assert_eq!(loaded, 2);
}

#[tokio::test]
async fn test_undecodable_row_is_rejected_and_run_continues() {
    let fixture = Fixture::new();
    let mut customers = b"CustomerSegmentID,Customer Name\n1,Alice\n2,B\xc3\x28b\n".to_vec();
    customers.extend_from_slice(b"7,Gia\n");
    fs::write(fixture.path("customers.csv"), customers).unwrap();
    let report = fixture.run().await;

    let undecodable: Vec<_> = report
        .rejections
        .iter()
        .filter(|r| r.entity == Entity::Customer && r.stage == Stage::Read)
        .collect();
    assert_eq!(undecodable.len(), 1);
    assert_eq!(undecodable[0].source_row, 3);
    assert_eq!(undecodable[0].reason, RejectReason::SchemaViolation);
    assert_eq!(report.rows_in("customer"), Some(2));

    let read = report.stage(Entity::Customer, Stage::Read).unwrap();
    assert_eq!((read.input, read.output), (3, 2));
}
