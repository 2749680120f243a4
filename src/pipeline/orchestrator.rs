//! Two-phase run: both dimension pipelines, then the fact pipeline, then one load.
//!
//! Phase one runs the customer and product pipelines as independent blocking
//! tasks, each with its own [`RunContext`]. Phase two cannot start until it
//! holds a complete [`Dimensions`] value, which only exists once both
//! dimension tasks have returned.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use tokio::task;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::constants::{CUSTOMER_TABLE, PRODUCT_TABLE, SALES_TABLE};
use crate::domain::{Customer, DimensionRecord, Entity, Product, Record, Sale, SaleDraft};
use crate::error::{EtlError, Result};
use crate::observability::metrics;
use crate::pipeline::context::{RunContext, Stage};
use crate::pipeline::ingestion::{read_table, RawTable};
use crate::pipeline::processing::calendar::{calendar_days, calendar_span};
use crate::pipeline::processing::dedupe::Deduplicator;
use crate::pipeline::processing::normalize::normalize_table;
use crate::pipeline::processing::resolve::{Dimension, Dimensions, KeyResolver};
use crate::pipeline::report::RunReport;
use crate::pipeline::storage::{LoadBatch, SqliteStore, StagedStore, TableCount};

/// The three raw inputs, all read before any stage runs
#[derive(Debug, Clone)]
pub struct Sources {
    pub customers: RawTable,
    pub products: RawTable,
    pub sales: RawTable,
}

impl Sources {
    pub fn read(config: &PipelineConfig) -> Result<Self> {
        let delimiter = config.delimiter();
        Ok(Self {
            customers: read_table(Entity::Customer, &config.inputs.customers, Customer::schema(), delimiter)?,
            products: read_table(Entity::Product, &config.inputs.products, Product::schema(), delimiter)?,
            sales: read_table(Entity::Sale, &config.inputs.sales, SaleDraft::schema(), delimiter)?,
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the whole pipeline and replace the store.
    ///
    /// On `Err` the previous store, if any, is unchanged.
    pub async fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        let result = self.execute(run_id).instrument(span).await;
        if let Err(e) = &result {
            metrics::run_failed(e.code());
            error!(%run_id, code = e.code(), error = %e, "Pipeline run failed");
        }
        result
    }

    async fn execute(&self, run_id: Uuid) -> Result<RunReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        self.config.validate()?;

        info!(
            customers = %self.config.inputs.customers.display(),
            products = %self.config.inputs.products.display(),
            sales = %self.config.inputs.sales.display(),
            store = %self.config.store.path.display(),
            "Starting pipeline run"
        );
        let sources = Sources::read(&self.config)?;

        // Phase 1
        let (dimensions, mut ctx) = run_dimension_phase(sources.customers, sources.products).await?;

        // Phase 2
        let sales = run_fact_pipeline(&sources.sales, &dimensions, &mut ctx);

        let calendar = calendar_span(
            self.config.date_dimension.start,
            self.config.date_dimension.end,
            sales.iter().map(|s| s.sale_date),
        )
        .map(|(start, end)| calendar_days(start, end))
        .unwrap_or_default();

        let (customer_rows, product_rows, sale_rows) =
            (dimensions.customers.len(), dimensions.products.len(), sales.len());
        let batch = LoadBatch {
            calendar,
            customers: dimensions.customers.into_records(),
            products: dimensions.products.into_records(),
            sales,
            rejections: ctx.rejections().to_vec(),
        };

        let store_path = self.config.store.path.clone();
        let staged = stage(store_path.clone(), batch).await?;
        let table_counts = staged.table_counts().to_vec();

        for (entity, table, input) in [
            (Entity::Customer, CUSTOMER_TABLE, customer_rows),
            (Entity::Product, PRODUCT_TABLE, product_rows),
            (Entity::Sale, SALES_TABLE, sale_rows),
        ] {
            let loaded = rows_in(&table_counts, table);
            ctx.record_stage(entity, Stage::Load, input, loaded);
        }

        let content_digest = staged.content_digest().to_string();
        let report = RunReport::new(run_id, started_at, store_path, ctx.finish(), table_counts, content_digest);

        // The report lands before the swap; a failed write drops the staged store.
        let report_path = self.config.report_path();
        report.write_json(&report_path)?;
        if let Err(e) = commit(staged).await {
            if let Err(cleanup) = fs::remove_file(&report_path) {
                warn!(report = %report_path.display(), error = %cleanup, "Could not remove report of failed load");
            }
            return Err(e);
        }

        for count in &report.table_counts {
            metrics::rows_loaded(&count.table, count.rows as u64);
        }
        metrics::run_completed(timer.elapsed().as_secs_f64(), report.table_counts.len());
        info!(
            rows = report.total_rows_processed(),
            rejected = report.total_rejected(),
            report = %report_path.display(),
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );
        Ok(report)
    }
}

/// Build both dimensions in parallel and fold their contexts, customers first.
pub async fn run_dimension_phase(customers: RawTable, products: RawTable) -> Result<(Dimensions, RunContext)> {
    let customer_task = task::spawn_blocking(move || run_dimension_pipeline::<Customer>(&customers));
    let product_task = task::spawn_blocking(move || run_dimension_pipeline::<Product>(&products));

    let ((customers, customer_ctx), (products, product_ctx)) = tokio::try_join!(customer_task, product_task)
        .map_err(|e| EtlError::Task(format!("dimension pipeline: {e}")))?;

    let mut ctx = RunContext::default();
    ctx.absorb(customer_ctx);
    ctx.absorb(product_ctx);
    Ok((Dimensions { customers, products }, ctx))
}

/// Normalize, deduplicate and key one dimension table.
pub fn run_dimension_pipeline<R: DimensionRecord>(table: &RawTable) -> (Dimension<R>, RunContext) {
    let _span = info_span!("dimension_pipeline", entity = %R::ENTITY).entered();
    let mut ctx = RunContext::default();
    table.record_read(&mut ctx);

    let normalized = normalize_table::<R>(table, &mut ctx);
    let deduplicated = Deduplicator::<R>::by_identity().run(normalized, &mut ctx);
    let input = deduplicated.rows.len();
    let dimension = Dimension::assign(deduplicated.rows);
    ctx.record_stage(R::ENTITY, Stage::Resolve, input, dimension.len());

    info!(entity = %R::ENTITY, records = dimension.len(), "Dimension ready");
    (dimension, ctx)
}

/// Normalize, deduplicate and resolve the sales against finished dimensions.
pub fn run_fact_pipeline(table: &RawTable, dimensions: &Dimensions, ctx: &mut RunContext) -> Vec<Sale> {
    let _span = info_span!("fact_pipeline", entity = %Entity::Sale).entered();
    table.record_read(ctx);

    let normalized = normalize_table::<SaleDraft>(table, ctx);
    let deduplicated = Deduplicator::<SaleDraft>::by_identity().run(normalized, ctx);
    KeyResolver::new(dimensions).resolve(deduplicated.rows, ctx)
}

async fn stage(store_path: PathBuf, batch: LoadBatch) -> Result<StagedStore> {
    task::spawn_blocking(move || SqliteStore::new(store_path).stage(&batch))
        .await
        .map_err(|e| EtlError::Task(format!("load: {e}")))?
}

async fn commit(staged: StagedStore) -> Result<()> {
    task::spawn_blocking(move || staged.commit())
        .await
        .map_err(|e| EtlError::Task(format!("commit: {e}")))?
}

fn rows_in(counts: &[TableCount], table: &str) -> usize {
    counts
        .iter()
        .find(|c| c.table == table)
        .map(|c| c.rows as usize)
        .unwrap_or(0)
}
