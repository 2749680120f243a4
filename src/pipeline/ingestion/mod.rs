// Pipeline ingestion: reading the raw delimited sources

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::domain::Entity;
use crate::error::{EtlError, Result};
use crate::observability::metrics::{emit_counter, MetricName};
use crate::pipeline::context::{RejectReason, RunContext, Stage};
use crate::pipeline::processing::normalize::TableSchema;

/// One data line of a source, cells keyed by canonical field name.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// Line number in the source file (the header is line 1)
    pub source_row: usize,
    pub cells: BTreeMap<&'static str, String>,
}

/// A data line that could not be decoded as text
#[derive(Debug, Clone, PartialEq)]
pub struct UndecodableRow {
    pub source_row: usize,
    pub detail: String,
}

/// All data lines of one source
#[derive(Debug, Clone)]
pub struct RawTable {
    pub entity: Entity,
    pub path: PathBuf,
    pub rows: Vec<RawRow>,
    /// Lines whose every cell was empty
    pub blank_rows: usize,
    /// Lines dropped at read time, logged by [`RawTable::record_read`]
    pub undecodable: Vec<UndecodableRow>,
}

impl RawTable {
    /// Record the read stage for this table and log undecodable lines.
    pub fn record_read(&self, ctx: &mut RunContext) {
        for row in &self.undecodable {
            ctx.reject(
                self.entity,
                row.source_row,
                Stage::Read,
                RejectReason::SchemaViolation,
                row.detail.clone(),
            );
        }
        let input = self.rows.len() + self.blank_rows + self.undecodable.len();
        ctx.record_stage(self.entity, Stage::Read, input, self.rows.len());
    }
}

/// Trim, lower-case and snake-case a header cell.
pub fn standardize_header(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Open and read one source file.
pub fn read_table(entity: Entity, path: &Path, schema: &'static TableSchema, delimiter: u8) -> Result<RawTable> {
    let file = File::open(path).map_err(|source| EtlError::SourceUnavailable {
        entity,
        path: path.to_path_buf(),
        source,
    })?;
    let table = read_table_from(entity, path, file, schema, delimiter)?;
    info!(
        entity = %entity,
        path = %path.display(),
        rows = table.rows.len(),
        blank = table.blank_rows,
        undecodable = table.undecodable.len(),
        "Loaded source"
    );
    Ok(table)
}

/// Read a source from any reader. `path` is only used for labelling.
pub fn read_table_from<R: Read>(
    entity: Entity,
    path: &Path,
    reader: R,
    schema: &'static TableSchema,
    delimiter: u8,
) -> Result<RawTable> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader.headers()?.iter().map(standardize_header).collect();

    // Field name -> column index, first matching header wins
    let mut columns: Vec<(&'static str, usize)> = Vec::with_capacity(schema.fields.len());
    let mut missing = Vec::new();
    for field in schema.fields {
        match headers.iter().position(|h| field.matches_header(h)) {
            Some(idx) => columns.push((field.name, idx)),
            None if field.required => missing.push(field.name.to_string()),
            None => debug!(entity = %entity, field = field.name, "Optional column absent"),
        }
    }
    if !missing.is_empty() {
        return Err(EtlError::MissingColumns {
            entity,
            columns: missing,
        });
    }

    let mut rows = Vec::new();
    let mut blank_rows = 0usize;
    let mut undecodable = Vec::new();
    // Byte records, so one badly encoded line cannot fail the whole source
    for (idx, record) in csv_reader.byte_records().enumerate() {
        let record = record?;
        if record.iter().all(|cell| cell.iter().all(u8::is_ascii_whitespace)) {
            blank_rows += 1;
            continue;
        }
        let source_row = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(idx + 2);

        let mut cells = BTreeMap::new();
        let mut bad_field = None;
        for (name, col) in &columns {
            let bytes = record.get(*col).unwrap_or(&[]);
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    cells.insert(*name, text.to_string());
                }
                Err(_) => {
                    bad_field = Some(*name);
                    break;
                }
            }
        }
        match bad_field {
            None => rows.push(RawRow { source_row, cells }),
            Some(field) => {
                warn!(entity = %entity, row = source_row, field, "Row is not valid UTF-8");
                undecodable.push(UndecodableRow {
                    source_row,
                    detail: format!("field '{field}' is not valid UTF-8"),
                });
            }
        }
    }

    emit_counter(MetricName::RecordsRead, entity, rows.len() as u64);
    Ok(RawTable {
        entity,
        path: path.to_path_buf(),
        rows,
        blank_rows,
        undecodable,
    })
}
