//! Per-table cleaning: trims text, coerces typed fields and nulls out blanks.

pub mod schemas;

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::domain::{Record, Sourced};
use crate::observability::metrics::{emit_counter, MetricName};
use crate::pipeline::context::{RejectReason, RunContext, Stage};
use crate::pipeline::ingestion::{RawRow, RawTable};
use crate::pipeline::processing::keys::{canonical_key, NaturalKey};

/// Accepted input date layouts, tried in order. The first one is canonical.
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%Y/%m/%d"];

/// Expected type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Date,
    /// Identifier canonicalized with [`canonical_key`]
    Key { prefix: Option<char> },
}

impl FieldKind {
    fn expected(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Date => "date",
            FieldKind::Key { .. } => "key",
        }
    }
}

/// How whitespace inside text values is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimRule {
    /// Strip leading and trailing whitespace only
    Edges,
    /// Also collapse inner runs of whitespace to one space
    Collapse,
}

/// One column of a source table
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Canonical field name
    pub name: &'static str,
    /// Other standardized header names accepted for this field
    pub aliases: &'static [&'static str],
    pub kind: FieldKind,
    pub required: bool,
    pub trim: TrimRule,
}

impl FieldSpec {
    pub fn matches_header(&self, header: &str) -> bool {
        self.name == header || self.aliases.contains(&header)
    }
}

/// Field schema for one source table
#[derive(Debug)]
pub struct TableSchema {
    pub fields: &'static [FieldSpec],
}

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A typed cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    Key(NaturalKey),
}

impl Value {
    /// Canonical text form. Coercing the rendering yields the same value.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Date(d) => d.format(DATE_FORMATS[0]).to_string(),
            Value::Key(k) => k.to_string(),
        }
    }
}

/// A schema-conformant row
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    pub source_row: usize,
    pub values: BTreeMap<&'static str, Value>,
}

impl TypedRow {
    pub fn get(&self, field: &str) -> &Value {
        self.values.get(field).unwrap_or(&Value::Null)
    }

    pub fn text(&self, field: &str) -> Option<String> {
        match self.get(field) {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        match self.get(field) {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn decimal(&self, field: &str) -> Option<f64> {
        match self.get(field) {
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn date(&self, field: &str) -> Option<NaiveDate> {
        match self.get(field) {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn key(&self, field: &str) -> Option<NaturalKey> {
        match self.get(field) {
            Value::Key(k) => Some(k.clone()),
            _ => None,
        }
    }

    /// Render back to raw cells, e.g. to feed the row through normalization again.
    pub fn to_raw(&self) -> RawRow {
        RawRow {
            source_row: self.source_row,
            cells: self.values.iter().map(|(name, value)| (*name, value.render())).collect(),
        }
    }
}

/// Why a row failed its schema
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub field: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.trim().is_empty() {
            write!(f, "required field '{}' is empty", self.field)
        } else {
            write!(f, "field '{}' value {:?} is not a valid {}", self.field, self.value, self.expected)
        }
    }
}

/// Coerce one raw cell. `Ok(Value::Null)` means the cell was blank.
pub fn coerce(kind: FieldKind, trim: TrimRule, raw: &str) -> Result<Value, &'static str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    match kind {
        FieldKind::Text => Ok(Value::Text(match trim {
            TrimRule::Edges => trimmed.to_string(),
            TrimRule::Collapse => trimmed.split_whitespace().collect::<Vec<_>>().join(" "),
        })),
        FieldKind::Integer => parse_integer(trimmed).map(Value::Integer).ok_or(kind.expected()),
        FieldKind::Decimal => parse_decimal(trimmed).map(Value::Decimal).ok_or(kind.expected()),
        FieldKind::Date => parse_date(trimmed).map(Value::Date).ok_or(kind.expected()),
        FieldKind::Key { prefix } => canonical_key(trimmed, prefix)
            .map(Value::Key)
            .ok_or(kind.expected()),
    }
}

fn parse_integer(s: &str) -> Option<i64> {
    if let Ok(i) = s.strip_prefix('+').unwrap_or(s).parse::<i64>() {
        return Some(i);
    }
    // Integral floats such as "3.0" from spreadsheet exports
    let f = s.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_decimal(s: &str) -> Option<f64> {
    let cleaned = s.replace(',', "");
    let cleaned = cleaned.strip_prefix('$').unwrap_or(&cleaned);
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Applies a [`TableSchema`] to raw rows
pub struct Normalizer {
    schema: &'static TableSchema,
}

impl Normalizer {
    pub fn new(schema: &'static TableSchema) -> Self {
        Self { schema }
    }

    /// Normalize a single row. Invalid optional values become null; the first
    /// failing required field is reported.
    pub fn normalize_row(&self, row: &RawRow) -> Result<TypedRow, Violation> {
        let mut values = BTreeMap::new();
        for field in self.schema.fields {
            let raw = row.cells.get(field.name).map(String::as_str).unwrap_or("");
            let value = match coerce(field.kind, field.trim, raw) {
                Ok(value) => value,
                Err(expected) if field.required => {
                    return Err(Violation {
                        field: field.name,
                        value: raw.to_string(),
                        expected,
                    });
                }
                Err(expected) => {
                    debug!(row = row.source_row, field = field.name, value = raw, expected, "Invalid optional value nulled");
                    Value::Null
                }
            };
            if field.required && value == Value::Null {
                return Err(Violation {
                    field: field.name,
                    value: raw.to_string(),
                    expected: field.kind.expected(),
                });
            }
            values.insert(field.name, value);
        }
        Ok(TypedRow {
            source_row: row.source_row,
            values,
        })
    }

    /// Normalize a whole table into records, routing failures to the rejection log.
    /// Input order is preserved.
    pub fn normalize<R: Record>(&self, table: &RawTable, ctx: &mut RunContext) -> Vec<Sourced<R>> {
        let mut out = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let built = self
                .normalize_row(row)
                .map_err(|v| v.to_string())
                .and_then(|typed| R::from_row(&typed));
            match built {
                Ok(record) => out.push(Sourced {
                    source_row: row.source_row,
                    record,
                    origin: row.clone(),
                }),
                Err(reason) => {
                    debug!(entity = %R::ENTITY, row = row.source_row, %reason, "Row rejected during normalization");
                    ctx.reject(R::ENTITY, row.source_row, Stage::Normalize, RejectReason::SchemaViolation, reason);
                }
            }
        }

        let rejected = table.rows.len() - out.len();
        emit_counter(MetricName::RecordsNormalized, R::ENTITY, out.len() as u64);
        emit_counter(MetricName::RecordsRejected, R::ENTITY, rejected as u64);
        info!(entity = %R::ENTITY, kept = out.len(), rejected, "Normalization finished");
        ctx.record_stage(R::ENTITY, Stage::Normalize, table.rows.len(), out.len());
        out
    }
}

/// Normalize a table with the record type's own schema.
pub fn normalize_table<R: Record>(table: &RawTable, ctx: &mut RunContext) -> Vec<Sourced<R>> {
    Normalizer::new(R::schema()).normalize(table, ctx)
}
