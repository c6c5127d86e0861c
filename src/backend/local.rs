//! Directory-backed destination.
//!
//! Each table lives in `<root>/<dataset>/<table>/` as `schema.json` plus an
//! append-only `rows.ndjson`. Inserts are validated against the schema and
//! rejected rows are reported by index the same way a remote service reports
//! them. Insert ids are de-duplicated for the lifetime of the store.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::debug;
use serde_json::{Map, Value};

use super::{ErrorProto, InsertAllRequest, InsertAllResponse, InsertErrors, StreamingBackend};
use crate::error::ApiError;
use crate::schema::{FieldMode, FieldSchema, FieldType, TableSchema};
use crate::table::TableRef;

const SCHEMA_FILE: &str = "schema.json";
const SCHEMA_STAGING_FILE: &str = "schema.json.tmp";
const ROWS_FILE: &str = "rows.ndjson";

pub struct LocalStore {
    root: PathBuf,
    /// Insert ids already written, per table. Also serializes writers.
    seen: Mutex<HashMap<TableRef, HashSet<String>>>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, table: &TableRef) -> PathBuf {
        self.root.join(&table.dataset).join(&table.table)
    }

    pub fn exists(&self, table: &TableRef) -> bool {
        self.table_dir(table).join(SCHEMA_FILE).is_file()
    }

    pub fn schema(&self, table: &TableRef) -> Result<TableSchema, ApiError> {
        let path = self.table_dir(table).join(SCHEMA_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ApiError::not_found(format!("Not found: Table {table}")))
            }
            Err(e) => return Err(internal(e)),
        };
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ApiError::new(500, format!("Corrupt schema for {table}: {e}")))
    }

    /// All rows written to `table`, in insertion order.
    pub fn read_rows(&self, table: &TableRef) -> io::Result<Vec<Map<String, Value>>> {
        let path = self.table_dir(table).join(ROWS_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        Ok(rows)
    }

    /// Writes `schema.json` through a temporary file so a failed create
    /// leaves no table behind. Callers hold the store lock.
    fn write_schema(&self, table: &TableRef, schema: &TableSchema) -> Result<(), ApiError> {
        let dir = self.table_dir(table);
        let path = dir.join(SCHEMA_FILE);
        if path.exists() {
            return Err(ApiError::already_exists(format!(
                "Already Exists: Table {table}"
            )));
        }
        fs::create_dir_all(&dir).map_err(internal)?;

        let staging = dir.join(SCHEMA_STAGING_FILE);
        let written = File::create(&staging).and_then(|file| {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, schema)?;
            writer.flush()?;
            writer.get_ref().sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&staging, &path)) {
            let _ = fs::remove_file(&staging);
            return Err(internal(e));
        }
        Ok(())
    }

    fn append_rows(&self, table: &TableRef, rows: &[&Map<String, Value>]) -> io::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.table_dir(table).join(ROWS_FILE))?;
        let mut writer = BufWriter::new(file);
        for row in rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }
}

impl StreamingBackend for LocalStore {
    fn insert_all(
        &self,
        table: &TableRef,
        request: &InsertAllRequest<'_>,
    ) -> Result<InsertAllResponse, ApiError> {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        let schema = self.schema(table)?;
        let target = match &request.options.template_suffix {
            Some(suffix) => {
                // Template inserts land in an instance table sharing the base schema.
                let instance = TableRef::new(&table.dataset, format!("{}{}", table.table, suffix));
                if !self.exists(&instance) {
                    match self.write_schema(&instance, &schema) {
                        Ok(()) => {}
                        Err(e) if e.code == 409 => {}
                        Err(e) => return Err(e),
                    }
                }
                instance
            }
            None => table.clone(),
        };

        let problems: Vec<Option<String>> = request
            .rows
            .iter()
            .map(|row| validate_row(&schema.fields, row.json(), request.options.ignore_unknown_values))
            .collect();
        let any_invalid = problems.iter().any(Option::is_some);

        let mut insert_errors = Vec::new();
        for (index, problem) in problems.iter().enumerate() {
            match problem {
                Some(message) => insert_errors.push(InsertErrors {
                    index,
                    errors: vec![ErrorProto::new("invalid", message.clone())],
                }),
                None if any_invalid && !request.options.skip_invalid_rows => {
                    insert_errors.push(InsertErrors {
                        index,
                        errors: vec![ErrorProto::new("stopped", "")],
                    })
                }
                None => {}
            }
        }

        if !any_invalid || request.options.skip_invalid_rows {
            let ids = seen.entry(target.clone()).or_default();
            let mut fresh = HashSet::new();
            let mut accepted = Vec::new();
            for (row, problem) in request.rows.iter().zip(&problems) {
                if problem.is_some() {
                    continue;
                }
                // Seen ids are still reported as inserted.
                if let Some(id) = row.insert_id() {
                    if ids.contains(id) || !fresh.insert(id) {
                        continue;
                    }
                }
                accepted.push(row.json());
            }
            debug!("Appending {} row(s) to {}", accepted.len(), target);
            self.append_rows(&target, &accepted).map_err(internal)?;
            // Only ids of rows that reached disk suppress a later retry.
            ids.extend(fresh.into_iter().map(str::to_string));
        }

        Ok(InsertAllResponse::with_errors(insert_errors))
    }

    fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), ApiError> {
        let _guard = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_schema(table, schema)
    }
}

fn internal(err: io::Error) -> ApiError {
    ApiError::new(500, err.to_string())
}

/// First problem found in `row`, if any.
fn validate_row(
    fields: &[FieldSchema],
    row: &Map<String, Value>,
    ignore_unknown_values: bool,
) -> Option<String> {
    if !ignore_unknown_values {
        if let Some(name) = row.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
            return Some(format!("no such field: {name}."));
        }
    }

    fields.iter().find_map(|field| {
        let value = row.get(&field.name).unwrap_or(&Value::Null);
        check_field(field, value, ignore_unknown_values)
    })
}

fn check_field(field: &FieldSchema, value: &Value, ignore_unknown_values: bool) -> Option<String> {
    if value.is_null() {
        return (field.mode == FieldMode::Required)
            .then(|| format!("Missing required field: {}.", field.name));
    }

    if field.mode == FieldMode::Repeated {
        let Value::Array(items) = value else {
            return Some(format!("Array specified for non-repeated field: {}.", field.name));
        };
        return items
            .iter()
            .find_map(|item| check_scalar(field, item, ignore_unknown_values));
    }

    check_scalar(field, value, ignore_unknown_values)
}

fn check_scalar(field: &FieldSchema, value: &Value, ignore_unknown_values: bool) -> Option<String> {
    let ok = match (field.field_type, value) {
        (_, Value::Null) => false,
        (FieldType::Json, _) => true,
        (FieldType::Record, Value::Object(map)) => {
            return validate_row(&field.fields, map, ignore_unknown_values)
        }
        (FieldType::Record, _) => false,
        (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (FieldType::Integer, Value::String(s)) => s.parse::<i64>().is_ok(),
        (FieldType::Float | FieldType::Numeric, Value::Number(_)) => true,
        (FieldType::Float | FieldType::Numeric, Value::String(s)) => s.parse::<f64>().is_ok(),
        (FieldType::Boolean, Value::Bool(_)) => true,
        (FieldType::Boolean, Value::String(s)) => matches!(s.as_str(), "true" | "false"),
        (FieldType::Timestamp, Value::Number(_)) => true,
        (
            FieldType::String
            | FieldType::Bytes
            | FieldType::Timestamp
            | FieldType::Date
            | FieldType::Time
            | FieldType::Datetime,
            Value::String(_),
        ) => true,
        _ => false,
    };

    (!ok).then(|| format!("Cannot convert value to {:?}: {}.", field.field_type, value))
}
