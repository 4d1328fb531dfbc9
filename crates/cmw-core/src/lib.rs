//! Core tabular model shared by the parsing and warehouse crates.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cmw-core";

/// Canonical form of a column name: uppercase, spaces and hyphens folded to
/// underscores, parentheses stripped. Every column comparison in the pipeline
/// happens on canonical names.
pub fn canonical_column_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter_map(|c| match c {
            ' ' | '-' => Some('_'),
            '(' | ')' => None,
            _ => Some(c.to_ascii_uppercase()),
        })
        .collect()
}

/// Target table for a source: `<PREFIX>_<SOURCEKEY>`, uppercased.
pub fn target_table_name(prefix: &str, source_key: &str) -> String {
    format!("{}_{}", prefix, source_key).to_ascii_uppercase()
}

/// Scalar cell value. JSON arrays and objects are carried as their serialized
/// text so a row never nests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn from_json(value: &JsonValue) -> Scalar {
        match value {
            JsonValue::Null => Scalar::Null,
            JsonValue::Bool(b) => Scalar::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Scalar::Text(s.clone()),
            other => Scalar::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => Ok(()),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Ordered tabular record set: one canonical column list, rows of scalars.
///
/// The columnar layout is what enforces the invariant that every row carries
/// exactly the same column set: a row is only ever a `Vec<Scalar>` aligned
/// with `columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RecordSet {
    columns: Vec<String>,
    rows: Vec<Vec<Scalar>>,
}

impl RecordSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns: columns.iter().map(|c| canonical_column_name(c)).collect(),
            rows: Vec::new(),
        }
    }

    /// Build a record set from JSON objects, unioning keys across all objects
    /// and filling absent cells with `Null` (the behavior a dataframe built
    /// from a list of dicts would give).
    pub fn from_objects<'a, I>(objects: I) -> Self
    where
        I: IntoIterator<Item = &'a serde_json::Map<String, JsonValue>>,
    {
        let objects: Vec<_> = objects.into_iter().collect();
        let mut columns: Vec<String> = Vec::new();
        for obj in &objects {
            for key in obj.keys() {
                let canonical = canonical_column_name(key);
                if !columns.contains(&canonical) {
                    columns.push(canonical);
                }
            }
        }

        let mut out = RecordSet {
            columns,
            rows: Vec::with_capacity(objects.len()),
        };
        for obj in objects {
            let by_canonical: BTreeMap<String, &JsonValue> = obj
                .iter()
                .map(|(k, v)| (canonical_column_name(k), v))
                .collect();
            let row = out
                .columns
                .iter()
                .map(|col| {
                    by_canonical
                        .get(col)
                        .map(|v| Scalar::from_json(v))
                        .unwrap_or(Scalar::Null)
                })
                .collect();
            out.rows.push(row);
        }
        out
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Scalar>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        let canonical = canonical_column_name(name);
        self.columns.iter().position(|c| *c == canonical)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Scalar> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Append a row given as (column, value) pairs. Columns absent from the
    /// pairs become `Null`; pairs naming unknown columns are rejected so the
    /// same-column-set invariant cannot erode silently.
    pub fn push_row(&mut self, cells: BTreeMap<String, Scalar>) -> Result<(), String> {
        let mut by_canonical: BTreeMap<String, Scalar> = BTreeMap::new();
        for (name, value) in cells {
            by_canonical.insert(canonical_column_name(&name), value);
        }
        for name in by_canonical.keys() {
            if !self.columns.contains(name) {
                return Err(format!("unknown column {name}"));
            }
        }
        let row = self
            .columns
            .iter()
            .map(|col| by_canonical.remove(col).unwrap_or(Scalar::Null))
            .collect();
        self.rows.push(row);
        Ok(())
    }

    /// Add a column filled per-row by `fill`. No-op guard: duplicates are
    /// rejected by canonical name.
    pub fn add_column<F>(&mut self, name: &str, mut fill: F) -> Result<(), String>
    where
        F: FnMut(usize, &[Scalar]) -> Scalar,
    {
        let canonical = canonical_column_name(name);
        if self.columns.contains(&canonical) {
            return Err(format!("column {canonical} already exists"));
        }
        for (idx, row) in self.rows.iter_mut().enumerate() {
            let value = fill(idx, row);
            row.push(value);
        }
        self.columns.push(canonical);
        Ok(())
    }

    /// Add a column holding the same value in every row.
    pub fn add_constant_column(&mut self, name: &str, value: Scalar) -> Result<(), String> {
        self.add_column(name, |_, _| value.clone())
    }

    /// Copy an existing column's values under a new name, appended last.
    pub fn copy_column(&mut self, from: &str, to: &str) -> Result<(), String> {
        let idx = self
            .column_index(from)
            .ok_or_else(|| format!("unknown column {from}"))?;
        self.add_column(to, |_, row| row[idx].clone())
    }

    /// Drop the named columns where present; unknown names are ignored.
    pub fn drop_columns(&mut self, names: &[&str]) {
        let doomed: Vec<usize> = names
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect();
        if doomed.is_empty() {
            return;
        }
        let keep: Vec<usize> = (0..self.columns.len())
            .filter(|i| !doomed.contains(i))
            .collect();
        self.columns = keep.iter().map(|&i| self.columns[i].clone()).collect();
        for row in &mut self.rows {
            *row = keep.iter().map(|&i| row[i].clone()).collect();
        }
    }

    /// Project to the columns (by canonical name) that also appear in `keep`,
    /// preserving this record set's column order.
    pub fn project(&self, keep: &[String]) -> RecordSet {
        let keep_canonical: Vec<String> =
            keep.iter().map(|c| canonical_column_name(c)).collect();
        let indices: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| keep_canonical.contains(c))
            .map(|(i, _)| i)
            .collect();
        RecordSet {
            columns: indices.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        }
    }
}
