//! In-memory view of a task table.
//!
//! Cells are JSON values; `Value::Null` marks a missing cell. Every row is
//! keyed by an opaque identifier column assigned on first submission.

use serde_json::{Map, Value};

/// Generate a fresh row identifier.
pub fn new_row_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Rectangular table of JSON cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Build a table, padding or truncating rows to the column count.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Value::Null);
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Column names in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in order.
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of `name`, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Whether the table has a column called `name`.
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Position of `name`, appending an all-null column when missing.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Value::Null);
        }
        self.columns.len() - 1
    }

    /// Give every row without an identifier a new one. A missing identifier
    /// column is created as the first column. Returns how many rows changed.
    pub fn assign_ids(&mut self, id_column: &str) -> usize {
        let idx = if let Some(idx) = self.column_index(id_column) {
            idx
        } else {
            self.columns.insert(0, id_column.to_string());
            for row in &mut self.rows {
                row.insert(0, Value::Null);
            }
            0
        };

        let mut assigned = 0;
        for row in &mut self.rows {
            if is_null(&row[idx]) {
                row[idx] = Value::String(new_row_id());
                assigned += 1;
            }
        }
        assigned
    }

    /// Identifier of row `row` as text.
    pub fn row_id(&self, id_column: &str, row: usize) -> Option<String> {
        let idx = self.column_index(id_column)?;
        self.rows.get(row).and_then(|r| id_text(&r[idx]))
    }

    /// Cell at (`row_id`, `column`).
    pub fn get(&self, id_column: &str, row_id: &str, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        let row = self.find_row(id_column, row_id)?;
        Some(&self.rows[row][col])
    }

    /// Overwrite one cell, creating `column` if needed. Returns `false` when
    /// no row carries `row_id`.
    pub fn set(&mut self, id_column: &str, row_id: &str, column: &str, value: Value) -> bool {
        let Some(row) = self.find_row(id_column, row_id) else {
            return false;
        };
        let col = self.ensure_column(column);
        self.rows[row][col] = value;
        true
    }

    fn find_row(&self, id_column: &str, row_id: &str) -> Option<usize> {
        let idx = self.column_index(id_column)?;
        self.rows
            .iter()
            .position(|r| id_text(&r[idx]).as_deref() == Some(row_id))
    }

    /// Indices of rows that still need to run.
    ///
    /// With `force_rerun` every row is pending. Otherwise a row is pending when
    /// any continuation column is null for it. When a continuation column is
    /// missing altogether, or none is configured, every row is pending.
    pub fn pending_rows(&self, continue_cols: &[String], force_rerun: bool) -> Vec<usize> {
        let all = || (0..self.rows.len()).collect::<Vec<_>>();
        if force_rerun || continue_cols.is_empty() {
            return all();
        }
        let mut indices = Vec::with_capacity(continue_cols.len());
        for col in continue_cols {
            match self.column_index(col) {
                Some(idx) => indices.push(idx),
                None => return all(),
            }
        }
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| indices.iter().any(|idx| is_null(&row[*idx])))
            .map(|(i, _)| i)
            .collect()
    }

    /// Row `row` as named arguments, without the identifier column.
    pub fn row_args(&self, id_column: &str, row: usize) -> Map<String, Value> {
        self.columns
            .iter()
            .zip(&self.rows[row])
            .filter(|(name, _)| name.as_str() != id_column)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Whether a cell counts as missing. Empty strings do, since flat files
/// cannot tell them apart from nulls.
pub fn is_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ID: &str = ":uuid:";

    fn table() -> Table {
        Table::new(
            vec!["lr".into(), "done".into()],
            vec![
                vec![json!(0.1), Value::Null],
                vec![json!(0.2), json!(true)],
                vec![json!(0.3)],
            ],
        )
    }

    #[test]
    fn short_rows_are_padded() {
        let t = table();
        assert_eq!(t.rows()[2], vec![json!(0.3), Value::Null]);
    }

    #[test]
    fn ids_are_added_as_first_column() {
        let mut t = table();
        assert_eq!(t.assign_ids(ID), 3);
        assert_eq!(t.columns()[0], ID);
        let ids: Vec<_> = (0..3).map(|r| t.row_id(ID, r).unwrap()).collect();
        assert_ne!(ids[0], ids[1]);
        assert_eq!(t.assign_ids(ID), 0);
    }

    #[test]
    fn only_null_ids_are_filled() {
        let mut t = Table::new(
            vec![ID.into(), "x".into()],
            vec![vec![json!("keep"), json!(1)], vec![Value::Null, json!(2)]],
        );
        assert_eq!(t.assign_ids(ID), 1);
        assert_eq!(t.row_id(ID, 0).as_deref(), Some("keep"));
        assert!(t.row_id(ID, 1).is_some());
    }

    #[test]
    fn pending_rows_follow_continuation_columns() {
        let t = table();
        assert_eq!(t.pending_rows(&["done".into()], false), vec![0, 2]);
        assert_eq!(t.pending_rows(&["done".into()], true), vec![0, 1, 2]);
        assert_eq!(t.pending_rows(&["missing".into()], false), vec![0, 1, 2]);
        assert_eq!(t.pending_rows(&["lr".into()], false), Vec::<usize>::new());
    }

    #[test]
    fn set_creates_columns_and_rejects_unknown_rows() {
        let mut t = table();
        t.assign_ids(ID);
        let id = t.row_id(ID, 1).unwrap();
        assert!(t.set(ID, &id, "loss", json!(0.5)));
        assert_eq!(t.get(ID, &id, "loss"), Some(&json!(0.5)));
        assert_eq!(t.get(ID, &t.row_id(ID, 0).unwrap(), "loss"), Some(&Value::Null));
        assert!(!t.set(ID, "nope", "loss", json!(1)));
    }

    #[test]
    fn row_args_skip_identifier() {
        let mut t = table();
        t.assign_ids(ID);
        let args = t.row_args(ID, 0);
        assert_eq!(args.len(), 2);
        assert_eq!(args["lr"], json!(0.1));
        assert!(!args.contains_key(ID));
    }
}
