//! Forward-only result cursors.
//!
//! A [`Rows`] owns a fully materialized result. Cells stay in wire text form
//! until `next` decodes the ones the caller asks for.

use std::sync::Arc;

use bytes::Bytes;
use once_cell::unsync::OnceCell;
use smallvec::smallvec;
use tracing::trace;

use crate::error::{DriverError, Result};
use crate::pg::protocol::DataRow;
use crate::pg::session::QueryResult;
use crate::pg::types::{decode, Oid, Value};
use crate::scan::FromValue;

/// Name of the single column a LISTEN channel's cursor exposes.
pub const NOTIFY_COLUMN: &str = "NOTIFY payload";

/// A result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

/// Cursor over the rows of one result.
#[derive(Debug)]
pub struct Rows {
    columns: Arc<[Column]>,
    rows: Vec<DataRow>,
    current: usize,
    names: OnceCell<Vec<String>>,
}

impl Rows {
    pub(crate) fn from_result(result: QueryResult) -> Self {
        let columns = result
            .columns
            .into_iter()
            .map(|field| Column {
                name: field.name,
                type_oid: field.type_oid,
            })
            .collect();
        Self::new(columns, result.rows)
    }

    /// A one-row, one-column cursor holding a notification payload.
    pub(crate) fn notification(payload: String) -> Self {
        let column = Column {
            name: NOTIFY_COLUMN.to_string(),
            type_oid: Oid::TEXT,
        };
        Self::new(
            Arc::from(vec![column]),
            vec![smallvec![Some(Bytes::from(payload))]],
        )
    }

    fn new(columns: Arc<[Column]>, rows: Vec<DataRow>) -> Self {
        Self {
            columns,
            rows,
            current: 0,
            names: OnceCell::new(),
        }
    }

    /// Column names, in result order.
    pub fn columns(&self) -> &[String] {
        self.names
            .get_or_init(|| self.columns.iter().map(|c| c.name.clone()).collect())
    }

    /// Column names together with their type OIDs.
    pub fn descriptors(&self) -> &[Column] {
        &self.columns
    }

    /// Total number of rows in the result.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Decode the next row into `dest`, one value per leading column.
    ///
    /// Returns `Ok(false)` once the rows are exhausted, on every call after
    /// that too. The cursor moves past a row even when decoding it fails.
    pub fn next(&mut self, dest: &mut [Value]) -> Result<bool> {
        let Some(row) = self.rows.get(self.current) else {
            return Ok(false);
        };
        if dest.len() > self.columns.len() {
            return Err(DriverError::ColumnCountMismatch {
                expected: self.columns.len(),
                got: dest.len(),
            });
        }
        self.current += 1;

        for (i, slot) in dest.iter_mut().enumerate() {
            let cell = row.get(i).and_then(|cell| cell.as_deref());
            *slot = decode(self.columns[i].type_oid, cell)?;
        }
        Ok(true)
    }

    /// Decode the whole next row.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let mut values = vec![Value::Null; self.columns.len()];
        if !self.next(&mut values)? {
            return Ok(None);
        }
        Ok(Some(Row {
            columns: Arc::clone(&self.columns),
            values,
        }))
    }

    /// Release the result.
    pub fn close(self) {
        trace!(
            rows = self.rows.len(),
            unread = self.rows.len().saturating_sub(self.current),
            "rows closed"
        );
    }
}

impl Iterator for Rows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// One decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Convert the value at `idx`.
    pub fn get<T: FromValue>(&self, idx: usize) -> Result<T> {
        let value = self.values.get(idx).ok_or_else(|| DriverError::ColumnCountMismatch {
            expected: self.values.len(),
            got: idx + 1,
        })?;
        T::from_value(value)
    }

    /// Convert the value of the first column called `name`.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| DriverError::ColumnNotFound(name.to_string()))?;
        self.get(idx)
    }
}
