//! Time-indexed table of named numeric columns

use crate::types::{RoiError, RoiResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One row: a label (image id or bucket name), its time and one value per column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub label: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub values: Vec<Option<f64>>,
}

/// Table whose column set is fixed before any row is added
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesTable {
    columns: Vec<String>,
    rows: Vec<TableRow>,
    /// Variable name -> unit string
    pub units: BTreeMap<String, String>,
    /// Free-form provenance attributes
    pub attributes: BTreeMap<String, String>,
}

impl TimeSeriesTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            ..Self::default()
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a row; its width must match the column set
    pub fn push_row(
        &mut self,
        label: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
        values: Vec<Option<f64>>,
    ) -> RoiResult<()> {
        if values.len() != self.columns.len() {
            return Err(RoiError::Processing(format!(
                "Row has {} values but the table has {} columns",
                values.len(),
                self.columns.len()
            )));
        }
        self.rows.push(TableRow {
            label: label.into(),
            timestamp,
            values,
        });
        Ok(())
    }

    /// Append a row with every column missing
    pub fn push_missing(&mut self, label: impl Into<String>, timestamp: Option<DateTime<Utc>>) {
        let values = vec![None; self.columns.len()];
        self.rows.push(TableRow {
            label: label.into(),
            timestamp,
            values,
        });
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column in row order
    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let index = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row.values[index]).collect())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.values[index])
    }

    pub fn timestamps(&self) -> Vec<Option<DateTime<Utc>>> {
        self.rows.iter().map(|row| row.timestamp).collect()
    }

    /// True when every row carries a timestamp
    pub fn is_fully_dated(&self) -> bool {
        self.rows.iter().all(|row| row.timestamp.is_some())
    }

    /// Stable ascending sort by timestamp; undated rows go last
    pub fn sort_by_time(&mut self) {
        self.rows.sort_by(|a, b| match (a.timestamp, b.timestamp) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }

    /// Write as CSV: `label,timestamp,<columns...>`, missing values left empty
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> RoiResult<()> {
        log::debug!("Writing table to: {}", path.as_ref().display());
        let mut writer = csv::Writer::from_path(path.as_ref())?;

        let mut header = vec!["label".to_string(), "timestamp".to_string()];
        header.extend(self.columns.iter().cloned());
        writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![
                row.label.clone(),
                row.timestamp
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default(),
            ];
            record.extend(row.values.iter().map(|v| v.map(|x| x.to_string()).unwrap_or_default()));
            writer.write_record(&record)?;
        }

        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_row_width_is_enforced() {
        let mut table = TimeSeriesTable::new(vec!["a".into(), "b".into()]);
        assert!(table.push_row("r", None, vec![Some(1.0)]).is_err());
        table.push_missing("m", None);
        assert_eq!(table.column("b").unwrap(), vec![None]);
    }

    #[test]
    fn test_sort_places_undated_rows_last() {
        let mut table = TimeSeriesTable::new(vec!["v".into()]);
        table.push_row("2003", at(2003), vec![Some(3.0)]).unwrap();
        table.push_row("none", None, vec![None]).unwrap();
        table.push_row("2001", at(2001), vec![Some(1.0)]).unwrap();
        table.sort_by_time();
        let labels: Vec<&str> = table.rows().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["2001", "2003", "none"]);
        assert!(!table.is_fully_dated());
    }

    #[test]
    fn test_csv_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.csv");
        let mut table = TimeSeriesTable::new(vec!["pr_sum".into()]);
        table.push_row("2020-01", at(2020), vec![Some(30.0)]).unwrap();
        table.push_missing("2020-02", at(2020));
        table.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "label,timestamp,pr_sum");
        assert_eq!(lines[1], "2020-01,2020-01-01T00:00:00Z,30");
        assert_eq!(lines[2], "2020-02,2020-01-01T00:00:00Z,");
    }
}
