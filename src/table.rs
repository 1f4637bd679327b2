// Plain-text tables for terminal output. Records are serialized to JSON
// first and the requested keys are picked out of the object, so any
// model type can be shown without a per-type renderer.

use crossterm::style::Stylize;
use serde::Serialize;
use serde_json::Value;
use std::io::IsTerminal;

/// A titled table of string cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    title: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Render a JSON value as a table cell. Strings print without quotes,
/// null prints as `None`.
pub fn cell(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Table {
    pub fn new(title: impl Into<String>, headers: &[&str]) -> Self {
        Table {
            title: title.into(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One row per record; `columns` maps JSON keys to headers.
    pub fn from_records<T: Serialize>(
        title: impl Into<String>,
        columns: &[(&str, &str)],
        records: &[T],
    ) -> serde_json::Result<Self> {
        let headers: Vec<&str> = columns.iter().map(|(_, h)| *h).collect();
        let mut table = Table::new(title, &headers);
        for record in records {
            let value = serde_json::to_value(record)?;
            table.add_row(
                columns
                    .iter()
                    .map(|(key, _)| cell(value.get(*key).unwrap_or(&Value::Null)))
                    .collect(),
            );
        }
        Ok(table)
    }

    /// Two-column key/value view of a single record. Nested objects are
    /// skipped.
    pub fn key_value<T: Serialize>(title: impl Into<String>, record: &T) -> serde_json::Result<Self> {
        let mut table = Table::new(title, &["Key", "Value"]);
        if let Value::Object(map) = serde_json::to_value(record)? {
            for (key, value) in map {
                if value.is_object() {
                    continue;
                }
                table.add_row(vec![key, cell(&value)]);
            }
        }
        Ok(table)
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (i, c) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(c.chars().count());
                }
            }
        }
        widths
    }

    fn line(cells: &[String], widths: &[usize]) -> String {
        cells
            .iter()
            .zip(widths)
            .map(|(c, w)| format!("{c:<w$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    }

    /// Render without terminal styling.
    pub fn render(&self) -> String {
        self.render_with(false)
    }

    fn render_with(&self, styled: bool) -> String {
        let widths = self.widths();
        let header = Self::line(&self.headers, &widths);
        let rule = widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("  ");

        let mut out = String::new();
        if styled {
            out.push_str(&format!("{}\n", self.title.as_str().italic()));
            out.push_str(&format!("{}\n", header.as_str().bold()));
        } else {
            out.push_str(&format!("{}\n{}\n", self.title, header));
        }
        out.push_str(&rule);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&Self::line(row, &widths));
            out.push('\n');
        }
        out
    }

    /// Print to stdout, styled when stdout is a terminal.
    pub fn print(&self) {
        print!("{}", self.render_with(std::io::stdout().is_terminal()));
    }
}
