use std::fmt::Write as _;
use std::io::{self, Write};

use serde::Serialize;

use crate::bulk::{BulkSummary, bucket_label};
use crate::domain::{BulkOperation, Collection};
use crate::validate::{BATCH_EXAMPLES_SHOWN, ValidationReport, summarize_rows};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

impl OutputMode {
    pub fn is_interactive(self) -> bool {
        matches!(self, OutputMode::Interactive)
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

/// Minimal column-aligned text table.
#[derive(Debug, Clone)]
pub struct Table {
    title: Option<String>,
    headers: Vec<(String, Align)>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            title: None,
            headers: headers
                .into_iter()
                .map(|header| (header.into(), Align::Left))
                .collect(),
            rows: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn align(mut self, column: usize, align: Align) -> Self {
        if let Some(header) = self.headers.get_mut(column) {
            header.1 = align;
        }
        self
    }

    pub fn push_row<I, S>(&mut self, row: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(row.into_iter().map(Into::into).collect());
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self
            .headers
            .iter()
            .map(|(header, _)| header.chars().count())
            .collect();
        for row in &self.rows {
            for (index, cell) in row.iter().enumerate() {
                if let Some(width) = widths.get_mut(index) {
                    *width = (*width).max(cell.chars().count());
                }
            }
        }

        let mut out = String::new();
        if let Some(title) = &self.title {
            let _ = writeln!(out, "{title}");
        }
        let header_cells: Vec<String> =
            self.headers.iter().map(|(header, _)| header.clone()).collect();
        self.write_line(&mut out, &header_cells, &widths);
        let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
        let _ = writeln!(out, "{}", rule.join("  "));
        for row in &self.rows {
            self.write_line(&mut out, row, &widths);
        }
        out
    }

    fn write_line(&self, out: &mut String, cells: &[String], widths: &[usize]) {
        let mut line = String::new();
        for (index, width) in widths.iter().enumerate() {
            let cell = cells.get(index).map(String::as_str).unwrap_or("");
            let pad = width.saturating_sub(cell.chars().count());
            if index > 0 {
                line.push_str("  ");
            }
            match self.headers[index].1 {
                Align::Left => {
                    line.push_str(cell);
                    line.push_str(&" ".repeat(pad));
                }
                Align::Right => {
                    line.push_str(&" ".repeat(pad));
                    line.push_str(cell);
                }
            }
        }
        let _ = writeln!(out, "{}", line.trim_end());
    }
}

pub fn collections_table(collections: &[Collection]) -> Table {
    let mut table = Table::new(["ID", "Name", "Public", "Pinned", "Locked", "DOI"])
        .align(0, Align::Right);
    for collection in collections {
        table.push_row([
            collection.id.to_string(),
            collection.name.clone(),
            title_bool(collection.public),
            title_bool(collection.pinned),
            title_bool(collection.locked),
            collection.doi.clone().unwrap_or_default(),
        ]);
    }
    table
}

pub fn bulk_summary_table(summary: &BulkSummary, operation: BulkOperation) -> Table {
    let mut table = Table::new(["Result", "ISIC ID"]);
    for (bucket, ids) in summary.buckets() {
        let label = bucket_label(bucket, operation);
        for id in ids {
            table.push_row([label.clone(), id.clone()]);
        }
    }
    table
}

pub fn batch_problems_table(report: &ValidationReport) -> Option<Table> {
    if report.batch_problems.is_empty() {
        return None;
    }
    let mut table = Table::new(["Error", "Num instances", "Examples"])
        .with_title("Batch Level Errors Found")
        .align(1, Align::Right);
    for problem in &report.batch_problems {
        let examples: Vec<&str> = problem
            .examples
            .iter()
            .take(BATCH_EXAMPLES_SHOWN)
            .map(String::as_str)
            .collect();
        table.push_row([
            problem.message.clone(),
            problem.count.to_string(),
            examples.join(", "),
        ]);
    }
    Some(table)
}

/// Row problems sorted by (field, message). The field name is printed only
/// on the first line of its group.
pub fn row_problems_table(report: &ValidationReport) -> Option<Table> {
    if report.row_problems.is_empty() {
        return None;
    }
    let mut table = Table::new(["Field", "Error", "Num instances", "Rows"])
        .with_title("Row Level Errors Found")
        .align(0, Align::Right)
        .align(2, Align::Right)
        .align(3, Align::Right);
    let mut last_field: Option<&str> = None;
    for ((field, message), rows) in &report.row_problems {
        let shown = if last_field == Some(field.as_str()) {
            String::new()
        } else {
            field.clone()
        };
        last_field = Some(field.as_str());
        table.push_row([
            shown,
            message.clone(),
            rows.len().to_string(),
            summarize_rows(rows),
        ]);
    }
    Some(table)
}

pub fn unrecognized_columns_table(report: &ValidationReport) -> Option<Table> {
    if report.unrecognized_columns.is_empty() {
        return None;
    }
    let mut table = Table::new(["Field"]).with_title("Unrecognized Fields");
    for column in &report.unrecognized_columns {
        table.push_row([column.clone()]);
    }
    Some(table)
}

fn title_bool(value: bool) -> String {
    let text = if value { "True" } else { "False" };
    text.to_string()
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;
    let value = bytes as f64;
    if value >= TB {
        format!("{:.1} TB", value / TB)
    } else if value >= GB {
        format!("{:.1} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}

pub fn intcomma(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_numbers() {
        assert_eq!(intcomma(0), "0");
        assert_eq!(intcomma(1234567), "1,234,567");
        assert_eq!(intcomma(100), "100");
        assert_eq!(bytes_to_human(512), "512 B");
        assert_eq!(bytes_to_human(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn tables_align_columns() {
        let mut table = Table::new(["ID", "Name"]).align(0, Align::Right);
        table.push_row(["5", "foo"]);
        table.push_row(["12", "a longer name"]);
        let rendered = table.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "ID  Name");
        assert_eq!(lines[2], " 5  foo");
        assert_eq!(lines[3], "12  a longer name");
    }
}
