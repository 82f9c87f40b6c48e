use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::ArchiveError;
use crate::progress::ProgressSink;
use crate::schema::{self, RowIdentity};

/// Rows are numbered against the file, so the first data row is 2.
const FIRST_DATA_ROW: usize = 2;
pub const BATCH_EXAMPLES_SHOWN: usize = 3;
pub const ROW_NUMBERS_SHOWN: usize = 5;

/// (column, message) -> row numbers in the order they were seen.
pub type RowProblems = BTreeMap<(String, String), Vec<usize>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProblem {
    pub message: String,
    pub count: usize,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub rows_checked: usize,
    pub row_problems: RowProblems,
    pub batch_problems: Vec<BatchProblem>,
    pub unrecognized_columns: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.row_problems.is_empty() && self.batch_problems.is_empty()
    }

    pub fn into_result(self) -> Result<Self, ArchiveError> {
        if self.is_valid() {
            return Ok(self);
        }
        Err(ArchiveError::ValidationFailed {
            row_problems: self.row_problems.len(),
            batch_problems: self.batch_problems.len(),
        })
    }
}

/// Streams the file twice: once to size the progress bar, once to validate.
pub fn validate_path(
    path: &Path,
    progress: &dyn ProgressSink,
) -> Result<ValidationReport, ArchiveError> {
    let unreadable =
        |err: io::Error| ArchiveError::InputNotReadable(format!("{}: {err}", path.display()));
    let mut reader = BufReader::new(File::open(path).map_err(unreadable)?);
    let lines = count_lines(&mut reader).map_err(unreadable)?;
    reader.seek(SeekFrom::Start(0)).map_err(unreadable)?;

    progress.start("Validating metadata", lines);
    let report = validate_reader(reader, progress);
    progress.finish();
    report
}

fn count_lines<R: BufRead>(reader: &mut R) -> io::Result<u64> {
    let mut lines = 0;
    loop {
        let buffer = reader.fill_buf()?;
        if buffer.is_empty() {
            return Ok(lines);
        }
        lines += buffer.iter().filter(|byte| **byte == b'\n').count() as u64;
        let consumed = buffer.len();
        reader.consume(consumed);
    }
}

/// Validates a metadata CSV without modifying it.
pub fn validate_reader<R: Read>(
    reader: R,
    progress: &dyn ProgressSink,
) -> Result<ValidationReport, ArchiveError> {
    let mut csv = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(reader);
    let headers: Vec<String> = csv
        .headers()
        .map_err(|err| ArchiveError::Csv(err.to_string()))?
        .iter()
        .map(|header| header.trim_start_matches('\u{feff}').to_string())
        .collect();
    if headers.iter().all(|header| header.is_empty()) {
        return Err(ArchiveError::EmptyCsv);
    }

    let mut row_problems = RowProblems::new();
    let mut identities = Vec::new();
    let mut rows_checked = 0;

    for (index, record) in csv.records().enumerate() {
        let row_number = index + FIRST_DATA_ROW;
        let record = record.map_err(|err| ArchiveError::Csv(err.to_string()))?;
        let row: HashMap<&str, &str> = headers
            .iter()
            .map(String::as_str)
            .zip(record.iter())
            .collect();

        let identity = RowIdentity {
            patient_id: non_blank(&row, "patient_id"),
            lesion_id: non_blank(&row, "lesion_id"),
        };
        if identity.patient_id.is_some() || identity.lesion_id.is_some() {
            identities.push(identity);
        }

        for problem in schema::validate_row(&row) {
            row_problems
                .entry((problem.column, problem.message))
                .or_default()
                .push(row_number);
        }
        rows_checked += 1;
        progress.advance(1);
    }

    let batch_problems = schema::validate_batch(&identities)
        .into_iter()
        .map(|fault| BatchProblem {
            message: fault.message,
            count: fault.examples.len(),
            examples: fault.examples,
        })
        .collect();

    tracing::debug!(
        rows_checked,
        row_problems = row_problems.len(),
        "metadata validation finished"
    );

    Ok(ValidationReport {
        rows_checked,
        row_problems,
        batch_problems,
        unrecognized_columns: schema::unstructured_columns(headers.iter().map(String::as_str)),
    })
}

fn non_blank(row: &HashMap<&str, &str>, column: &str) -> Option<String> {
    row.get(column)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Row numbers for display: the first few, then ", etc".
pub fn summarize_rows(rows: &[usize]) -> String {
    let shown = rows
        .iter()
        .take(ROW_NUMBERS_SHOWN)
        .map(|row| row.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if rows.len() > ROW_NUMBERS_SHOWN {
        format!("{shown}, etc")
    } else {
        shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;

    #[test]
    fn line_count_spans_buffer_refills() {
        let csv = "a\n".repeat(10_000);
        let mut reader = BufReader::with_capacity(64, csv.as_bytes());
        assert_eq!(count_lines(&mut reader).unwrap(), 10_000);
    }

    #[test]
    fn row_numbers_start_after_header() {
        let csv = "diagnosis,sex\nnevus,male\nnevus,bar\n";
        let report = validate_reader(csv.as_bytes(), &SilentProgress).unwrap();
        let key = (
            "sex".to_string(),
            "Input should be 'male' or 'female'".to_string(),
        );
        assert_eq!(report.row_problems.get(&key), Some(&vec![3]));
    }

    #[test]
    fn summarizes_long_row_lists() {
        assert_eq!(summarize_rows(&[2, 3]), "2, 3");
        assert_eq!(summarize_rows(&[2, 3, 4, 5, 6, 7]), "2, 3, 4, 5, 6, etc");
    }
}
