#![forbid(unsafe_code)]

use std::{fmt::Write as _, fs, path::Path};

use csv::{ReaderBuilder, WriterBuilder};
use lb_groupby::Leaderboard;
use lb_table::{Dataset, Schema, TableError};
use lb_types::Scalar;
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Parse CSV text with a header row into a dataset called `name`.
pub fn read_csv_str(name: &str, input: &str) -> Result<Dataset, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned().map_err(IoError::from)?;
    if headers.is_empty() || headers.iter().all(str::is_empty) {
        return Err(IoError::MissingHeaders);
    }
    let schema = Schema::new(headers.iter())?;

    let row_hint = input.len() / (schema.len() * 8).max(1);
    let mut rows = Vec::with_capacity(row_hint);
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(parse_scalar).collect::<Vec<_>>());
    }

    Ok(Dataset::new(name, schema, rows)?)
}

pub fn read_csv_path(name: &str, path: impl AsRef<Path>) -> Result<Dataset, IoError> {
    let input = fs::read_to_string(path)?;
    read_csv_str(name, &input)
}

/// Interpret one CSV cell.
///
/// Empty cells and the `-`/`--` placeholders are null. Digit groups such as
/// `1,234` are accepted for numbers.
#[must_use]
pub fn parse_scalar(field: &str) -> Scalar {
    let trimmed = field.trim();
    if matches!(trimmed, "" | "-" | "--") {
        return Scalar::Null;
    }

    let numeric = strip_digit_groups(trimmed);
    let candidate = numeric.as_deref().unwrap_or(trimmed);
    if let Ok(value) = candidate.parse::<i64>() {
        return Scalar::Int64(value);
    }
    // `f64::from_str` also accepts "nan", "inf" and overflowing exponents.
    if let Ok(value) = candidate.parse::<f64>()
        && value.is_finite()
    {
        return Scalar::Float64(value);
    }

    Scalar::Utf8(trimmed.to_owned())
}

/// `1,234` or `-12,345.5`: one to three leading digits, then groups of exactly
/// three. Anything else with a comma stays text.
fn strip_digit_groups(cell: &str) -> Option<String> {
    if !cell.contains(',') {
        return None;
    }
    let unsigned = cell.strip_prefix(['+', '-']).unwrap_or(cell);
    let (whole, fraction) = match unsigned.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (unsigned, None),
    };
    let mut groups = whole.split(',');
    let lead_ok = groups
        .next()
        .is_some_and(|lead| (1..=3).contains(&lead.len()) && lead.bytes().all(|b| b.is_ascii_digit()));
    let rest_ok = groups.all(|group| group.len() == 3 && group.bytes().all(|b| b.is_ascii_digit()));
    let fraction_ok =
        fraction.is_none_or(|f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()));
    (lead_ok && rest_ok && fraction_ok).then(|| cell.replace(',', ""))
}

/// Text for one output cell. Whole floats keep a `.0` so a float column
/// never reads as integers.
fn cell_text(scalar: &Scalar) -> String {
    match scalar {
        Scalar::Float64(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 => {
            format!("{v:.1}")
        }
        other => other.to_string(),
    }
}

/// Render as CSV with a leading `rank` column.
pub fn write_leaderboard_csv(board: &Leaderboard) -> Result<String, IoError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    let mut header = Vec::with_capacity(board.columns().len() + 1);
    header.push("rank");
    header.extend(board.columns().iter().map(String::as_str));
    writer.write_record(&header)?;

    for row in board.rows() {
        let mut fields = Vec::with_capacity(header.len());
        fields.push(row.rank().to_string());
        fields.extend(
            board
                .columns()
                .iter()
                .map(|column| row.get(column).map_or_else(String::new, cell_text)),
        );
        writer.write_record(&fields)?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

fn scalar_to_json(scalar: &Scalar) -> Value {
    match scalar {
        Scalar::Null => Value::Null,
        Scalar::Int64(v) => Value::from(*v),
        Scalar::Float64(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        Scalar::Utf8(v) => Value::String(v.clone()),
    }
}

/// Array of row objects, `rank` first, with native JSON numbers and nulls.
#[must_use]
pub fn leaderboard_to_json(board: &Leaderboard) -> Value {
    let rows = board
        .rows()
        .iter()
        .map(|row| {
            let mut object = Map::new();
            object.insert("rank".to_owned(), Value::from(row.rank()));
            for column in board.columns() {
                let value = row.get(column).map_or(Value::Null, scalar_to_json);
                object.insert(column.clone(), value);
            }
            Value::Object(object)
        })
        .collect();
    Value::Array(rows)
}

/// Plain-text table for terminals. Numeric columns are right-aligned.
#[must_use]
pub fn render_table(board: &Leaderboard) -> String {
    let mut header = vec!["rank".to_owned()];
    header.extend(board.columns().iter().cloned());

    let cells: Vec<Vec<String>> = board
        .rows()
        .iter()
        .map(|row| {
            let mut line = vec![row.rank().to_string()];
            line.extend(
                board
                    .columns()
                    .iter()
                    .map(|column| row.get(column).map_or_else(String::new, cell_text)),
            );
            line
        })
        .collect();

    let mut right_align = vec![true];
    right_align.extend(
        board
            .columns()
            .iter()
            .map(|column| board.column_values(column).any(Scalar::is_numeric)),
    );

    let widths: Vec<usize> = header
        .iter()
        .enumerate()
        .map(|(idx, title)| {
            cells
                .iter()
                .map(|line| line[idx].chars().count())
                .chain(std::iter::once(title.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    write_line(&mut out, &header, &widths, &right_align);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    write_line(&mut out, &rule, &widths, &right_align);
    for line in &cells {
        write_line(&mut out, line, &widths, &right_align);
    }
    out
}

fn write_line(out: &mut String, cells: &[String], widths: &[usize], right_align: &[bool]) {
    let mut first = true;
    for ((cell, width), right) in cells.iter().zip(widths).zip(right_align) {
        if !first {
            out.push_str("  ");
        }
        first = false;
        // Writing into a String cannot fail.
        let _ = if *right {
            write!(out, "{cell:>width$}")
        } else {
            write!(out, "{cell:<width$}")
        };
    }
    let trimmed_len = out.trim_end_matches(' ').len();
    out.truncate(trimmed_len);
    out.push('\n');
}
