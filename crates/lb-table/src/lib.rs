#![forbid(unsafe_code)]

use std::collections::HashMap;

use lb_types::Scalar;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TableError {
    #[error("dataset {dataset:?} has no column named {column:?}")]
    UnknownColumn { dataset: String, column: String },
    #[error("column {0:?} appears more than once in the schema")]
    DuplicateColumn(String),
    #[error("row {row} has {actual} values but the schema has {expected} columns")]
    RowWidthMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("record {row} does not match the dataset schema: {detail}")]
    SchemaMismatch { row: usize, detail: String },
}

// ── Record ─────────────────────────────────────────────────────────────

/// Ordered mapping from column name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Scalar)>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Builder form of [`Record::insert`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set a field, replacing the value in place if the name already exists.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<N: Into<String>, V: Into<Scalar>> FromIterator<(N, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

// ── Schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Schema {
    pub fn new<I, S>(columns: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Self::default();
        for column in columns {
            out.push(column.into())?;
        }
        Ok(out)
    }

    fn push(&mut self, column: String) -> Result<(), TableError> {
        if self.positions.contains_key(&column) {
            return Err(TableError::DuplicateColumn(column));
        }
        self.positions.insert(column.clone(), self.columns.len());
        self.columns.push(column);
        Ok(())
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.positions.contains_key(column)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

// ── Dataset ────────────────────────────────────────────────────────────

/// Named, ordered sequence of rows sharing one schema.
///
/// Rows are stored positionally against the schema. A `Dataset` is never
/// mutated after construction, so it can be shared freely across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    name: String,
    schema: Schema,
    rows: Vec<Vec<Scalar>>,
}

impl Dataset {
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        rows: Vec<Vec<Scalar>>,
    ) -> Result<Self, TableError> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != schema.len() {
                return Err(TableError::RowWidthMismatch {
                    row: idx,
                    expected: schema.len(),
                    actual: row.len(),
                });
            }
        }
        Ok(Self {
            name: name.into(),
            schema,
            rows,
        })
    }

    #[must_use]
    pub fn empty(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            rows: Vec::new(),
        }
    }

    /// Build a dataset from records. The first record fixes the column order;
    /// every other record must carry exactly the same column set.
    pub fn from_records(name: impl Into<String>, records: &[Record]) -> Result<Self, TableError> {
        let Some(first) = records.first() else {
            return Ok(Self::empty(name, Schema::default()));
        };
        let schema = Schema::new(first.names())?;
        Self::from_records_with_schema(name, schema, records)
    }

    pub fn from_records_with_schema(
        name: impl Into<String>,
        schema: Schema,
        records: &[Record],
    ) -> Result<Self, TableError> {
        let mut rows = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            if record.len() != schema.len() {
                return Err(TableError::SchemaMismatch {
                    row: idx,
                    detail: format!(
                        "expected {} fields, found {}",
                        schema.len(),
                        record.len()
                    ),
                });
            }
            let mut row = Vec::with_capacity(schema.len());
            for column in schema.columns() {
                let value = record.get(column).ok_or_else(|| TableError::SchemaMismatch {
                    row: idx,
                    detail: format!("missing field {column:?}"),
                })?;
                row.push(value.clone());
            }
            rows.push(row);
        }
        Self::new(name, schema, rows)
    }

    /// Stack datasets row-wise under the union of their schemas.
    ///
    /// Columns keep first-seen order; a part lacking a column contributes
    /// `Null` for it.
    pub fn concat(name: impl Into<String>, parts: &[&Self]) -> Result<Self, TableError> {
        let mut schema = Schema::default();
        for part in parts {
            for column in part.schema.columns() {
                if !schema.contains(column) {
                    schema.push(column.clone())?;
                }
            }
        }

        let total = parts.iter().map(|p| p.len()).sum();
        let mut rows = Vec::with_capacity(total);
        for part in parts {
            let mapping: Vec<Option<usize>> = schema
                .columns()
                .iter()
                .map(|column| part.schema.position(column))
                .collect();
            for row in &part.rows {
                rows.push(
                    mapping
                        .iter()
                        .map(|pos| pos.map_or(Scalar::Null, |p| row[p].clone()))
                        .collect(),
                );
            }
        }
        Self::new(name, schema, rows)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Scalar>] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of `column`, or `UnknownColumn` naming this dataset.
    pub fn column_position(&self, column: &str) -> Result<usize, TableError> {
        self.schema
            .position(column)
            .ok_or_else(|| TableError::UnknownColumn {
                dataset: self.name.clone(),
                column: column.to_owned(),
            })
    }

    pub fn column_values(&self, column: &str) -> Result<impl Iterator<Item = &Scalar>, TableError> {
        let pos = self.column_position(column)?;
        Ok(self.rows.iter().map(move |row| &row[pos]))
    }

    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<&Scalar> {
        let pos = self.schema.position(column)?;
        self.rows.get(row).map(|r| &r[pos])
    }

    /// Rename one column, keeping its position. The new name must not
    /// already be taken.
    pub fn rename_column(mut self, from: &str, to: impl Into<String>) -> Result<Self, TableError> {
        let pos = self.column_position(from)?;
        let mut columns = self.schema.columns().to_vec();
        columns[pos] = to.into();
        self.schema = Schema::new(columns)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use lb_types::Scalar;

    use super::{Dataset, Record, Schema, TableError};

    fn season_rushing() -> Dataset {
        Dataset::from_records(
            "season_rushing",
            &[
                Record::new().with("name", "Adams").with("yds", 100).with("year", 2020),
                Record::new().with("name", "Adams").with("yds", 50).with("year", 2021),
                Record::new().with("name", "Baker").with("yds", 300).with("year", 2020),
            ],
        )
        .expect("dataset")
    }

    #[test]
    fn record_insert_replaces_existing_field_in_place() {
        let mut record = Record::new().with("name", "Adams").with("td", 1);
        record.insert("td", 2);
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("td"), Some(&Scalar::Int64(2)));
        assert_eq!(record.names().collect::<Vec<_>>(), vec!["name", "td"]);
    }

    #[test]
    fn schema_rejects_duplicate_columns() {
        let err = Schema::new(["name", "yds", "name"]).expect_err("duplicate");
        assert_eq!(err, TableError::DuplicateColumn("name".to_owned()));
    }

    #[test]
    fn from_records_preserves_first_record_column_order() {
        let ds = season_rushing();
        assert_eq!(ds.schema().columns(), &["name", "yds", "year"]);
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.value(2, "yds"), Some(&Scalar::Int64(300)));
    }

    #[test]
    fn from_records_accepts_reordered_fields() {
        let ds = Dataset::from_records(
            "mixed",
            &[
                Record::new().with("a", 1).with("b", 2),
                Record::new().with("b", 4).with("a", 3),
            ],
        )
        .expect("dataset");
        assert_eq!(ds.rows()[1], vec![Scalar::Int64(3), Scalar::Int64(4)]);
    }

    #[test]
    fn from_records_rejects_missing_field() {
        let err = Dataset::from_records(
            "broken",
            &[
                Record::new().with("a", 1).with("b", 2),
                Record::new().with("a", 3).with("c", 4),
            ],
        )
        .expect_err("schema mismatch");
        assert!(matches!(err, TableError::SchemaMismatch { row: 1, .. }));
    }

    #[test]
    fn new_rejects_ragged_rows() {
        let schema = Schema::new(["name", "yds"]).expect("schema");
        let err = Dataset::new("ragged", schema, vec![vec![Scalar::from("A")]])
            .expect_err("ragged");
        assert_eq!(
            err,
            TableError::RowWidthMismatch {
                row: 0,
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn unknown_column_names_dataset_and_column() {
        let ds = season_rushing();
        let err = ds.column_position("sacks").expect_err("unknown");
        assert_eq!(
            err.to_string(),
            "dataset \"season_rushing\" has no column named \"sacks\""
        );
    }

    #[test]
    fn concat_unions_columns_and_fills_nulls() {
        let y2020 = Dataset::from_records(
            "2020",
            &[Record::new().with("name", "Adams").with("yds", 10)],
        )
        .expect("2020");
        let y2021 = Dataset::from_records(
            "2021",
            &[Record::new().with("name", "Baker").with("long", 45)],
        )
        .expect("2021");

        let all = Dataset::concat("all", &[&y2020, &y2021]).expect("concat");
        assert_eq!(all.schema().columns(), &["name", "yds", "long"]);
        assert_eq!(all.value(0, "long"), Some(&Scalar::Null));
        assert_eq!(all.value(1, "yds"), Some(&Scalar::Null));
        assert_eq!(all.value(1, "long"), Some(&Scalar::Int64(45)));
    }

    #[test]
    fn rename_column_keeps_position_and_values() {
        let ds = season_rushing().rename_column("yds", "rush_yds").expect("rename");
        assert_eq!(ds.schema().columns(), &["name", "rush_yds", "year"]);
        assert_eq!(ds.value(2, "rush_yds"), Some(&Scalar::Int64(300)));
        assert_eq!(ds.value(2, "yds"), None);
    }

    #[test]
    fn rename_column_rejects_unknown_and_taken_names() {
        assert!(matches!(
            season_rushing().rename_column("td", "rush_td"),
            Err(TableError::UnknownColumn { .. })
        ));
        assert_eq!(
            season_rushing().rename_column("yds", "year").expect_err("taken"),
            TableError::DuplicateColumn("year".to_owned())
        );
    }
}
