#![forbid(unsafe_code)]

//! Leaderboard reports: named aggregation specs over named datasets.

mod catalog;
mod source;

use std::path::PathBuf;

use lb_groupby::{AggregateError, AggregationSpec, Leaderboard, aggregate};
use lb_join::{JoinError, JoinSpec, join};
use lb_table::{Dataset, TableError};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use catalog::{CatalogError, ReportCatalog};
pub use source::{CsvDirectorySource, DatasetSource, InMemorySource, SourceError};

/// Where a report's input rows come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportSource {
    Dataset {
        dataset: String,
    },
    /// Two datasets joined before aggregation.
    Join {
        left: String,
        right: String,
        join: JoinSpec,
    },
    /// Datasets stacked row-wise under the union of their columns, so a
    /// group present in any part shows up in the leaderboard.
    Stack { parts: Vec<StackPart> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackPart {
    pub dataset: String,
    /// Applied in order before stacking.
    #[serde(default)]
    pub rename: Vec<ColumnRename>,
}

impl StackPart {
    #[must_use]
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            rename: Vec::new(),
        }
    }

    #[must_use]
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rename.push(ColumnRename {
            from: from.into(),
            to: to.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSpec {
    pub name: String,
    pub title: String,
    pub source: ReportSource,
    pub aggregation: AggregationSpec,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no report named {0:?}")]
    UnknownReport(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

fn load_input(source: &ReportSource, datasets: &dyn DatasetSource) -> Result<Dataset, ReportError> {
    match source {
        ReportSource::Dataset { dataset } => Ok(datasets.fetch(dataset)?),
        ReportSource::Join {
            left,
            right,
            join: spec,
        } => {
            let left = datasets.fetch(left)?;
            let right = datasets.fetch(right)?;
            Ok(join(&left, &right, spec)?)
        }
        ReportSource::Stack { parts } => {
            let mut stacked = Vec::with_capacity(parts.len());
            for part in parts {
                let mut dataset = datasets.fetch(&part.dataset)?;
                for ColumnRename { from, to } in &part.rename {
                    dataset = dataset.rename_column(from, to.as_str())?;
                }
                stacked.push(dataset);
            }
            let name = parts
                .iter()
                .map(|p| p.dataset.as_str())
                .collect::<Vec<_>>()
                .join("+");
            Ok(Dataset::concat(name, &stacked.iter().collect::<Vec<_>>())?)
        }
    }
}

pub fn run_report(
    report: &ReportSpec,
    datasets: &dyn DatasetSource,
) -> Result<Leaderboard, ReportError> {
    let input = load_input(&report.source, datasets)?;
    let board = aggregate(&input, &report.aggregation)?;
    info!(
        "report {}: {} input rows -> {} leaderboard rows",
        report.name,
        input.len(),
        board.len()
    );
    Ok(board)
}

/// Run `report` with its row limit replaced by `limit`.
pub fn run_report_with_limit(
    report: &ReportSpec,
    datasets: &dyn DatasetSource,
    limit: Option<usize>,
) -> Result<Leaderboard, ReportError> {
    let mut report = report.clone();
    report.aggregation.limit = limit;
    run_report(&report, datasets)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Directory holding `<dataset>.csv` files or `<dataset>/` season folders.
    pub data_dir: PathBuf,
    /// Extra report definitions merged over the built-in catalog.
    pub reports_path: Option<PathBuf>,
    pub limit_override: Option<usize>,
}

impl RunnerConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            reports_path: None,
            limit_override: None,
        }
    }

    pub fn catalog(&self) -> Result<ReportCatalog, CatalogError> {
        let builtin = ReportCatalog::builtin();
        match &self.reports_path {
            Some(path) => Ok(builtin.merge(ReportCatalog::from_path(path)?)),
            None => Ok(builtin),
        }
    }

    #[must_use]
    pub fn source(&self) -> CsvDirectorySource {
        CsvDirectorySource::new(&self.data_dir)
    }

    /// Resolve `name` in the catalog and run it against the data directory.
    pub fn run(&self, name: &str) -> Result<(ReportSpec, Leaderboard), ReportError> {
        let catalog = self.catalog()?;
        let report = catalog
            .get(name)
            .ok_or_else(|| ReportError::UnknownReport(name.to_owned()))?
            .clone();
        let source = self.source();
        let board = match self.limit_override {
            Some(limit) => run_report_with_limit(&report, &source, Some(limit))?,
            None => run_report(&report, &source)?,
        };
        Ok((report, board))
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[cfg(test)]
mod tests {
    use lb_expr::Expr;
    use lb_groupby::{AggregateError, AggregationSpec, Reduction, SortDirection};
    use lb_join::{JoinKey, JoinKind, JoinSpec};
    use lb_table::{Dataset, Record, TableError};
    use lb_types::Scalar;

    use super::{
        InMemorySource, ReportError, ReportSource, ReportSpec, RunnerConfig, SourceError,
        StackPart, run_report, run_report_with_limit,
    };

    fn passing() -> Dataset {
        Dataset::from_records(
            "season_passing",
            &[
                Record::new().with("name", "Ames").with("yds", 2100),
                Record::new().with("name", "Bell").with("yds", 1800),
                Record::new().with("name", "Cruz").with("yds", 900),
            ],
        )
        .expect("dataset")
    }

    fn yards_report(limit: usize) -> ReportSpec {
        ReportSpec {
            name: "career_passing_yards".to_owned(),
            title: "Career passing yards".to_owned(),
            source: ReportSource::Dataset {
                dataset: "season_passing".to_owned(),
            },
            aggregation: AggregationSpec::new(["name"], "yds", SortDirection::Descending)
                .aggregate("yds", "yds", Reduction::Sum)
                .limit(limit),
        }
    }

    #[test]
    fn limit_override_replaces_configured_limit() {
        let source = InMemorySource::new().with(passing());
        assert_eq!(run_report(&yards_report(1), &source).expect("run").len(), 1);
        let widened = run_report_with_limit(&yards_report(1), &source, None).expect("run");
        assert_eq!(widened.len(), 3);
        assert_eq!(widened.rows()[2].get("name"), Some(&Scalar::from("Cruz")));
    }

    #[test]
    fn missing_dataset_surfaces_source_error() {
        let err = run_report(&yards_report(5), &InMemorySource::new()).expect_err("missing");
        assert!(matches!(
            err,
            ReportError::Source(SourceError::UnknownDataset { .. })
        ));
    }

    #[test]
    fn bad_column_surfaces_aggregate_error() {
        let mut report = yards_report(5);
        report.aggregation = report.aggregation.aggregate("td", "td", Reduction::Sum);
        let err = run_report(&report, &InMemorySource::new().with(passing())).expect_err("td");
        assert!(matches!(
            err,
            ReportError::Aggregate(AggregateError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn runner_rejects_unknown_report_names() {
        let config = RunnerConfig::default_paths();
        assert!(matches!(
            config.run("career_curling_stones"),
            Err(ReportError::UnknownReport(name)) if name == "career_curling_stones"
        ));
    }

    fn touchdown_tables() -> InMemorySource {
        let rushing = Dataset::from_records(
            "season_rushing",
            &[Record::new().with("name", "Ames").with("year", 2020).with("td", 1)],
        )
        .expect("rushing");
        let receiving = Dataset::from_records(
            "season_receiving",
            &[
                Record::new().with("name", "Ames").with("year", 2020).with("td", 2),
                Record::new().with("name", "Dale").with("year", 2020).with("td", 8),
            ],
        )
        .expect("receiving");
        InMemorySource::new().with(rushing).with(receiving)
    }

    fn total_td_aggregation() -> AggregationSpec {
        AggregationSpec::new(["name"], "total_td", SortDirection::Descending)
            .aggregate("rush_td", "rush_td", Reduction::Sum)
            .aggregate("rec_td", "rec_td", Reduction::Sum)
            .derive(
                "total_td",
                Expr::add(Expr::column("rush_td"), Expr::column("rec_td")),
            )
    }

    #[test]
    fn stacked_source_keeps_groups_found_in_only_one_part() {
        let report = ReportSpec {
            name: "career_total_tds".to_owned(),
            title: "Career touchdowns".to_owned(),
            source: ReportSource::Stack {
                parts: vec![
                    StackPart::new("season_rushing").rename("td", "rush_td"),
                    StackPart::new("season_receiving").rename("td", "rec_td"),
                ],
            },
            aggregation: total_td_aggregation(),
        };
        let board = run_report(&report, &touchdown_tables()).expect("run");
        let names: Vec<Scalar> = board.column_values("name").cloned().collect();
        assert_eq!(names, vec![Scalar::from("Dale"), Scalar::from("Ames")]);
        assert_eq!(board.rows()[0].get("rush_td"), Some(&Scalar::Int64(0)));
        assert_eq!(board.rows()[1].get("total_td"), Some(&Scalar::Int64(3)));
    }

    #[test]
    fn stacked_source_rejects_renaming_a_missing_column() {
        let report = ReportSpec {
            name: "broken".to_owned(),
            title: "Broken".to_owned(),
            source: ReportSource::Stack {
                parts: vec![StackPart::new("season_rushing").rename("tds", "rush_td")],
            },
            aggregation: total_td_aggregation(),
        };
        assert!(matches!(
            run_report(&report, &touchdown_tables()),
            Err(ReportError::Table(TableError::UnknownColumn { .. }))
        ));
    }

    #[test]
    fn joined_source_only_keeps_matching_left_rows() {
        let report = ReportSpec {
            name: "joined".to_owned(),
            title: "Joined".to_owned(),
            source: ReportSource::Join {
                left: "season_rushing".to_owned(),
                right: "season_receiving".to_owned(),
                join: JoinSpec::new(
                    vec![JoinKey::same("name"), JoinKey::same("year")],
                    JoinKind::Left,
                ),
            },
            aggregation: AggregationSpec::new(["name"], "td", SortDirection::Descending)
                .aggregate("td", "td", Reduction::Sum)
                .aggregate("td_right", "td_right", Reduction::Sum),
        };
        let board = run_report(&report, &touchdown_tables()).expect("run");
        assert_eq!(board.len(), 1);
        assert_eq!(board.rows()[0].get("td_right"), Some(&Scalar::Int64(2)));
    }
}
