use std::{fs, path::Path};

use lb_expr::{ComparisonOp, Expr, Predicate};
use lb_groupby::{AggregationSpec, Reduction, SortDirection};
use log::warn;
use thiserror::Error;

use crate::{ReportSource, ReportSpec, StackPart};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("report {0:?} is defined more than once")]
    DuplicateReport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Ordered set of report definitions with unique names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportCatalog {
    reports: Vec<ReportSpec>,
}

impl ReportCatalog {
    pub fn from_reports(reports: Vec<ReportSpec>) -> Result<Self, CatalogError> {
        for (idx, report) in reports.iter().enumerate() {
            if reports[..idx].iter().any(|r| r.name == report.name) {
                return Err(CatalogError::DuplicateReport(report.name.clone()));
            }
        }
        Ok(Self { reports })
    }

    /// Parse a JSON array of report definitions.
    pub fn from_json_str(input: &str) -> Result<Self, CatalogError> {
        let reports: Vec<ReportSpec> = serde_json::from_str(input)?;
        Self::from_reports(reports)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let body = fs::read_to_string(path)?;
        Self::from_json_str(&body)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ReportSpec> {
        self.reports.iter().find(|r| r.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.reports.iter().map(|r| r.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReportSpec> {
        self.reports.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Add `other`'s reports. A report whose name already exists replaces the
    /// existing definition in place; new names are appended.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        for report in other.reports {
            if let Some(slot) = self.reports.iter_mut().find(|r| r.name == report.name) {
                warn!("report {} overrides an existing definition", report.name);
                *slot = report;
            } else {
                self.reports.push(report);
            }
        }
        self
    }

    /// Career and season leaderboards over the per-season football tables.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            reports: builtin_reports(),
        }
    }
}

const TOP: usize = 10;

fn ratio(numerator: &str, denominator: &str, digits: u32) -> Expr {
    Expr::round(
        Expr::div(Expr::column(numerator), Expr::column(denominator)),
        digits,
    )
}

fn career(sort_column: &str) -> AggregationSpec {
    AggregationSpec::new(["name"], sort_column, SortDirection::Descending).limit(TOP)
}

fn report(name: &str, title: &str, dataset: &str, aggregation: AggregationSpec) -> ReportSpec {
    ReportSpec {
        name: name.to_owned(),
        title: title.to_owned(),
        source: ReportSource::Dataset {
            dataset: dataset.to_owned(),
        },
        aggregation,
    }
}

#[allow(clippy::too_many_lines)]
fn builtin_reports() -> Vec<ReportSpec> {
    vec![
        report(
            "career_passing_yards",
            "Career passing yards",
            "season_passing",
            career("yds")
                .aggregate("yds", "yds", Reduction::Sum)
                .aggregate("att", "att", Reduction::Sum)
                .aggregate("comp", "comp", Reduction::Sum)
                .aggregate("seasons", "year", Reduction::Count),
        ),
        report(
            "career_passing_tds",
            "Career passing touchdowns",
            "season_passing",
            career("td")
                .aggregate("td", "td", Reduction::Sum)
                .aggregate("int", "int", Reduction::Sum),
        ),
        report(
            "career_yards_per_attempt",
            "Career yards per pass attempt (min. 150 attempts)",
            "season_passing",
            career("ypa")
                .aggregate("yds", "yds", Reduction::Sum)
                .aggregate("att", "att", Reduction::Sum)
                .derive("ypa", ratio("yds", "att", 1))
                .having(Predicate::new("att", ComparisonOp::Ge, 150)),
        ),
        report(
            "career_rushing_yards",
            "Career rushing yards",
            "season_rushing",
            career("yds")
                .aggregate("yds", "yds", Reduction::Sum)
                .aggregate("car", "car", Reduction::Sum)
                .aggregate("td", "td", Reduction::Sum)
                .derive("ypc", ratio("yds", "car", 1)),
        ),
        report(
            "season_rushing_yards",
            "Single-season rushing yards",
            "season_rushing",
            AggregationSpec::new(["name", "year"], "yds", SortDirection::Descending)
                .aggregate("yds", "yds", Reduction::Sum)
                .aggregate("car", "car", Reduction::Sum)
                .derive("ypc", ratio("yds", "car", 1))
                .limit(TOP),
        ),
        report(
            "career_receiving_yards",
            "Career receiving yards",
            "season_receiving",
            career("yds")
                .aggregate("yds", "yds", Reduction::Sum)
                .aggregate("rec", "rec", Reduction::Sum)
                .aggregate("td", "td", Reduction::Sum)
                .derive("ypr", ratio("yds", "rec", 1)),
        ),
        ReportSpec {
            name: "career_total_tds".to_owned(),
            title: "Career rushing and receiving touchdowns".to_owned(),
            source: ReportSource::Stack {
                parts: vec![
                    StackPart::new("season_rushing").rename("td", "rush_td"),
                    StackPart::new("season_receiving").rename("td", "rec_td"),
                ],
            },
            aggregation: career("total_td")
                .aggregate("rush_td", "rush_td", Reduction::Sum)
                .aggregate("rec_td", "rec_td", Reduction::Sum)
                .derive(
                    "total_td",
                    Expr::add(Expr::column("rush_td"), Expr::column("rec_td")),
                ),
        },
        report(
            "career_tackles",
            "Career tackles",
            "season_defense",
            career("total")
                .aggregate("solo", "solo", Reduction::Sum)
                .aggregate("ast", "ast", Reduction::Sum)
                .derive("total", Expr::add(Expr::column("solo"), Expr::column("ast"))),
        ),
        report(
            "career_sacks",
            "Career sacks",
            "season_defense",
            career("sacks").aggregate("sacks", "sacks", Reduction::Sum),
        ),
        report(
            "career_interceptions",
            "Career interceptions",
            "season_defense",
            career("int").aggregate("int", "int", Reduction::Sum),
        ),
        report(
            "career_field_goals",
            "Career field goals made",
            "season_kicking",
            career("fgm")
                .aggregate("fgm", "fgm", Reduction::Sum)
                .aggregate("fga", "fga", Reduction::Sum)
                .aggregate("long", "long", Reduction::Max)
                .derive(
                    "pct",
                    Expr::round(
                        Expr::mul(
                            Expr::div(Expr::column("fgm"), Expr::column("fga")),
                            Expr::literal(100),
                        ),
                        1,
                    ),
                ),
        ),
        report(
            "career_punting_average",
            "Career punting average (min. 40 punts)",
            "season_punting",
            career("avg")
                .aggregate("punts", "punts", Reduction::Sum)
                .aggregate("yds", "yds", Reduction::Sum)
                .derive("avg", ratio("yds", "punts", 1))
                .having(Predicate::new("punts", ComparisonOp::Ge, 40)),
        ),
        report(
            "career_kick_return_yards",
            "Career kick return yards",
            "season_kick_returns",
            career("yds")
                .aggregate("yds", "yds", Reduction::Sum)
                .aggregate("ret", "ret", Reduction::Sum)
                .aggregate("td", "td", Reduction::Sum)
                .derive("avg", ratio("yds", "ret", 1)),
        ),
        report(
            "season_records",
            "Season win/loss records",
            "season_results",
            AggregationSpec::new(["year"], "win_pct", SortDirection::Descending)
                .aggregate("wins", "wins", Reduction::Sum)
                .aggregate("losses", "losses", Reduction::Sum)
                .aggregate("ties", "ties", Reduction::Sum)
                .derive(
                    "games",
                    Expr::add(
                        Expr::add(Expr::column("wins"), Expr::column("losses")),
                        Expr::column("ties"),
                    ),
                )
                .derive("win_pct", ratio("wins", "games", 3)),
        ),
    ]
}
