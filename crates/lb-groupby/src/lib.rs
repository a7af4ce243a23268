#![forbid(unsafe_code)]

use std::{cmp::Ordering, collections::HashMap, fmt, mem::size_of};

use bumpalo::{Bump, collections::Vec as BumpVec};
use lb_expr::{Expr, ExprError, Predicate, evaluate};
use lb_table::{Dataset, Record, TableError};
use lb_types::{Accumulator, GroupKeyRef, Scalar, TypeError, infer_dtype};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Aggregation spec
// ---------------------------------------------------------------------------

/// Reduction applied to one source column within each group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Nulls count as zero.
    Sum,
    /// Number of non-null values.
    Count,
    Min,
    Max,
    /// Sum over count of non-null values; `Null` when that count is zero.
    Avg,
}

impl Reduction {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateColumn {
    pub output: String,
    pub source: String,
    pub reduction: Reduction,
}

/// Column computed from the already-aggregated values of the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedColumn {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub group_key: Vec<String>,
    pub aggregates: Vec<AggregateColumn>,
    #[serde(default)]
    pub derived: Vec<DerivedColumn>,
    #[serde(default)]
    pub having: Vec<Predicate>,
    pub sort: SortKey,
    /// `None` keeps every group.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AggregationSpec {
    #[must_use]
    pub fn new<I, S>(group_key: I, sort_column: impl Into<String>, direction: SortDirection) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            group_key: group_key.into_iter().map(Into::into).collect(),
            aggregates: Vec::new(),
            derived: Vec::new(),
            having: Vec::new(),
            sort: SortKey {
                column: sort_column.into(),
                direction,
            },
            limit: None,
        }
    }

    #[must_use]
    pub fn aggregate(
        mut self,
        output: impl Into<String>,
        source: impl Into<String>,
        reduction: Reduction,
    ) -> Self {
        self.aggregates.push(AggregateColumn {
            output: output.into(),
            source: source.into(),
            reduction,
        });
        self
    }

    #[must_use]
    pub fn derive(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.derived.push(DerivedColumn {
            name: name.into(),
            expr,
        });
        self
    }

    #[must_use]
    pub fn having(mut self, predicate: Predicate) -> Self {
        self.having.push(predicate);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardRow {
    rank: usize,
    record: Record,
}

impl LeaderboardRow {
    /// 1-based competition rank ("1224") on the sort column.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.record.get(column)
    }
}

/// Ranked, size-limited result of [`aggregate`]. Owns all of its values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Leaderboard {
    columns: Vec<String>,
    rows: Vec<LeaderboardRow>,
}

impl Leaderboard {
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[LeaderboardRow] {
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

    /// Values of one output column in rank order; `Null` for unknown columns.
    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Scalar> + 'a {
        self.rows
            .iter()
            .map(move |row| row.get(column).unwrap_or(&Scalar::Null))
    }

    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.rows.into_iter().map(|row| row.record).collect()
    }
}

// ---------------------------------------------------------------------------
// Errors and options
// ---------------------------------------------------------------------------

/// Where in an aggregation spec an unknown column was referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    GroupKey,
    AggregateSource,
    DerivedReference,
    Having,
    SortKey,
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GroupKey => "group key",
            Self::AggregateSource => "aggregate source",
            Self::DerivedReference => "derived column reference",
            Self::Having => "having predicate",
            Self::SortKey => "sort key",
        })
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("group key must name at least one column")]
    EmptyGroupKey,
    #[error("{role} {column:?} is not a column of {schema}")]
    UnknownColumn {
        column: String,
        role: ColumnRole,
        schema: String,
    },
    #[error("output column {0:?} is defined more than once")]
    DuplicateOutputColumn(String),
    #[error("cannot {} into column {column:?}: {source}", reduction.name())]
    Reduction {
        column: String,
        reduction: Reduction,
        source: TypeError,
    },
    #[error("cannot derive column {column:?}: {source}")]
    Derived { column: String, source: ExprError },
    #[error("having predicate on {column:?} failed: {source}")]
    Filter { column: String, source: ExprError },
    #[error("cannot sort by {column:?}: {source}")]
    Sort { column: String, source: TypeError },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupByOptions {
    /// Skip rows whose group key contains a null instead of grouping them.
    pub dropna: bool,
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupByExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for GroupByExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupByExecutionTrace {
    used_arena: bool,
    input_rows: usize,
    groups: usize,
    estimated_bytes: usize,
}

// ---------------------------------------------------------------------------
// Plan resolution
// ---------------------------------------------------------------------------

struct ResolvedAggregate<'s> {
    output: &'s str,
    source_pos: usize,
    reduction: Reduction,
}

struct AggregatePlan<'s> {
    key_positions: Vec<usize>,
    aggregates: Vec<ResolvedAggregate<'s>>,
    columns: Vec<String>,
}

impl<'s> AggregatePlan<'s> {
    /// Check every column reference before any row is touched, so a bad spec
    /// fails the same way on empty and non-empty input.
    fn resolve(dataset: &Dataset, spec: &'s AggregationSpec) -> Result<Self, AggregateError> {
        let columns = resolve_output_columns(spec)?;

        let unknown_in_dataset = |column: &str, role: ColumnRole| AggregateError::UnknownColumn {
            column: column.to_owned(),
            role,
            schema: format!("dataset {:?}", dataset.name()),
        };

        let key_positions = spec
            .group_key
            .iter()
            .map(|column| {
                dataset
                    .schema()
                    .position(column)
                    .ok_or_else(|| unknown_in_dataset(column.as_str(), ColumnRole::GroupKey))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let aggregates = spec
            .aggregates
            .iter()
            .map(|agg| {
                let source_pos = dataset
                    .schema()
                    .position(&agg.source)
                    .ok_or_else(|| unknown_in_dataset(agg.source.as_str(), ColumnRole::AggregateSource))?;
                Ok(ResolvedAggregate {
                    output: agg.output.as_str(),
                    source_pos,
                    reduction: agg.reduction,
                })
            })
            .collect::<Result<Vec<_>, AggregateError>>()?;

        Ok(Self {
            key_positions,
            aggregates,
            columns,
        })
    }
}

/// Validate the parts of `spec` that do not depend on the input schema and
/// return the output columns in order.
fn resolve_output_columns(spec: &AggregationSpec) -> Result<Vec<String>, AggregateError> {
    if spec.group_key.is_empty() {
        return Err(AggregateError::EmptyGroupKey);
    }

    let unknown_in_output = |column: &str, role: ColumnRole| AggregateError::UnknownColumn {
        column: column.to_owned(),
        role,
        schema: "the leaderboard output".to_owned(),
    };

    let mut columns: Vec<String> = Vec::new();
    let declare = |columns: &mut Vec<String>, name: &str| {
        if columns.iter().any(|c| c == name) {
            return Err(AggregateError::DuplicateOutputColumn(name.to_owned()));
        }
        columns.push(name.to_owned());
        Ok(())
    };
    for name in spec.group_key.iter().chain(spec.aggregates.iter().map(|a| &a.output)) {
        declare(&mut columns, name.as_str())?;
    }
    for derived in &spec.derived {
        if let Some(missing) = derived
            .expr
            .referenced_columns()
            .into_iter()
            .find(|c| !columns.iter().any(|known| known == *c))
        {
            return Err(unknown_in_output(missing, ColumnRole::DerivedReference));
        }
        declare(&mut columns, derived.name.as_str())?;
    }

    let has_column = |name: &str| columns.iter().any(|c| c == name);
    if let Some(predicate) = spec.having.iter().find(|p| !has_column(p.column.as_str())) {
        return Err(unknown_in_output(predicate.column.as_str(), ColumnRole::Having));
    }
    if !has_column(spec.sort.column.as_str()) {
        return Err(unknown_in_output(spec.sort.column.as_str(), ColumnRole::SortKey));
    }

    Ok(columns)
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Group `dataset` by `spec.group_key`, reduce, derive, filter, sort and
/// truncate to `spec.limit`.
pub fn aggregate(dataset: &Dataset, spec: &AggregationSpec) -> Result<Leaderboard, AggregateError> {
    aggregate_with_options(
        dataset,
        spec,
        GroupByOptions::default(),
        GroupByExecutionOptions::default(),
    )
}

pub fn aggregate_with_options(
    dataset: &Dataset,
    spec: &AggregationSpec,
    options: GroupByOptions,
    exec_options: GroupByExecutionOptions,
) -> Result<Leaderboard, AggregateError> {
    let (leaderboard, _trace) = aggregate_with_trace(dataset, spec, options, exec_options)?;
    Ok(leaderboard)
}

fn aggregate_with_trace(
    dataset: &Dataset,
    spec: &AggregationSpec,
    options: GroupByOptions,
    exec_options: GroupByExecutionOptions,
) -> Result<(Leaderboard, GroupByExecutionTrace), AggregateError> {
    // A dataset built from zero records carries no schema to check against.
    if dataset.is_empty() && dataset.schema().is_empty() {
        let columns = resolve_output_columns(spec)?;
        debug!("aggregate {}: no rows and no columns", dataset.name());
        return Ok((
            Leaderboard {
                columns,
                rows: Vec::new(),
            },
            GroupByExecutionTrace {
                used_arena: false,
                input_rows: 0,
                groups: 0,
                estimated_bytes: 0,
            },
        ));
    }

    let plan = AggregatePlan::resolve(dataset, spec)?;

    let input_rows = dataset.len();
    let estimated_bytes = estimate_groupby_intermediate_bytes(input_rows);
    let use_arena = exec_options.use_arena && estimated_bytes <= exec_options.arena_budget_bytes;

    let groups = if use_arena {
        let arena = Bump::new();
        let mut assignments = BumpVec::<Option<usize>>::with_capacity_in(input_rows, &arena);
        let firsts = partition(dataset.rows(), &plan.key_positions, options.dropna, |group| {
            assignments.push(group);
        });
        reduce_groups(&plan, dataset.rows(), assignments.as_slice(), &firsts)?
    } else {
        let mut assignments = Vec::<Option<usize>>::with_capacity(input_rows);
        let firsts = partition(dataset.rows(), &plan.key_positions, options.dropna, |group| {
            assignments.push(group);
        });
        reduce_groups(&plan, dataset.rows(), &assignments, &firsts)?
    };
    let group_count = groups.len();

    let mut records = Vec::with_capacity(group_count);
    for mut record in groups {
        for derived in &spec.derived {
            let value = evaluate(&derived.expr, &record).map_err(|source| {
                AggregateError::Derived {
                    column: derived.name.clone(),
                    source,
                }
            })?;
            record.insert(derived.name.clone(), value);
        }
        if passes_having(&spec.having, &record)? {
            records.push(record);
        }
    }

    let rows = rank_rows(records, &spec.sort, spec.limit)?;

    debug!(
        "aggregate {}: {input_rows} rows -> {group_count} groups -> {} ranked (arena={use_arena})",
        dataset.name(),
        rows.len()
    );

    Ok((
        Leaderboard {
            columns: plan.columns,
            rows,
        },
        GroupByExecutionTrace {
            used_arena: use_arena,
            input_rows,
            groups: group_count,
            estimated_bytes,
        },
    ))
}

/// Estimate intermediate memory: one assignment slot per row plus hash map
/// entry overhead for the worst case of one group per row.
fn estimate_groupby_intermediate_bytes(input_rows: usize) -> usize {
    input_rows.saturating_mul(
        size_of::<Option<usize>>()
            .saturating_add(size_of::<usize>())
            .saturating_add(64),
    )
}

/// Assign each row to a group numbered in first-encounter order.
///
/// `assign` receives one entry per input row (`None` for rows dropped by
/// `dropna`). Returns the first row index of every group.
fn partition<'a>(
    rows: &'a [Vec<Scalar>],
    key_positions: &[usize],
    dropna: bool,
    mut assign: impl FnMut(Option<usize>),
) -> Vec<usize> {
    let mut slot = HashMap::<Vec<GroupKeyRef<'a>>, usize>::new();
    let mut firsts = Vec::new();

    for (pos, row) in rows.iter().enumerate() {
        let key: Vec<GroupKeyRef<'a>> = key_positions
            .iter()
            .map(|p| GroupKeyRef::from_scalar(&row[*p]))
            .collect();
        if dropna && key.iter().any(GroupKeyRef::is_null) {
            assign(None);
            continue;
        }

        let next = firsts.len();
        let group = *slot.entry(key).or_insert_with(|| {
            firsts.push(pos);
            next
        });
        assign(Some(group));
    }

    firsts
}

fn reduce_groups(
    plan: &AggregatePlan<'_>,
    rows: &[Vec<Scalar>],
    assignments: &[Option<usize>],
    firsts: &[usize],
) -> Result<Vec<Record>, AggregateError> {
    let mut slots = vec![vec![Accumulator::new(); plan.aggregates.len()]; firsts.len()];

    for (row, group) in rows.iter().zip(assignments) {
        let Some(group) = group else {
            continue;
        };
        for (acc, agg) in slots[*group].iter_mut().zip(&plan.aggregates) {
            let value = &row[agg.source_pos];
            let pushed = match agg.reduction {
                Reduction::Sum | Reduction::Avg => acc.push_numeric(value),
                Reduction::Count => {
                    acc.push_present(value);
                    Ok(())
                }
                Reduction::Min | Reduction::Max => acc.push_ordered(value),
            };
            pushed.map_err(|source| AggregateError::Reduction {
                column: agg.output.to_owned(),
                reduction: agg.reduction,
                source,
            })?;
        }
    }

    let key_count = plan.key_positions.len();
    let mut out = Vec::with_capacity(firsts.len());
    for (first, accs) in firsts.iter().zip(slots) {
        let source = &rows[*first];
        let mut record = Record::new();
        for (name, pos) in plan.columns[..key_count].iter().zip(&plan.key_positions) {
            record.insert(name.clone(), source[*pos].clone());
        }
        for (agg, acc) in plan.aggregates.iter().zip(accs) {
            let value = match agg.reduction {
                Reduction::Sum => acc.sum(),
                Reduction::Count => Scalar::Int64(i64::try_from(acc.count()).unwrap_or(i64::MAX)),
                Reduction::Min => acc.min(),
                Reduction::Max => acc.max(),
                Reduction::Avg => acc.mean(),
            };
            record.insert(agg.output, value);
        }
        out.push(record);
    }
    Ok(out)
}

fn passes_having(having: &[Predicate], record: &Record) -> Result<bool, AggregateError> {
    for predicate in having {
        let keep = predicate
            .matches(record)
            .map_err(|source| AggregateError::Filter {
                column: predicate.column.clone(),
                source,
            })?;
        if !keep {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Nulls always sort last; present values follow `direction`.
fn compare_sort_values(a: &Scalar, b: &Scalar, direction: SortDirection) -> Ordering {
    match (a.is_missing(), b.is_missing()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ord = a.compare(b).ok().flatten().unwrap_or(Ordering::Equal);
            match direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        }
    }
}

fn rank_rows(
    records: Vec<Record>,
    sort: &SortKey,
    limit: Option<usize>,
) -> Result<Vec<LeaderboardRow>, AggregateError> {
    let mut keyed: Vec<(Scalar, Record)> = records
        .into_iter()
        .map(|record| {
            let key = record.get(&sort.column).cloned().unwrap_or(Scalar::Null);
            (key, record)
        })
        .collect();

    // Text and numbers cannot share one ordering.
    infer_dtype(keyed.iter().map(|(key, _)| key)).map_err(|source| AggregateError::Sort {
        column: sort.column.clone(),
        source,
    })?;

    // `sort_by` is stable, so ties keep first-encounter group order.
    keyed.sort_by(|(a, _), (b, _)| compare_sort_values(a, b, sort.direction));
    if let Some(limit) = limit {
        keyed.truncate(limit);
    }

    let mut rows: Vec<LeaderboardRow> = Vec::with_capacity(keyed.len());
    let mut previous: Option<Scalar> = None;
    for (idx, (key, record)) in keyed.into_iter().enumerate() {
        let rank = match (&previous, rows.last()) {
            (Some(prev), Some(last)) if prev.semantic_eq(&key) => last.rank,
            _ => idx + 1,
        };
        previous = Some(key);
        rows.push(LeaderboardRow { rank, record });
    }
    Ok(rows)
}
