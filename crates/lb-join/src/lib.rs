#![forbid(unsafe_code)]

use std::{collections::HashMap, mem::size_of};

use bumpalo::{Bump, collections::Vec as BumpVec};
use lb_table::{Dataset, Schema, TableError};
use lb_types::{GroupKeyRef, Scalar};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
}

/// One equality pair of a composite join key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinKey {
    pub left: String,
    pub right: String,
}

impl JoinKey {
    #[must_use]
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
        }
    }

    /// Same column name on both sides.
    #[must_use]
    pub fn same(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            left: name.clone(),
            right: name,
        }
    }
}

fn default_right_suffix() -> String {
    "_right".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub on: Vec<JoinKey>,
    pub kind: JoinKind,
    /// Appended to right-side non-key columns whose name is already taken.
    #[serde(default = "default_right_suffix")]
    pub right_suffix: String,
}

impl JoinSpec {
    #[must_use]
    pub fn new(on: Vec<JoinKey>, kind: JoinKind) -> Self {
        Self {
            on,
            kind,
            right_suffix: default_right_suffix(),
        }
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join key must name at least one column pair")]
    EmptyJoinKey,
    #[error("right column {column:?} collides with a left column and the right suffix is empty")]
    EmptySuffixCollision { column: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinExecutionTrace {
    used_arena: bool,
    output_rows: usize,
    estimated_bytes: usize,
}

/// Resolved column positions for one join.
struct JoinPlan {
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    /// Right columns carried into the output (non-key), in right schema order.
    right_carried: Vec<usize>,
    schema: Schema,
}

pub fn join(left: &Dataset, right: &Dataset, spec: &JoinSpec) -> Result<Dataset, JoinError> {
    join_with_options(left, right, spec, JoinExecutionOptions::default())
}

pub fn join_with_options(
    left: &Dataset,
    right: &Dataset,
    spec: &JoinSpec,
    options: JoinExecutionOptions,
) -> Result<Dataset, JoinError> {
    let (joined, _) = join_with_trace(left, right, spec, options)?;
    Ok(joined)
}

fn plan_join(left: &Dataset, right: &Dataset, spec: &JoinSpec) -> Result<JoinPlan, JoinError> {
    if spec.on.is_empty() {
        return Err(JoinError::EmptyJoinKey);
    }

    let mut left_keys = Vec::with_capacity(spec.on.len());
    let mut right_keys = Vec::with_capacity(spec.on.len());
    for key in &spec.on {
        left_keys.push(left.column_position(&key.left)?);
        right_keys.push(right.column_position(&key.right)?);
    }

    let mut names: Vec<String> = left.schema().columns().to_vec();
    let mut right_carried = Vec::new();
    for (pos, column) in right.schema().columns().iter().enumerate() {
        if right_keys.contains(&pos) {
            continue;
        }
        let mut name = column.clone();
        if spec.right_suffix.is_empty() && names.contains(&name) {
            return Err(JoinError::EmptySuffixCollision { column: name });
        }
        while names.contains(&name) {
            name.push_str(&spec.right_suffix);
        }
        names.push(name);
        right_carried.push(pos);
    }

    Ok(JoinPlan {
        left_keys,
        right_keys,
        right_carried,
        schema: Schema::new(names)?,
    })
}

/// Borrowed composite key of one row. `None` when any part is missing, since
/// a key containing a null never matches.
fn row_key<'a>(row: &'a [Scalar], positions: &[usize]) -> Option<Vec<GroupKeyRef<'a>>> {
    let key: Vec<GroupKeyRef<'a>> = positions
        .iter()
        .map(|pos| GroupKeyRef::from_scalar(&row[*pos]))
        .collect();
    if key.iter().any(GroupKeyRef::is_null) {
        None
    } else {
        Some(key)
    }
}

fn join_with_trace(
    left: &Dataset,
    right: &Dataset,
    spec: &JoinSpec,
    options: JoinExecutionOptions,
) -> Result<(Dataset, JoinExecutionTrace), JoinError> {
    let plan = plan_join(left, right, spec)?;

    // Borrowed keys avoid cloning right-side key values during the build phase.
    let mut right_map = HashMap::<Vec<GroupKeyRef<'_>>, Vec<usize>>::new();
    for (pos, row) in right.rows().iter().enumerate() {
        if let Some(key) = row_key(row, &plan.right_keys) {
            right_map.entry(key).or_default().push(pos);
        }
    }

    let left_keys: Vec<Option<Vec<GroupKeyRef<'_>>>> = left
        .rows()
        .iter()
        .map(|row| row_key(row, &plan.left_keys))
        .collect();

    let output_rows = estimate_output_rows(&left_keys, &right_map, spec.kind);
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;

    let rows = if use_arena {
        let arena = Bump::new();
        let mut positions = BumpVec::<(usize, Option<usize>)>::with_capacity_in(output_rows, &arena);
        collect_positions(&left_keys, &right_map, spec.kind, |pair| positions.push(pair));
        materialize(left, right, &plan, positions.as_slice())
    } else {
        let mut positions = Vec::<(usize, Option<usize>)>::with_capacity(output_rows);
        collect_positions(&left_keys, &right_map, spec.kind, |pair| positions.push(pair));
        materialize(left, right, &plan, &positions)
    };

    debug!(
        "join {} x {} on {} key(s): {} -> {} rows (arena={use_arena})",
        left.name(),
        right.name(),
        spec.on.len(),
        left.len(),
        rows.len()
    );

    let joined = Dataset::new(
        format!("{}+{}", left.name(), right.name()),
        plan.schema,
        rows,
    )?;

    Ok((
        joined,
        JoinExecutionTrace {
            used_arena: use_arena,
            output_rows,
            estimated_bytes,
        },
    ))
}

fn estimate_output_rows<'k>(
    left_keys: &[Option<Vec<GroupKeyRef<'k>>>],
    right_map: &HashMap<Vec<GroupKeyRef<'k>>, Vec<usize>>,
    kind: JoinKind,
) -> usize {
    left_keys
        .iter()
        .map(|key| match key.as_ref().and_then(|k| right_map.get(k)) {
            Some(matches) => matches.len(),
            None if matches!(kind, JoinKind::Left) => 1,
            None => 0,
        })
        .sum()
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<(usize, Option<usize>)>())
}

/// Probe left rows in order, emitting `(left_pos, right_pos)` pairs. Matches
/// fan out in right input order; unmatched left rows survive only for `Left`.
fn collect_positions<'k>(
    left_keys: &[Option<Vec<GroupKeyRef<'k>>>],
    right_map: &HashMap<Vec<GroupKeyRef<'k>>, Vec<usize>>,
    kind: JoinKind,
    mut emit: impl FnMut((usize, Option<usize>)),
) {
    for (left_pos, key) in left_keys.iter().enumerate() {
        if let Some(matches) = key.as_ref().and_then(|k| right_map.get(k)) {
            for right_pos in matches {
                emit((left_pos, Some(*right_pos)));
            }
            continue;
        }

        if matches!(kind, JoinKind::Left) {
            emit((left_pos, None));
        }
    }
}

fn materialize(
    left: &Dataset,
    right: &Dataset,
    plan: &JoinPlan,
    positions: &[(usize, Option<usize>)],
) -> Vec<Vec<Scalar>> {
    let width = plan.schema.len();
    positions
        .iter()
        .map(|(left_pos, right_pos)| {
            let mut row = Vec::with_capacity(width);
            row.extend(left.rows()[*left_pos].iter().cloned());
            match right_pos {
                Some(pos) => {
                    let source = &right.rows()[*pos];
                    row.extend(plan.right_carried.iter().map(|c| source[*c].clone()));
                }
                None => row.extend(plan.right_carried.iter().map(|_| Scalar::Null)),
            }
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use lb_table::{Dataset, Record, TableError};
    use lb_types::Scalar;

    use super::{
        JoinError, JoinExecutionOptions, JoinKey, JoinKind, JoinSpec, join, join_with_options,
        join_with_trace,
    };

    fn rushing() -> Dataset {
        Dataset::from_records(
            "season_rushing",
            &[
                Record::new().with("name", "Adams").with("year", 2020).with("td", 2),
                Record::new().with("name", "Adams").with("year", 2021).with("td", 5),
                Record::new().with("name", "Baker").with("year", 2020).with("td", 1),
            ],
        )
        .expect("rushing")
    }

    fn receiving() -> Dataset {
        Dataset::from_records(
            "season_receiving",
            &[
                Record::new().with("name", "Adams").with("year", 2020).with("td", 1),
                Record::new().with("name", "Cole").with("year", 2020).with("td", 4),
            ],
        )
        .expect("receiving")
    }

    fn name_year(kind: JoinKind) -> JoinSpec {
        JoinSpec::new(vec![JoinKey::same("name"), JoinKey::same("year")], kind)
    }

    #[test]
    fn left_join_keeps_every_left_row_and_nulls_unmatched() {
        let out = join(&rushing(), &receiving(), &name_year(JoinKind::Left)).expect("join");
        assert_eq!(out.schema().columns(), &["name", "year", "td", "td_right"]);
        assert_eq!(out.len(), 3);
        assert_eq!(out.value(0, "td_right"), Some(&Scalar::Int64(1)));
        assert_eq!(out.value(1, "td_right"), Some(&Scalar::Null));
        assert_eq!(out.value(2, "td_right"), Some(&Scalar::Null));
        assert_eq!(out.name(), "season_rushing+season_receiving");
    }

    #[test]
    fn inner_join_emits_only_matches() {
        let out = join(&rushing(), &receiving(), &name_year(JoinKind::Inner)).expect("join");
        assert_eq!(out.len(), 1);
        assert_eq!(out.value(0, "name"), Some(&Scalar::from("Adams")));
    }

    #[test]
    fn duplicate_right_matches_fan_out_in_right_order() {
        let left = Dataset::from_records(
            "left",
            &[Record::new().with("k", "x").with("v", 1)],
        )
        .expect("left");
        let right = Dataset::from_records(
            "right",
            &[
                Record::new().with("k", "x").with("w", 10),
                Record::new().with("k", "x").with("w", 20),
            ],
        )
        .expect("right");

        let spec = JoinSpec::new(vec![JoinKey::same("k")], JoinKind::Left);
        let out = join(&left, &right, &spec).expect("join");
        assert_eq!(out.len(), 2);
        assert_eq!(out.value(0, "w"), Some(&Scalar::Int64(10)));
        assert_eq!(out.value(1, "w"), Some(&Scalar::Int64(20)));
        assert_eq!(out.value(1, "v"), Some(&Scalar::Int64(1)));
    }

    #[test]
    fn null_keys_never_match() {
        let left = Dataset::from_records(
            "left",
            &[Record::new().with("k", Scalar::Null).with("v", 1)],
        )
        .expect("left");
        let right = Dataset::from_records(
            "right",
            &[Record::new().with("k", Scalar::Null).with("w", 10)],
        )
        .expect("right");

        let inner = join(&left, &right, &JoinSpec::new(vec![JoinKey::same("k")], JoinKind::Inner))
            .expect("inner");
        assert!(inner.is_empty());
        let outer = join(&left, &right, &JoinSpec::new(vec![JoinKey::same("k")], JoinKind::Left))
            .expect("left");
        assert_eq!(outer.value(0, "w"), Some(&Scalar::Null));
    }

    #[test]
    fn integral_float_keys_match_integer_keys() {
        let left = Dataset::from_records(
            "left",
            &[Record::new().with("year", 2020).with("v", 1)],
        )
        .expect("left");
        let right = Dataset::from_records(
            "right",
            &[Record::new().with("season", 2020.0).with("w", 7)],
        )
        .expect("right");
        let spec = JoinSpec::new(vec![JoinKey::new("year", "season")], JoinKind::Inner);
        let out = join(&left, &right, &spec).expect("join");
        assert_eq!(out.schema().columns(), &["year", "v", "w"]);
        assert_eq!(out.value(0, "w"), Some(&Scalar::Int64(7)));
    }

    #[test]
    fn unknown_key_column_is_reported_with_its_side() {
        let spec = JoinSpec::new(vec![JoinKey::new("name", "player")], JoinKind::Left);
        let err = join(&rushing(), &receiving(), &spec).expect_err("unknown");
        match err {
            JoinError::Table(TableError::UnknownColumn { dataset, column }) => {
                assert_eq!(dataset, "season_receiving");
                assert_eq!(column, "player");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_join_key_is_rejected() {
        let spec = JoinSpec::new(Vec::new(), JoinKind::Inner);
        assert!(matches!(
            join(&rushing(), &receiving(), &spec),
            Err(JoinError::EmptyJoinKey)
        ));
    }

    #[test]
    fn empty_suffix_with_colliding_column_is_rejected() {
        let spec: JoinSpec = serde_json::from_str(
            r#"{"on": [{"left": "name", "right": "name"}, {"left": "year", "right": "year"}],
                "kind": "left", "right_suffix": ""}"#,
        )
        .expect("spec");
        assert!(matches!(
            join(&rushing(), &receiving(), &spec),
            Err(JoinError::EmptySuffixCollision { column }) if column == "td"
        ));
    }

    #[test]
    fn empty_suffix_is_fine_without_collisions() {
        let mut spec = name_year(JoinKind::Inner);
        spec.right_suffix = String::new();
        let receiving = Dataset::from_records(
            "season_receiving",
            &[Record::new().with("name", "Adams").with("year", 2020).with("rec_td", 1)],
        )
        .expect("receiving");
        let out = join(&rushing(), &receiving, &spec).expect("join");
        assert_eq!(out.schema().columns(), &["name", "year", "td", "rec_td"]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn arena_join_matches_global_allocator_behavior() {
        let spec = name_year(JoinKind::Left);
        let global = join_with_options(
            &rushing(),
            &receiving(),
            &spec,
            JoinExecutionOptions {
                use_arena: false,
                arena_budget_bytes: 0,
            },
        )
        .expect("global join");
        let arena = join_with_options(&rushing(), &receiving(), &spec, JoinExecutionOptions::default())
            .expect("arena join");
        assert_eq!(arena, global);
    }

    #[test]
    fn arena_join_falls_back_when_budget_is_too_small() {
        let options = JoinExecutionOptions {
            use_arena: true,
            arena_budget_bytes: 1,
        };
        let (out, trace) =
            join_with_trace(&rushing(), &receiving(), &name_year(JoinKind::Left), options)
                .expect("fallback join");
        assert_eq!(out.len(), 3);
        assert_eq!(trace.output_rows, 3);
        assert!(!trace.used_arena);
        assert!(trace.estimated_bytes > options.arena_budget_bytes);
    }
}
