#![forbid(unsafe_code)]

use lb_table::Record;
use lb_types::{DType, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Column {
        name: String,
    },
    Literal {
        value: Scalar,
    },
    Add {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Sub {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Mul {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Div {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Round {
        expr: Box<Expr>,
        digits: u32,
    },
    Coalesce {
        expr: Box<Expr>,
        value: Scalar,
    },
}

impl Expr {
    #[must_use]
    pub fn column(name: impl Into<String>) -> Self {
        Self::Column { name: name.into() }
    }

    #[must_use]
    pub fn literal(value: impl Into<Scalar>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    #[must_use]
    pub fn add(left: Self, right: Self) -> Self {
        Self::Add {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn sub(left: Self, right: Self) -> Self {
        Self::Sub {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn mul(left: Self, right: Self) -> Self {
        Self::Mul {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn div(left: Self, right: Self) -> Self {
        Self::Div {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn round(expr: Self, digits: u32) -> Self {
        Self::Round {
            expr: Box::new(expr),
            digits,
        }
    }

    #[must_use]
    pub fn coalesce(expr: Self, value: impl Into<Scalar>) -> Self {
        Self::Coalesce {
            expr: Box::new(expr),
            value: value.into(),
        }
    }

    /// Column names this expression reads, in first-reference order.
    #[must_use]
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Column { name } => {
                if !out.contains(&name.as_str()) {
                    out.push(name.as_str());
                }
            }
            Self::Literal { .. } => {}
            Self::Add { left, right }
            | Self::Sub { left, right }
            | Self::Mul { left, right }
            | Self::Div { left, right } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Self::Round { expr, .. } | Self::Coalesce { expr, .. } => expr.collect_columns(out),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("unknown column reference: {0}")]
    UnknownColumn(String),
    #[error("operand {value:?} of dtype {dtype:?} is not numeric")]
    NonNumeric { value: String, dtype: DType },
    #[error("integer overflow evaluating {op}")]
    Overflow { op: &'static str },
}

/// Name-based access to the values of one row.
pub trait RowLookup {
    fn lookup(&self, column: &str) -> Option<&Scalar>;
}

impl RowLookup for Record {
    fn lookup(&self, column: &str) -> Option<&Scalar> {
        self.get(column)
    }
}

#[derive(Debug, Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
}

impl ArithOp {
    fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
        }
    }

    fn apply_int(self, a: i64, b: i64) -> Option<i64> {
        match self {
            Self::Add => a.checked_add(b),
            Self::Sub => a.checked_sub(b),
            Self::Mul => a.checked_mul(b),
        }
    }

    fn apply_float(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
        }
    }
}

/// Evaluate `expr` against one row.
///
/// Missing operands propagate to `Null`. Division by zero (or by a missing
/// value) yields `Null` rather than an error or an infinity.
pub fn evaluate(expr: &Expr, row: &impl RowLookup) -> Result<Scalar, ExprError> {
    match expr {
        Expr::Column { name } => row
            .lookup(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownColumn(name.clone())),
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Add { left, right } => arith(ArithOp::Add, left, right, row),
        Expr::Sub { left, right } => arith(ArithOp::Sub, left, right, row),
        Expr::Mul { left, right } => arith(ArithOp::Mul, left, right, row),
        Expr::Div { left, right } => {
            let lhs = evaluate(left, row)?;
            let rhs = evaluate(right, row)?;
            if lhs.is_missing() || rhs.is_missing() {
                return Ok(Scalar::Null);
            }
            let denominator = numeric(&rhs)?;
            let numerator = numeric(&lhs)?;
            if denominator == 0.0 {
                return Ok(Scalar::Null);
            }
            Ok(Scalar::Float64(numerator / denominator))
        }
        Expr::Round { expr, digits } => match evaluate(expr, row)? {
            Scalar::Float64(v) if !v.is_nan() => Ok(Scalar::Float64(round_half_away(v, *digits))),
            Scalar::Utf8(v) => Err(ExprError::NonNumeric {
                value: v,
                dtype: DType::Utf8,
            }),
            other => Ok(other),
        },
        Expr::Coalesce { expr, value } => Ok(evaluate(expr, row)?.coalesce(value)),
    }
}

fn arith(op: ArithOp, left: &Expr, right: &Expr, row: &impl RowLookup) -> Result<Scalar, ExprError> {
    let lhs = evaluate(left, row)?;
    let rhs = evaluate(right, row)?;
    if lhs.is_missing() || rhs.is_missing() {
        return Ok(Scalar::Null);
    }
    if let (Scalar::Int64(a), Scalar::Int64(b)) = (&lhs, &rhs) {
        return op
            .apply_int(*a, *b)
            .map(Scalar::Int64)
            .ok_or(ExprError::Overflow { op: op.name() });
    }
    Ok(Scalar::Float64(op.apply_float(numeric(&lhs)?, numeric(&rhs)?)))
}

fn numeric(value: &Scalar) -> Result<f64, ExprError> {
    value.to_f64().map_err(|_| ExprError::NonNumeric {
        value: value.to_string(),
        dtype: value.dtype(),
    })
}

fn round_half_away(value: f64, digits: u32) -> f64 {
    let factor = 10_f64.powi(i32::try_from(digits).unwrap_or(i32::MAX));
    if !factor.is_finite() {
        return value;
    }
    (value * factor).round() / factor
}

// ── Predicates ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `column <op> value` filter over an output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: ComparisonOp,
    pub value: Scalar,
}

impl Predicate {
    #[must_use]
    pub fn new(column: impl Into<String>, op: ComparisonOp, value: impl Into<Scalar>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// A missing row value never satisfies the predicate.
    pub fn matches(&self, row: &impl RowLookup) -> Result<bool, ExprError> {
        let actual = row
            .lookup(&self.column)
            .ok_or_else(|| ExprError::UnknownColumn(self.column.clone()))?;
        let ordering = actual
            .compare(&self.value)
            .map_err(|_| ExprError::NonNumeric {
                value: actual.to_string(),
                dtype: actual.dtype(),
            })?;
        let Some(ordering) = ordering else {
            return Ok(false);
        };
        Ok(match self.op {
            ComparisonOp::Eq => ordering.is_eq(),
            ComparisonOp::Ne => ordering.is_ne(),
            ComparisonOp::Lt => ordering.is_lt(),
            ComparisonOp::Le => ordering.is_le(),
            ComparisonOp::Gt => ordering.is_gt(),
            ComparisonOp::Ge => ordering.is_ge(),
        })
    }
}

#[cfg(test)]
mod tests {
    use lb_table::Record;
    use lb_types::Scalar;

    use super::{ComparisonOp, Expr, ExprError, Predicate, evaluate};

    fn career_row() -> Record {
        Record::new()
            .with("name", "Adams")
            .with("rush_td", 12)
            .with("rec_td", 3)
            .with("yds", 1017)
            .with("att", 200)
            .with("avg", Scalar::Null)
    }

    #[test]
    fn add_keeps_integer_sums_integral() {
        let expr = Expr::add(Expr::column("rush_td"), Expr::column("rec_td"));
        assert_eq!(evaluate(&expr, &career_row()), Ok(Scalar::Int64(15)));
    }

    #[test]
    fn div_produces_float_ratio() {
        let expr = Expr::div(Expr::column("yds"), Expr::column("att"));
        assert_eq!(evaluate(&expr, &career_row()), Ok(Scalar::Float64(5.085)));
    }

    #[test]
    fn div_by_zero_yields_null() {
        let row = Record::new().with("yds", 40).with("att", 0);
        let expr = Expr::div(Expr::column("yds"), Expr::column("att"));
        assert_eq!(evaluate(&expr, &row), Ok(Scalar::Null));
    }

    #[test]
    fn null_operand_propagates() {
        let expr = Expr::add(Expr::column("avg"), Expr::literal(1));
        assert_eq!(evaluate(&expr, &career_row()), Ok(Scalar::Null));
    }

    #[test]
    fn coalesce_replaces_null_operand() {
        let expr = Expr::add(Expr::coalesce(Expr::column("avg"), 0), Expr::literal(1));
        assert_eq!(evaluate(&expr, &career_row()), Ok(Scalar::Int64(1)));
    }

    #[test]
    fn round_to_one_decimal() {
        let row = Record::new().with("yds", 1000).with("att", 3);
        let expr = Expr::round(Expr::div(Expr::column("yds"), Expr::column("att")), 1);
        assert_eq!(evaluate(&expr, &row), Ok(Scalar::Float64(333.3)));
        let int = Expr::round(Expr::column("yds"), 1);
        assert_eq!(evaluate(&int, &career_row()), Ok(Scalar::Int64(1017)));
    }

    #[test]
    fn text_operand_is_rejected() {
        let expr = Expr::add(Expr::column("name"), Expr::literal(1));
        assert!(matches!(
            evaluate(&expr, &career_row()),
            Err(ExprError::NonNumeric { .. })
        ));
    }

    #[test]
    fn integer_overflow_is_reported() {
        let expr = Expr::mul(Expr::literal(i64::MAX), Expr::literal(2));
        assert_eq!(
            evaluate(&expr, &Record::new()),
            Err(ExprError::Overflow { op: "mul" })
        );
    }

    #[test]
    fn unknown_column_is_reported() {
        let expr = Expr::column("sacks");
        assert_eq!(
            evaluate(&expr, &career_row()),
            Err(ExprError::UnknownColumn("sacks".to_owned()))
        );
    }

    #[test]
    fn referenced_columns_are_deduplicated_in_order() {
        let expr = Expr::div(
            Expr::add(Expr::column("a"), Expr::column("b")),
            Expr::add(Expr::column("a"), Expr::literal(1)),
        );
        assert_eq!(expr.referenced_columns(), vec!["a", "b"]);
    }

    #[test]
    fn expr_deserializes_from_tagged_json() {
        let json = r#"{
            "kind": "add",
            "left": {"kind": "column", "name": "rush_td"},
            "right": {"kind": "column", "name": "rec_td"}
        }"#;
        let expr: Expr = serde_json::from_str(json).expect("parse");
        assert_eq!(expr, Expr::add(Expr::column("rush_td"), Expr::column("rec_td")));
    }

    #[test]
    fn predicate_compares_numbers_and_skips_nulls() {
        let row = career_row();
        assert!(Predicate::new("att", ComparisonOp::Ge, 100).matches(&row).expect("ge"));
        assert!(!Predicate::new("att", ComparisonOp::Lt, 100).matches(&row).expect("lt"));
        assert!(!Predicate::new("avg", ComparisonOp::Ne, 0).matches(&row).expect("null"));
        assert!(Predicate::new("name", ComparisonOp::Eq, "Adams").matches(&row).expect("eq"));
    }
}
