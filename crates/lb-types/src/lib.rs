#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Int64,
    Float64,
    Utf8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null => DType::Null,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
        }
    }

    /// `Null` and NaN floats are both missing.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int64(_) | Self::Float64(_))
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (a, b) if a.is_missing() && b.is_missing() => true,
            (Self::Int64(a), Self::Float64(b)) | (Self::Float64(b), Self::Int64(a)) => {
                (*a as f64) == *b
            }
            _ => self == other,
        }
    }

    #[must_use]
    pub fn coalesce(&self, other: &Self) -> Self {
        if self.is_missing() {
            other.clone()
        } else {
            self.clone()
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null => Err(TypeError::ValueIsMissing),
            Self::Utf8(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Utf8,
            }),
        }
    }

    /// Ordering between two present values: numbers compare numerically
    /// across `Int64`/`Float64`, text compares lexicographically.
    ///
    /// Returns `None` when either side is missing; mixing text and numbers is
    /// an error.
    pub fn compare(&self, other: &Self) -> Result<Option<Ordering>, TypeError> {
        if self.is_missing() || other.is_missing() {
            return Ok(None);
        }
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => Ok(Some(a.cmp(b))),
            (Self::Utf8(a), Self::Utf8(b)) => Ok(Some(a.cmp(b))),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                Ok(a.to_f64()?.partial_cmp(&b.to_f64()?))
            }
            (a, b) => Err(TypeError::IncompatibleDtypes {
                left: a.dtype(),
                right: b.dtype(),
            }),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) if v.is_nan() => Ok(()),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int64(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtype coercion from {left:?} to {right:?} has no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("value {value:?} has non-numeric dtype {dtype:?}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing")]
    ValueIsMissing,
}

pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Float64, Int64, Null};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Null, other) | (other, Null) => other,
        (Int64, Float64) | (Float64, Int64) => Float64,
        _ => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

pub fn infer_dtype<'a>(values: impl IntoIterator<Item = &'a Scalar>) -> Result<DType, TypeError> {
    let mut current = DType::Null;
    for value in values {
        current = common_dtype(current, value.dtype())?;
    }
    Ok(current)
}

// ── Key parts ──────────────────────────────────────────────────────────

/// Borrowed, hashable view of one key value.
///
/// Integral floats normalize to `Int64` so `2020` and `2020.0` land in the
/// same group or join bucket. All missing values collapse to `Null`.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum GroupKeyRef<'a> {
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
    Null,
}

impl<'a> GroupKeyRef<'a> {
    #[must_use]
    pub fn from_scalar(key: &'a Scalar) -> Self {
        match key {
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) if v.is_nan() => Self::Null,
            Scalar::Float64(v) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 {
                    Self::Int64(*v as i64)
                } else {
                    Self::FloatBits(v.to_bits())
                }
            }
            Scalar::Utf8(v) => Self::Utf8(v.as_str()),
            Scalar::Null => Self::Null,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

// ── Null-aware reductions ──────────────────────────────────────────────

/// Running state for one aggregate column of one group.
///
/// Integer sums stay exact until they overflow `i64`, after which the sum
/// continues in `f64`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    int_sum: i64,
    float_sum: f64,
    saw_float: bool,
    overflowed: bool,
    count: usize,
    min: Option<Scalar>,
    max: Option<Scalar>,
}

impl Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a value into the numeric reductions (sum, avg) and count.
    pub fn push_numeric(&mut self, value: &Scalar) -> Result<(), TypeError> {
        match value {
            v if v.is_missing() => {}
            Scalar::Int64(v) => {
                self.count += 1;
                if self.overflowed {
                    self.float_sum += *v as f64;
                } else if let Some(sum) = self.int_sum.checked_add(*v) {
                    self.int_sum = sum;
                } else {
                    self.overflowed = true;
                    self.float_sum += self.int_sum as f64 + *v as f64;
                    self.int_sum = 0;
                }
            }
            Scalar::Float64(v) => {
                self.count += 1;
                self.saw_float = true;
                self.float_sum += *v;
            }
            other => {
                return Err(TypeError::NonNumericValue {
                    value: other.to_string(),
                    dtype: other.dtype(),
                });
            }
        }
        Ok(())
    }

    /// Count a value without interpreting it.
    pub fn push_present(&mut self, value: &Scalar) {
        if !value.is_missing() {
            self.count += 1;
        }
    }

    /// Feed a value into count, min and max. Accepts text.
    pub fn push_ordered(&mut self, value: &Scalar) -> Result<(), TypeError> {
        if value.is_missing() {
            return Ok(());
        }
        self.count += 1;
        let replace_min = match &self.min {
            Some(current) => current.compare(value)? == Some(Ordering::Greater),
            None => true,
        };
        if replace_min {
            self.min = Some(value.clone());
        }
        let replace_max = match &self.max {
            Some(current) => current.compare(value)? == Some(Ordering::Less),
            None => true,
        };
        if replace_max {
            self.max = Some(value.clone());
        }
        Ok(())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Sum with nulls coalesced to zero. An empty group sums to `Int64(0)`.
    #[must_use]
    pub fn sum(&self) -> Scalar {
        if self.saw_float || self.overflowed {
            Scalar::Float64(self.float_sum + self.int_sum as f64)
        } else {
            Scalar::Int64(self.int_sum)
        }
    }

    /// Mean over non-null values; `Null` instead of dividing by zero.
    #[must_use]
    pub fn mean(&self) -> Scalar {
        if self.count == 0 {
            return Scalar::Null;
        }
        let total = self.float_sum + self.int_sum as f64;
        Scalar::Float64(total / self.count as f64)
    }

    #[must_use]
    pub fn min(&self) -> Scalar {
        self.min.clone().unwrap_or(Scalar::Null)
    }

    #[must_use]
    pub fn max(&self) -> Scalar {
        self.max.clone().unwrap_or(Scalar::Null)
    }
}
