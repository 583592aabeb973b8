use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single scalar value flowing through plans, filters and key columns.
///
/// Metric values are always numeric; `Text` only shows up in filter literals
/// and group-by dimension keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Null,
    Int64(i64),
    Float64(f64),
    Text(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Datum::Int64(_) | Datum::Float64(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view used by all arithmetic: integers widen to double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render as a SQL literal (single-quoted text, bare numbers).
    pub fn to_sql_literal(&self) -> String {
        match self {
            Datum::Null => "NULL".to_string(),
            Datum::Int64(v) => v.to_string(),
            Datum::Float64(v) => format_float(*v),
            Datum::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float64(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::Text(v)
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Key identity, not SQL three-valued logic: two missing keys match.
            (Datum::Null, Datum::Null) => true,
            (Datum::Int64(a), Datum::Int64(b)) => a == b,
            (Datum::Float64(a), Datum::Float64(b)) => a.to_bits() == b.to_bits() || a == b,
            (Datum::Int64(a), Datum::Float64(b)) => (*a as f64) == *b,
            (Datum::Float64(a), Datum::Int64(b)) => *a == (*b as f64),
            (Datum::Text(a), Datum::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Integral floats hash like the equal integer so Int64(2) == Float64(2.0)
        // stays consistent with the hash.
        match self {
            Datum::Null => 0u8.hash(state),
            Datum::Int64(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            Datum::Float64(v) => {
                if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                    1u8.hash(state);
                    (*v as i64).hash(state);
                } else {
                    2u8.hash(state);
                    v.to_bits().hash(state);
                }
            }
            Datum::Text(s) => {
                3u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => None,
            (Datum::Int64(a), Datum::Int64(b)) => a.partial_cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.partial_cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}
