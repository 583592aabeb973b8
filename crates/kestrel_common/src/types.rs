use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PlanError;

/// Name of the bucket label column carried by windowed results.
pub const TIMESTAMP_COLUMN: &str = "_timestamp";

/// Half-open time window `[start, end)` in epoch seconds, with an optional
/// bucket step (also seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInterval {
    pub start: i64,
    pub end: i64,
    pub step: Option<i64>,
}

impl QueryInterval {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            step: None,
        }
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = if step > 0 { Some(step) } else { None };
        self
    }

    /// A bucket step, when present, must be positive.
    pub fn has_valid_step(&self) -> bool {
        self.step.map_or(true, |step| step > 0)
    }

    pub fn is_windowed(&self) -> bool {
        self.step.is_some()
    }

    /// Length of the window in seconds.
    pub fn length(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    /// Seconds covered by one output row: the step if windowed, else the whole window.
    pub fn bucket_length(&self) -> i64 {
        self.step.unwrap_or_else(|| self.length())
    }

    /// The same window moved back in time by `offset`.
    pub fn shifted_back(&self, offset: &TimeOffset) -> Self {
        Self {
            start: self.start - offset.seconds(),
            end: self.end - offset.seconds(),
            step: self.step,
        }
    }
}

/// A look-back duration such as `1h` or `-5m`.
///
/// The sign is accepted for readability but ignored: an offset always refers to
/// the past. `Display` yields the unsigned text, which doubles as the output
/// column name of offset queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeOffset {
    text: String,
    seconds: i64,
}

impl TimeOffset {
    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl FromStr for TimeOffset {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let unsigned = trimmed.strip_prefix('-').unwrap_or(trimmed);
        let invalid = || PlanError::InvalidOffset(s.to_string());

        let unit_pos = unsigned
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (digits, unit) = unsigned.split_at(unit_pos);
        let amount: i64 = digits.parse().map_err(|_| invalid())?;
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            _ => return Err(invalid()),
        };
        if amount == 0 {
            return Err(invalid());
        }
        let seconds = amount.checked_mul(multiplier).ok_or_else(invalid)?;
        Ok(Self {
            text: unsigned.to_string(),
            seconds,
        })
    }
}

impl fmt::Display for TimeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Binary arithmetic applied elementwise by the column operator library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    /// All arithmetic happens in double precision.
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ArithmeticOp::Add => lhs + rhs,
            ArithmeticOp::Sub => lhs - rhs,
            ArithmeticOp::Mul => lhs * rhs,
            ArithmeticOp::Div => lhs / rhs,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Sub => "-",
            ArithmeticOp::Mul => "*",
            ArithmeticOp::Div => "/",
        }
    }
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArithmeticOp::Add => "Add",
            ArithmeticOp::Sub => "Sub",
            ArithmeticOp::Mul => "Mul",
            ArithmeticOp::Div => "Div",
        };
        f.write_str(name)
    }
}

/// Threshold comparison used by filters and pushed-down predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn test(self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Lt => value < threshold,
            CompareOp::Lte => value <= threshold,
            CompareOp::Gt => value > threshold,
            CompareOp::Gte => value >= threshold,
            CompareOp::Eq => value == threshold,
            CompareOp::Ne => value != threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompareOp::Lt => "LT",
            CompareOp::Lte => "LTE",
            CompareOp::Gt => "GT",
            CompareOp::Gte => "GTE",
            CompareOp::Eq => "EQ",
            CompareOp::Ne => "NE",
        };
        f.write_str(name)
    }
}
