use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use crate::core::{DbError, Result};

/// A typed scalar carried by entity fields, restriction parameters and
/// statement bind parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Total ordering used by sorting and range restrictions. NULL sorts
    /// after every other value; integers and floats compare numerically and
    /// dates compare with the date part of timestamps.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        use Value::*;

        let ordering = match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => compare_floats(*a, *b),
            (Integer(a), Float(b)) => compare_floats(*a as f64, *b),
            (Float(a), Integer(b)) => compare_floats(*a, *b as f64),

            (Text(a), Text(b)) => a.cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),

            (Date(a), Date(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Date(a), Timestamp(b)) => a.cmp(&b.date()),
            (Timestamp(a), Date(b)) => a.date().cmp(b),

            _ => {
                return Err(DbError::TypeMismatch(format!(
                    "{} and {} values are not comparable",
                    self.type_name(),
                    other.type_name()
                )));
            }
        };
        Ok(ordering)
    }

    /// SQL type name of the value, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Text(_) => "TEXT",
            Value::Boolean(_) => "BOOLEAN",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
        }
    }

    /// Integer view of the value. Floats convert only when they are whole
    /// and within range.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Integer(i) => Some(i),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() <= i64::MAX as f64 => {
                Some(f as i64)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Integer(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::Text(text) = self { Some(text) } else { None }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Boolean(flag) = self { Some(*flag) } else { None }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(date) => Some(*date),
            Value::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    /// Lower-cases text values; every other value is returned unchanged.
    pub fn to_lowercase(&self) -> Value {
        match self {
            Value::Text(text) => Value::Text(text.to_lowercase()),
            other => other.clone(),
        }
    }

    fn is_temporal(&self) -> bool {
        matches!(self, Value::Date(_) | Value::Timestamp(_))
    }
}

fn compare_floats(a: f64, b: f64) -> Ordering {
    // NaN sorts after every number and equals itself
    a.partial_cmp(&b)
        .unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}

// Equality follows `compare`, except that dates never equal timestamps so
// that it stays consistent with `Hash`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.is_null() || other.is_null() {
            return self.is_null() && other.is_null();
        }
        if self.is_temporal() && std::mem::discriminant(self) != std::mem::discriminant(other) {
            return false;
        }
        matches!(self.compare(other), Ok(Ordering::Equal))
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Integer(i) => {
                state.write_u8(1);
                i.hash(state);
            }
            // whole floats hash like the equal integer
            Value::Float(f) => match self.as_i64() {
                Some(i) => {
                    state.write_u8(1);
                    i.hash(state);
                }
                None if f.is_nan() => state.write_u8(2),
                None => {
                    state.write_u8(2);
                    f.to_bits().hash(state);
                }
            },
            Value::Text(text) => {
                state.write_u8(3);
                text.hash(state);
            }
            Value::Boolean(flag) => {
                state.write_u8(4);
                flag.hash(state);
            }
            Value::Date(date) => {
                state.write_u8(5);
                date.hash(state);
            }
            Value::Timestamp(ts) => {
                state.write_u8(6);
                ts.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) if x.is_nan() => f.write_str("NaN"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(text) => f.write_str(text),
            Value::Boolean(flag) => write!(f, "{flag}"),
            Value::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

macro_rules! value_from {
    ($($source:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from(value: $source) -> Self {
                    Value::$variant(value $(as $cast)?)
                }
            }
        )*
    };
}

value_from! {
    i64 => Integer,
    i32 => Integer as i64,
    f64 => Float,
    String => Text,
    bool => Boolean,
    NaiveDate => Date,
    NaiveDateTime => Timestamp,
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}
