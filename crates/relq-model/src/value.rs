//! Runtime value types for predicates and materialized rows.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A runtime value carried by a predicate literal or a row field.
///
/// This enum represents all scalar values the query core can compare.
/// Integer variants compare and hash by their widened 64-bit value, so
/// `Int32(5)` and `Int64(5)` are the same value for set membership and
/// equality-map purposes. Floats never equal integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit floating point.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Timestamp as microseconds since Unix epoch.
    Timestamp(i64),
    /// UUID as 16 bytes.
    Uuid([u8; 16]),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64, widening Int32.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            Value::Int32(i) => Some(*i as i64),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as timestamp (microseconds since Unix epoch).
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Name of the value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
        }
    }

    /// Compare two values, returning their ordering if comparable.
    ///
    /// Integers compare across widths; all other comparisons require the
    /// same type. Incomparable pairs return `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int32(_) | Value::Int64(_), Value::Int32(_) | Value::Int64(_)) => {
                Some(self.as_i64()?.cmp(&other.as_i64()?))
            }
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int32(_) | Value::Int64(_), Value::Int32(_) | Value::Int64(_)) => {
                self.as_i64() == other.as_i64()
            }
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            _ => false,
        }
    }
}

// Floats are compared by bit pattern above, so the equivalence is total.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            // Both integer widths hash as the widened value so that
            // Int32(v) and Int64(v) land in the same bucket.
            Value::Int32(i) => {
                2u8.hash(state);
                (*i as i64).hash(state);
            }
            Value::Int64(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float64(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                5u8.hash(state);
                b.hash(state);
            }
            Value::Timestamp(t) => {
                6u8.hash(state);
                t.hash(state);
            }
            Value::Uuid(u) => {
                7u8.hash(state);
                u.hash(state);
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_integer_widening_equality() {
        assert_eq!(Value::Int32(5), Value::Int64(5));
        assert_eq!(Value::Int64(5), Value::Int32(5));
        assert_ne!(Value::Int32(5), Value::Int64(6));
    }

    #[test]
    fn test_float_never_equals_integer() {
        assert_ne!(Value::Float64(5.0), Value::Int64(5));
    }

    #[test]
    fn test_widened_hash_consistency() {
        let mut set = HashSet::new();
        set.insert(Value::Int64(42));
        assert!(set.contains(&Value::Int32(42)));
    }

    #[test]
    fn test_compare_cross_width() {
        assert_eq!(
            Value::Int32(3).compare(&Value::Int64(7)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Int64(7).compare(&Value::Int32(7)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_compare_incompatible_types() {
        assert_eq!(Value::Int32(1).compare(&Value::String("a".into())), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn test_string_ordering() {
        assert_eq!(
            Value::String("abc".into()).compare(&Value::String("abd".into())),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_float_bit_equality_is_total() {
        let nan = Value::Float64(f64::NAN);
        assert_eq!(nan, nan.clone());
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int32(9).as_i64(), Some(9));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::String("x".into()).as_str(), Some("x"));
        assert_eq!(Value::Timestamp(100).as_timestamp(), Some(100));
        assert_eq!(Value::Null.as_i64(), None);
        assert!(Value::Null.is_null());
    }
}
