use log::warn;
use serde::{Deserialize, Serialize};

use crate::util::f64_to_i64_safe;

/// The value of a single flag variation.
///
/// Variation values are declared in the flag configuration and are opaque to
/// the evaluator; hosts read them back through the typed accessors.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    /// A boolean value.
    Bool(bool),
    /// A string value.
    Str(String),
    /// An integer value.
    ///
    /// Listed before `Float` so that untagged deserialization keeps whole
    /// JSON numbers integral.
    Int(i64),
    /// A floating-point value.
    Float(f64),
    /// Any other JSON structure (nulls, arrays, objects).
    Json(serde_json::Value),
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> FlagValue {
        FlagValue::Bool(b)
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> FlagValue {
        FlagValue::Str(s.to_owned())
    }
}

impl From<String> for FlagValue {
    fn from(s: String) -> FlagValue {
        FlagValue::Str(s)
    }
}

impl From<f64> for FlagValue {
    fn from(f: f64) -> FlagValue {
        FlagValue::Float(f)
    }
}

impl From<i64> for FlagValue {
    fn from(i: i64) -> FlagValue {
        FlagValue::Int(i)
    }
}

impl From<serde_json::Value> for FlagValue {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Bool(b) => b.into(),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i.into()
                } else if let Some(f) = n.as_f64() {
                    f.into()
                } else {
                    warn!("number {} cannot be represented, converting to string", n);
                    FlagValue::Json(n.to_string().into())
                }
            }
            Value::String(s) => s.into(),
            Value::Null | Value::Object(_) | Value::Array(_) => FlagValue::Json(v),
        }
    }
}

impl FlagValue {
    /// Returns the contained bool, or None (with a warning) for any other
    /// variation type.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => {
                warn!("variation type is not bool but {:?}", self);
                None
            }
        }
    }

    /// Returns the contained string, or None (with a warning) for any other
    /// variation type.
    pub fn as_string(&self) -> Option<String> {
        match self {
            FlagValue::Str(s) => Some(s.clone()),
            _ => {
                warn!("variation type is not string but {:?}", self);
                None
            }
        }
    }

    /// Returns the contained number as a float, or None (with a warning) for
    /// any other variation type.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            FlagValue::Float(f) => Some(*f),
            FlagValue::Int(i) => Some(*i as f64),
            _ => {
                warn!("variation type is not numeric but {:?}", self);
                None
            }
        }
    }

    /// Returns the contained number as an integer, truncating a float if it
    /// is small enough to convert exactly.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(i) => Some(*i),
            FlagValue::Float(f) => f64_to_i64_safe(*f),
            _ => {
                warn!("variation type is not numeric but {:?}", self);
                None
            }
        }
    }

    /// Returns any variation value as a JSON value.
    pub fn as_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FlagValue::Bool(b) => Value::from(*b),
            FlagValue::Str(s) => Value::from(s.as_str()),
            FlagValue::Float(f) => Value::from(*f),
            FlagValue::Int(i) => Value::from(*i),
            FlagValue::Json(v) => v.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn float_to_int_refuses_imprecise_values() {
        let test_cases = vec![
            (1.99, Some(1)),
            (9007199254740990.0, Some(9007199254740990)),
            (9007199254740991.0, Some(9007199254740991)),
            (9007199254740992.0, None),
            (-1.99, Some(-1)),
            (-9007199254740991.0, Some(-9007199254740991)),
            (-9007199254740992.0, None),
        ];
        for (have, expect) in test_cases {
            assert_that!(FlagValue::Float(have).as_int()).is_equal_to(expect);
        }
    }

    #[test]
    fn json_numbers_become_ints_when_possible() {
        assert_eq!(FlagValue::from(serde_json::json!(3)), FlagValue::Int(3));
        assert_eq!(FlagValue::from(serde_json::json!(3.5)), FlagValue::Float(3.5));
        assert_eq!(FlagValue::from(serde_json::json!("x")), FlagValue::Str("x".into()));
        assert_eq!(
            FlagValue::from(serde_json::json!({"a": 1})),
            FlagValue::Json(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn typed_accessors_reject_other_types() {
        assert_that!(FlagValue::Bool(true).as_string()).is_none();
        assert_that!(FlagValue::Str("t".into()).as_bool()).is_none();
        assert_that!(FlagValue::Bool(true).as_float()).is_none();
        assert_that!(FlagValue::Int(3).as_float()).contains_value(3.0);
    }
}
