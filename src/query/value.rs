//! Scalar values bound as statement parameters and read back from rows.
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::catalog::ScalarType;

/// A single bound parameter or cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean, bound as 0/1.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Binary payload.
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// True for [`SqlValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Converts a JSON operand to the column's scalar type.
    ///
    /// Numeric columns turn numeric strings into numbers, boolean columns
    /// accept `true/false/1/0` spellings, and everything else binds as text.
    pub fn coerce(value: &Json, ty: ScalarType) -> SqlValue {
        match (value, ty) {
            (Json::Null, _) => SqlValue::Null,
            (Json::String(s), ScalarType::Int | ScalarType::Float) => parse_number(s.trim())
                .unwrap_or_else(|| SqlValue::Text(s.clone())),
            (Json::Number(_), ScalarType::Int | ScalarType::Float) => SqlValue::from_json(value),
            (Json::Bool(b), _) => SqlValue::Bool(*b),
            (other, ScalarType::Bool) => match parse_bool(other) {
                Some(b) => SqlValue::Bool(b),
                None => SqlValue::from_json(other),
            },
            (Json::Number(n), _) => SqlValue::Text(n.to_string()),
            (Json::String(s), _) => SqlValue::Text(s.clone()),
            (other @ (Json::Array(_) | Json::Object(_)), _) => SqlValue::Text(other.to_string()),
        }
    }

    /// Converts a JSON value without a target type.
    pub fn from_json(value: &Json) -> SqlValue {
        match value {
            Json::Null => SqlValue::Null,
            Json::Bool(b) => SqlValue::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }

    /// Renders a cell as JSON, using the column type when known.
    pub fn to_json(&self, ty: Option<ScalarType>) -> Json {
        match (self, ty) {
            (SqlValue::Null, _) => Json::Null,
            (SqlValue::Bool(b), _) => Json::Bool(*b),
            (SqlValue::Int(i), Some(ScalarType::Bool)) => Json::Bool(*i != 0),
            (SqlValue::Int(i), _) => Json::from(*i),
            (SqlValue::Float(f), _) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            (SqlValue::Text(s), Some(ScalarType::Json)) => {
                serde_json::from_str(s).unwrap_or_else(|_| Json::String(s.clone()))
            }
            (SqlValue::Text(s), Some(ScalarType::Bool)) => match s.as_str() {
                "1" | "true" => Json::Bool(true),
                "0" | "false" => Json::Bool(false),
                _ => Json::String(s.clone()),
            },
            (SqlValue::Text(s), _) => Json::String(s.clone()),
            (SqlValue::Bytes(b), _) => {
                Json::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }

    /// Identity key used to deduplicate hydrated records.
    pub fn identity(&self) -> String {
        match self {
            SqlValue::Null => "n".to_string(),
            SqlValue::Bool(b) => format!("i:{}", *b as i64),
            SqlValue::Int(i) => format!("i:{i}"),
            SqlValue::Float(f) => format!("f:{f}"),
            SqlValue::Text(s) => format!("s:{s}"),
            SqlValue::Bytes(b) => format!("b:{b:?}"),
        }
    }
}

fn parse_number(text: &str) -> Option<SqlValue> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(SqlValue::Int(i));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(SqlValue::Float)
}

fn parse_bool(value: &Json) -> Option<bool> {
    match value {
        Json::Bool(b) => Some(*b),
        Json::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Json::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// JavaScript-like truthiness for flag operands such as `is_null`.
pub fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !(s.is_empty() || s == "false" || s == "0"),
        Json::Array(_) | Json::Object(_) => true,
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float(value)
    }
}
