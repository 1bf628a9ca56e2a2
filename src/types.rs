use std::fmt;

use strum::{Display, EnumString};

/// Tokens treated as "no value" when reading text fields.
pub const MISSING_VALUES: [&str; 12] = [
    "", ".", "NA", "N/A", "n/a", "nan", "-nan", "NaN", "-NaN", "null", "NULL", "None",
];

/// How a missing value is rendered in written output.
pub const MISSING_OUTPUT: &str = ".";

/// Field separator of a delimited text layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Delimiter {
    #[default]
    Tab,
    Comma,
    /// Runs of spaces and/or tabs, leading and trailing whitespace ignored (PLINK style).
    Whitespace,
}

impl Delimiter {
    pub fn split(self, line: &str) -> Vec<&str> {
        match self {
            Delimiter::Tab => line.split('\t').collect(),
            Delimiter::Comma => line.split(',').collect(),
            Delimiter::Whitespace => line.split_whitespace().collect(),
        }
    }

    /// Best single guess for a line of unknown layout.
    pub fn guess(line: &str) -> Self {
        if line.contains('\t') {
            Delimiter::Tab
        } else if line.contains(',') {
            Delimiter::Comma
        } else {
            Delimiter::Whitespace
        }
    }
}

/// How the p-value column is expressed in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PvalueScale {
    #[default]
    Linear,
    /// `-log10(p)`; converted to linear space while parsing.
    #[strum(to_string = "neg_log10", serialize = "neg_log_pvalue")]
    NegLog10,
}

/// Case policy applied to chromosome names after the `chr` prefix is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChromCase {
    #[default]
    Preserve,
    Upper,
}

/// A dynamically typed field value, as returned by name-based record access.
#[derive(Debug, Clone)]
pub enum Value {
    Missing,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Missing | Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret a raw text field: missing sentinels become `Missing`, integers and
    /// floats are typed, anything else is kept as text.
    pub fn from_field<S: AsRef<str>>(raw: &str, missing: &[S]) -> Self {
        let raw = raw.trim();
        if is_missing(raw, missing) {
            Value::Missing
        } else if let Ok(v) = raw.parse::<i64>() {
            Value::Int(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            Value::Float(v)
        } else {
            Value::Text(raw.to_owned())
        }
    }
}

pub(crate) fn is_missing<S: AsRef<str>>(raw: &str, missing: &[S]) -> bool {
    missing.iter().any(|m| m.as_ref() == raw)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Missing, Value::Missing) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => f.write_str(MISSING_OUTPUT),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write_float(f, *v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

// Shortest round-trip representation; exponent notation outside the range where
// plain decimals stay readable (f64 `Display` never switches to exponents).
fn write_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    let magnitude = v.abs();
    if v == 0.0 || !v.is_finite() || (1e-4..1e15).contains(&magnitude) {
        write!(f, "{}", v)
    } else {
        write!(f, "{:e}", v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Missing, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn missing_sentinels_are_recognized() {
        assert!(Value::from_field("NA", &MISSING_VALUES).is_missing());
        assert!(Value::from_field(" . ", &MISSING_VALUES).is_missing());
        assert_eq!(Value::from_field("12", &MISSING_VALUES), Value::Int(12));
        assert_eq!(Value::from_field("rs12", &MISSING_VALUES), Value::from("rs12"));
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_ne!(Value::from("3"), Value::Int(3));
        assert_ne!(Value::Missing, Value::Float(0.0));
    }

    #[test]
    fn floats_render_compactly() {
        assert_eq!(Value::Float(0.05).to_string(), "0.05");
        assert_eq!(Value::Float(5e-8).to_string(), "5e-8");
        assert_eq!(Value::Float(1e-300).to_string(), "1e-300");
        assert_eq!(Value::Missing.to_string(), ".");
    }

    #[test]
    fn configuration_enums_parse_from_strings() {
        assert_eq!(Delimiter::from_str("comma").unwrap(), Delimiter::Comma);
        assert_eq!(
            PvalueScale::from_str("neg_log_pvalue").unwrap(),
            PvalueScale::NegLog10
        );
        assert_eq!(ChromCase::Upper.to_string(), "upper");
    }

    #[test]
    fn whitespace_delimiter_ignores_padding() {
        assert_eq!(
            Delimiter::Whitespace.split("  1   rs1  100 "),
            vec!["1", "rs1", "100"]
        );
        assert_eq!(Delimiter::guess("a,b"), Delimiter::Comma);
    }
}
