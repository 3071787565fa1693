use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// An update sequence token.
///
/// CouchDB 0.x and 1.x servers send sequence ids as numbers, CouchDB >= 2.0
/// sends opaque strings such as `"2-8551c0db7ba8551c0"`. The token is never
/// interpreted by this crate; its only guaranteed property is the server's
/// own ordering. Decoding preserves the wire type: a string token stays a
/// string, a number stays a number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Seq {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Seq {
    /// Returns the token as a string slice if the server sent a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Seq::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seq::Int(n) => write!(f, "{n}"),
            Seq::Float(n) => write!(f, "{n}"),
            Seq::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Seq {
    fn from(s: &str) -> Self {
        Seq::Text(s.to_string())
    }
}

impl From<i64> for Seq {
    fn from(n: i64) -> Self {
        Seq::Int(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_integer() {
        let seq: Seq = serde_json::from_str("42").unwrap();
        assert_eq!(seq, Seq::Int(42));
    }

    #[test]
    fn decodes_float() {
        let seq: Seq = serde_json::from_str("1.5").unwrap();
        assert_eq!(seq, Seq::Float(1.5));
    }

    #[test]
    fn decodes_string_without_coercion() {
        let seq: Seq = serde_json::from_str(r#""2-8551c0db7ba8551c0""#).unwrap();
        assert_eq!(seq, Seq::Text("2-8551c0db7ba8551c0".to_string()));
    }

    #[test]
    fn numeric_looking_string_stays_a_string() {
        let seq: Seq = serde_json::from_str(r#""99""#).unwrap();
        assert_eq!(seq.as_str(), Some("99"));
    }

    #[test]
    fn round_trips_each_kind() {
        for json in ["7", "2.25", r#""99-7877550961db7b""#] {
            let seq: Seq = serde_json::from_str(json).unwrap();
            assert_eq!(serde_json::to_string(&seq).unwrap(), json);
        }
    }
}
