use std::collections::BTreeMap;

use serde_json::Value;
use url::form_urlencoded;

use crate::Error;

/// Query options for a feed request, e.g. `feed`, `since`, `include_docs`.
///
/// CouchDB expects most values as plain query parameters and a few (view
/// keys and similar) as URL-encoded JSON. See
/// <http://docs.couchdb.org/en/latest/api/database/changes.html> for the
/// options understood by the changes feed.
#[derive(Default, Debug, Clone)]
pub struct Options(BTreeMap<String, Value>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option, replacing any previous value for the key.
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encodes the options as a URL query string.
    ///
    /// Keys are emitted in sorted order, so equal options always produce the
    /// same URL. String values are escaped as-is, bools and numbers are
    /// emitted literally. Keys listed in `jskeys` are the exception: their
    /// values are always JSON-encoded, strings included.
    pub fn encode(&self, jskeys: &[&str]) -> Result<String, Error> {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.0 {
            if jskeys.contains(&key.as_str()) {
                let json = serde_json::to_string(value).map_err(|err| Error::InvalidOption {
                    key: key.clone(),
                    reason: err.to_string(),
                })?;
                query.append_pair(key, &json);
                continue;
            }
            let literal = match value {
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Null => {
                    return Err(Error::InvalidOption {
                        key: key.clone(),
                        reason: "value is null".into(),
                    })
                }
                Value::Array(_) | Value::Object(_) => {
                    return Err(Error::InvalidOption {
                        key: key.clone(),
                        reason: "unsupported type".into(),
                    })
                }
            };
            query.append_pair(key, &literal);
        }
        Ok(query.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_keys_in_sorted_order() {
        let opts = Options::new()
            .set("since", 0)
            .set("feed", "continuous")
            .set("include_docs", true);
        assert_eq!(
            opts.encode(&[]).unwrap(),
            "feed=continuous&include_docs=true&since=0"
        );
    }

    #[test]
    fn escapes_string_values() {
        let opts = Options::new().set("filter", "app/by name");
        assert_eq!(opts.encode(&[]).unwrap(), "filter=app%2Fby+name");
    }

    #[test]
    fn jskeys_are_json_encoded() {
        let opts = Options::new().set("key", "doc");
        assert_eq!(opts.encode(&["key"]).unwrap(), "key=%22doc%22");
        assert_eq!(opts.encode(&[]).unwrap(), "key=doc");
    }

    #[test]
    fn rejects_null_and_composite_values() {
        let opts = Options::new().set("bad", Value::Null);
        assert!(matches!(
            opts.encode(&[]),
            Err(Error::InvalidOption { .. })
        ));
        let opts = Options::new().set("bad", serde_json::json!([1, 2]));
        assert!(matches!(
            opts.encode(&[]),
            Err(Error::InvalidOption { .. })
        ));
    }

    #[test]
    fn set_replaces_previous_value() {
        let opts = Options::new().set("feed", "normal").set("feed", "continuous");
        assert_eq!(opts.encode(&[]).unwrap(), "feed=continuous");
    }
}
