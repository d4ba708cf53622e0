//! Persisted blob codec.
//!
//! The blob is a JSON object mapping source name to an array of records. This
//! is the only place untrusted persisted data is inspected: anything that does
//! not fit the schema is dropped here, so the registry only ever holds typed,
//! well-formed records.

use anyhow::{Context, Result};
use serde_json::Value;

use super::model::{ClickMap, ClickRecord};

/// A decoded blob plus what had to be thrown away to get it.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    pub clicks: ClickMap,
    /// Configured sources whose value was present but not an array.
    pub reset_sources: Vec<String>,
    /// Array entries that were null or did not parse as a record.
    pub dropped_entries: usize,
}

/// Decode `raw`, keeping only the named sources. Every requested source is
/// present in the result; missing or non-array values become empty.
/// Fails only when `raw` is not a JSON object at all.
pub fn decode<'a, I>(raw: &str, sources: I) -> Result<Decoded>
where
    I: IntoIterator<Item = &'a str>,
{
    let parsed: Value = serde_json::from_str(raw).context("parse persisted clicks")?;
    let Value::Object(mut root) = parsed else {
        anyhow::bail!("persisted clicks are not a JSON object");
    };

    let mut out = Decoded::default();
    for name in sources {
        let records = match root.remove(name) {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                let total = items.len();
                let records: Vec<ClickRecord> = items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value(item).ok())
                    .collect();
                out.dropped_entries += total - records.len();
                records
            }
            Some(_) => {
                out.reset_sources.push(name.to_owned());
                Vec::new()
            }
        };
        out.clicks.insert(name.to_owned(), records);
    }
    Ok(out)
}

pub fn encode(clicks: &ClickMap) -> Result<String> {
    serde_json::to_string(clicks).context("encode clicks")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_requested_sources_only() {
        let raw = r#"{
            "gclid": [{"value":"a","timestamp":1,"expiresAt":2,"landing":"l","referrer":"r"}],
            "stale": [{"value":"b","timestamp":1,"expiresAt":2,"landing":"","referrer":""}]
        }"#;
        let d = decode(raw, ["gclid", "fbclid"]).unwrap();
        assert_eq!(d.clicks.len(), 2);
        assert_eq!(d.clicks["gclid"][0].value, "a");
        assert!(d.clicks["fbclid"].is_empty());
        assert!(!d.clicks.contains_key("stale"));
    }

    #[test]
    fn non_array_source_resets() {
        let d = decode(r#"{"gclid":{"value":"x"},"fbclid":"nope"}"#, ["gclid", "fbclid"]).unwrap();
        assert!(d.clicks.values().all(Vec::is_empty));
        assert_eq!(d.reset_sources, vec!["gclid".to_string(), "fbclid".to_string()]);
    }

    #[test]
    fn drops_null_and_malformed_entries() {
        let raw = r#"{"gclid":[null,{"value":"ok","timestamp":1,"expiresAt":9},{"timestamp":"x"}]}"#;
        let d = decode(raw, ["gclid"]).unwrap();
        assert_eq!(d.clicks["gclid"].len(), 1);
        assert_eq!(d.clicks["gclid"][0].landing, "");
        assert_eq!(d.dropped_entries, 2);
    }

    #[test]
    fn rejects_non_object() {
        assert!(decode("not json", ["gclid"]).is_err());
        assert!(decode("[1,2]", ["gclid"]).is_err());
    }

    #[test]
    fn encode_matches_browser_layout() {
        let mut clicks = ClickMap::new();
        clicks.insert(
            "gclid".into(),
            vec![ClickRecord {
                value: "abc".into(),
                timestamp: 1,
                expires_at: 2,
                landing: "https://x.test/?gclid=abc".into(),
                referrer: String::new(),
            }],
        );
        let raw = encode(&clicks).unwrap();
        assert_eq!(
            raw,
            r#"{"gclid":[{"value":"abc","timestamp":1,"expiresAt":2,"landing":"https://x.test/?gclid=abc","referrer":""}]}"#
        );
        assert_eq!(decode(&raw, ["gclid"]).unwrap().clicks, clicks);
    }
}
