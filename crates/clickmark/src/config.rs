use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// 30 days in milliseconds.
pub const DEFAULT_EXPIRATION_MS: u64 = 2_592_000_000;
pub const DEFAULT_MAX_CLICKS: usize = 100;
pub const DEFAULT_STORAGE_KEY: &str = "_act_";

/// One tracked identifier as written by the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClickIdConfig {
    pub name: String,
    pub expiration_ms: Option<u64>,
    pub max_clicks: Option<usize>,
}

impl ClickIdConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expiration_ms: None,
            max_clicks: None,
        }
    }

    pub fn expiration_ms(mut self, ms: u64) -> Self {
        self.expiration_ms = Some(ms);
        self
    }

    pub fn max_clicks(mut self, max: usize) -> Self {
        self.max_clicks = Some(max);
        self
    }
}

/// Resolved, immutable per-source limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub name: String,
    pub expires_after_ms: u64,
    pub max_records: usize,
}

impl SourceConfig {
    /// Limits for a source nobody configured.
    pub fn ad_hoc(name: &str, expires_after_ms: Option<u64>) -> Self {
        Self {
            name: name.to_owned(),
            expires_after_ms: expires_after_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_EXPIRATION_MS),
            max_records: DEFAULT_MAX_CLICKS,
        }
    }
}

impl From<&ClickIdConfig> for SourceConfig {
    fn from(c: &ClickIdConfig) -> Self {
        Self {
            name: c.name.clone(),
            expires_after_ms: c.expiration_ms.unwrap_or(DEFAULT_EXPIRATION_MS),
            // A zero cap would silently discard every capture; treat it as unset.
            max_records: c
                .max_clicks
                .filter(|max| *max > 0)
                .unwrap_or(DEFAULT_MAX_CLICKS),
        }
    }
}

/// Registry construction options. Deserializable from TOML:
///
/// ```toml
/// storage_key = "_act_"
/// check_hash = true
///
/// [[click_id]]
/// name = "gclid"
/// expiration_ms = 2592000000
///
/// [[click_id]]
/// name = "fbclid"
/// max_clicks = 5
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrackerOptions {
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    #[serde(default, alias = "click_id")]
    pub click_id_configs: Vec<ClickIdConfig>,
    /// Emit recoverable failures as warnings.
    #[serde(default)]
    pub debug: bool,
    /// Also scan the URL fragment as a query string.
    #[serde(default = "default_true")]
    pub check_hash: bool,
    /// Percent-decode captured values once more after query parsing.
    #[serde(default = "default_true")]
    pub decode_values: bool,
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.into()
}

fn default_true() -> bool {
    true
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
            click_id_configs: Vec::new(),
            debug: false,
            check_hash: true,
            decode_values: true,
        }
    }
}

impl TrackerOptions {
    pub fn new(click_id_configs: Vec<ClickIdConfig>) -> Self {
        Self {
            click_id_configs,
            ..Default::default()
        }
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn check_hash(mut self, on: bool) -> Self {
        self.check_hash = on;
        self
    }

    pub fn decode_values(mut self, on: bool) -> Self {
        self.decode_values = on;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("parse tracker options")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read options file: {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Resolve per-source limits in declaration order.
    /// A repeated name replaces the earlier limits but keeps its position.
    pub fn source_configs(&self) -> Vec<SourceConfig> {
        let mut out: Vec<SourceConfig> = Vec::with_capacity(self.click_id_configs.len());
        for c in &self.click_id_configs {
            let resolved = SourceConfig::from(c);
            match out.iter_mut().find(|s| s.name == resolved.name) {
                Some(existing) => *existing = resolved,
                None => out.push(resolved),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_limits() {
        let opts = TrackerOptions::new(vec![
            ClickIdConfig::new("gclid").expiration_ms(1000),
            ClickIdConfig::new("fbclid").max_clicks(5),
        ]);
        let sources = opts.source_configs();
        assert_eq!(sources[0].expires_after_ms, 1000);
        assert_eq!(sources[0].max_records, DEFAULT_MAX_CLICKS);
        assert_eq!(sources[1].expires_after_ms, DEFAULT_EXPIRATION_MS);
        assert_eq!(sources[1].max_records, 5);
        assert_eq!(opts.storage_key, "_act_");
        assert!(opts.check_hash && opts.decode_values && !opts.debug);
    }

    #[test]
    fn repeated_name_overrides_in_place() {
        let opts = TrackerOptions::new(vec![
            ClickIdConfig::new("gclid"),
            ClickIdConfig::new("fbclid"),
            ClickIdConfig::new("gclid").max_clicks(3),
        ]);
        let sources = opts.source_configs();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "gclid");
        assert_eq!(sources[0].max_records, 3);
    }

    #[test]
    fn zero_cap_falls_back_to_default() {
        let s = SourceConfig::from(&ClickIdConfig::new("x").max_clicks(0));
        assert_eq!(s.max_records, DEFAULT_MAX_CLICKS);
    }

    #[test]
    fn ad_hoc_uses_supplied_expiry() {
        assert_eq!(SourceConfig::ad_hoc("x", Some(42)).expires_after_ms, 42);
        assert_eq!(
            SourceConfig::ad_hoc("x", None).expires_after_ms,
            DEFAULT_EXPIRATION_MS
        );
    }

    #[test]
    fn parses_toml() {
        let opts = TrackerOptions::from_toml_str(
            r#"
            storage_key = "clicks"
            check_hash = false

            [[click_id]]
            name = "gclid"
            expiration_ms = 86400000

            [[click_id]]
            name = "fbclid"
            max_clicks = 5
            "#,
        )
        .unwrap();
        assert_eq!(opts.storage_key, "clicks");
        assert!(!opts.check_hash);
        assert!(opts.decode_values);
        assert_eq!(opts.click_id_configs.len(), 2);
        assert_eq!(opts.click_id_configs[1].max_clicks, Some(5));
    }

    #[test]
    fn rejects_bad_toml() {
        assert!(TrackerOptions::from_toml_str("click_id = 3").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clickmark.toml");
        std::fs::write(&path, "[[click_id]]\nname = \"msclkid\"\n").unwrap();
        let opts = TrackerOptions::load(&path).unwrap();
        assert_eq!(opts.source_configs()[0].name, "msclkid");
        assert!(TrackerOptions::load(&dir.path().join("missing.toml")).is_err());
    }
}
