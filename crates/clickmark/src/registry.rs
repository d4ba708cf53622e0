use std::borrow::Cow;
use std::fmt;

use anyhow::Context;
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};
use url::{form_urlencoded, Url};

use crate::config::{SourceConfig, TrackerOptions, DEFAULT_MAX_CLICKS};
use crate::env::{Clock, NoPage, PageContext, SystemClock};
use crate::store::blob;
use crate::store::kv::KeyValueStorage;
use crate::store::model::{self, ClickMap, ClickRecord};

/// Host hooks. Each fires synchronously from inside the registry call that caused it.
#[derive(Default)]
pub struct Callbacks {
    /// Latest-per-source snapshot, once, right after persisted state is loaded.
    pub on_loaded: Option<Box<dyn FnMut(&ClickMap)>>,
    pub on_new_click: Option<Box<dyn FnMut(&ClickRecord)>>,
    pub on_updated_click: Option<Box<dyn FnMut(&ClickRecord)>>,
}

impl Callbacks {
    pub fn on_loaded(mut self, f: impl FnMut(&ClickMap) + 'static) -> Self {
        self.on_loaded = Some(Box::new(f));
        self
    }

    pub fn on_new_click(mut self, f: impl FnMut(&ClickRecord) + 'static) -> Self {
        self.on_new_click = Some(Box::new(f));
        self
    }

    pub fn on_updated_click(mut self, f: impl FnMut(&ClickRecord) + 'static) -> Self {
        self.on_updated_click = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_loaded", &self.on_loaded.is_some())
            .field("on_new_click", &self.on_new_click.is_some())
            .field("on_updated_click", &self.on_updated_click.is_some())
            .finish()
    }
}

/// The collaborators a registry reads from and writes to.
pub struct Environment {
    storage: Box<dyn KeyValueStorage>,
    page: Box<dyn PageContext>,
    clock: Box<dyn Clock>,
}

impl Environment {
    /// Storage only: no page, wall clock.
    pub fn new(storage: impl KeyValueStorage + 'static) -> Self {
        Self {
            storage: Box::new(storage),
            page: Box::new(NoPage),
            clock: Box::new(SystemClock),
        }
    }

    pub fn page(mut self, page: impl PageContext + 'static) -> Self {
        self.page = Box::new(page);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }
}

/// Result of reading persisted state at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing stored under the key yet.
    Missing,
    Loaded {
        /// Null or unparseable entries discarded.
        dropped: usize,
        /// Sources whose persisted value was not an array.
        reset: usize,
        /// Records removed by the load-time prune (expired or over the cap).
        pruned: usize,
    },
    /// The blob was not a JSON object.
    Malformed(String),
    /// Storage could not be read.
    Unavailable(String),
}

/// Result of the most recent write of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// No mutation has needed persisting yet.
    Pending,
    Saved,
    Failed(String),
}

/// Result of scanning the page URL at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    NoPage,
    Scanned { captured: usize },
    Failed(String),
}

/// Click-identifier registry. Build one per page session and hand it to
/// whatever needs it; nothing here is global.
///
/// No method returns an error. Storage and URL problems degrade to an
/// in-memory store and are reported through [`last_load`](Self::last_load),
/// [`last_persist`](Self::last_persist) and [`last_scan`](Self::last_scan).
pub struct ClickRegistry {
    options: TrackerOptions,
    sources: Vec<SourceConfig>,
    clicks: ClickMap,
    env: Environment,
    callbacks: Callbacks,
    last_load: LoadOutcome,
    last_persist: PersistOutcome,
    last_scan: ScanOutcome,
}

impl ClickRegistry {
    pub fn new(options: TrackerOptions, env: Environment) -> Self {
        Self::with_callbacks(options, env, Callbacks::default())
    }

    /// Load persisted state, prune it, notify `on_loaded`, then capture any
    /// identifiers in the page URL. All of it happens before this returns.
    pub fn with_callbacks(options: TrackerOptions, env: Environment, callbacks: Callbacks) -> Self {
        let sources = options.source_configs();
        let clicks = sources
            .iter()
            .map(|s| (s.name.clone(), Vec::new()))
            .collect();

        let mut registry = Self {
            options,
            sources,
            clicks,
            env,
            callbacks,
            last_load: LoadOutcome::Missing,
            last_persist: PersistOutcome::Pending,
            last_scan: ScanOutcome::NoPage,
        };

        registry.load();
        if registry.callbacks.on_loaded.is_some() {
            let snapshot = registry.get(true);
            if let Some(cb) = registry.callbacks.on_loaded.as_mut() {
                cb(&snapshot);
            }
        }
        registry.scan_url();
        registry
    }

    // ── Public API ────────────────────────────────────────────────────────

    /// Record `value` for `source`. Configured sources use their configured
    /// expiry; anything else becomes an ad-hoc source with `expires_after_ms`
    /// (or 30 days).
    pub fn track(&mut self, source: &str, value: &str, expires_after_ms: Option<u64>) {
        let config = self
            .source(source)
            .cloned()
            .unwrap_or_else(|| SourceConfig::ad_hoc(source, expires_after_ms));
        self.record_click(&config, value.to_owned());
    }

    /// All records per source, or with `latest_only` each configured source
    /// mapped to its newest record (empty when it has none).
    pub fn get(&self, latest_only: bool) -> ClickMap {
        if !latest_only {
            return self.clicks.clone();
        }
        self.sources
            .iter()
            .map(|s| {
                let latest: Vec<ClickRecord> = self
                    .clicks
                    .get(&s.name)
                    .and_then(|records| model::latest(records))
                    .cloned()
                    .into_iter()
                    .collect();
                (s.name.clone(), latest)
            })
            .collect()
    }

    /// Empty one source, or every source when `source` is `None` or empty.
    pub fn clear(&mut self, source: Option<&str>) {
        let source = source.filter(|name| !name.is_empty());
        match source {
            Some(name) => {
                self.clicks.insert(name.to_owned(), Vec::new());
            }
            None => self.clicks.values_mut().for_each(Vec::clear),
        }
        debug!(source = source.unwrap_or("*"), "cleared clicks");
        self.save();
    }

    /// Prune expired and excess records now. Persists only if something was
    /// removed. Returns the number of records removed.
    pub fn cleanup(&mut self) -> usize {
        let removed = self.prune();
        if removed > 0 {
            self.save();
        }
        removed
    }

    /// Write the store now regardless of whether anything changed.
    pub fn flush(&mut self) -> &PersistOutcome {
        self.save();
        &self.last_persist
    }

    /// Newest record of one source.
    pub fn latest(&self, source: &str) -> Option<&ClickRecord> {
        self.clicks.get(source).and_then(|r| model::latest(r))
    }

    /// Borrow the full store.
    pub fn clicks(&self) -> &ClickMap {
        &self.clicks
    }

    /// Configured sources in declaration order.
    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn options(&self) -> &TrackerOptions {
        &self.options
    }

    pub fn last_load(&self) -> &LoadOutcome {
        &self.last_load
    }

    pub fn last_persist(&self) -> &PersistOutcome {
        &self.last_persist
    }

    pub fn last_scan(&self) -> &ScanOutcome {
        &self.last_scan
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn now(&self) -> i64 {
        self.env.clock.now_ms()
    }

    fn report(&self, what: &str, error: &dyn fmt::Display) {
        if self.options.debug {
            warn!(storage_key = %self.options.storage_key, error = %error, "{what} failed");
        }
    }

    fn load(&mut self) {
        let key = self.options.storage_key.clone();
        self.last_load = match self.env.storage.get_item(&key) {
            Err(e) => {
                self.report("load", &e);
                LoadOutcome::Unavailable(e.to_string())
            }
            Ok(None) => LoadOutcome::Missing,
            Ok(Some(raw)) if raw.is_empty() => LoadOutcome::Missing,
            Ok(Some(raw)) => {
                let names = self.sources.iter().map(|s| s.name.as_str());
                match blob::decode(&raw, names) {
                    Ok(decoded) => {
                        for name in &decoded.reset_sources {
                            self.report("load", &format_args!("source {name} is not an array"));
                        }
                        let outcome = LoadOutcome::Loaded {
                            dropped: decoded.dropped_entries,
                            reset: decoded.reset_sources.len(),
                            pruned: 0,
                        };
                        self.clicks.extend(decoded.clicks);
                        outcome
                    }
                    Err(e) => {
                        self.report("load", &format_args!("{e:#}"));
                        LoadOutcome::Malformed(format!("{e:#}"))
                    }
                }
            }
        };
        let removed = self.prune();
        if let LoadOutcome::Loaded { pruned, .. } = &mut self.last_load {
            *pruned = removed;
        }
    }

    fn save(&mut self) {
        let result = blob::encode(&self.clicks).and_then(|raw| {
            self.env
                .storage
                .set_item(&self.options.storage_key, &raw)
                .map_err(anyhow::Error::from)
        });
        self.last_persist = match result {
            Ok(()) => PersistOutcome::Saved,
            Err(e) => {
                self.report("save", &format_args!("{e:#}"));
                PersistOutcome::Failed(format!("{e:#}"))
            }
        };
    }

    /// Drop expired records and enforce caps on every source, then make sure
    /// every configured source still has a bucket.
    fn prune(&mut self) -> usize {
        let now = self.now();
        let mut removed = 0;
        for (name, records) in self.clicks.iter_mut() {
            removed += model::prune_records(records, now, max_records(&self.sources, name));
        }
        for s in &self.sources {
            self.clicks.entry(s.name.clone()).or_default();
        }
        if removed > 0 {
            debug!(removed, "pruned clicks");
        }
        removed
    }

    fn scan_url(&mut self) {
        let Some(href) = self.env.page.url() else {
            self.last_scan = ScanOutcome::NoPage;
            return;
        };

        let url = match Url::parse(&href) {
            Ok(u) => u,
            Err(e) => {
                self.report("url parse", &e);
                self.last_scan = ScanOutcome::Failed(e.to_string());
                return;
            }
        };

        let mut found = find_params(url.query_pairs(), &self.sources);
        if self.options.check_hash {
            if let Some(fragment) = url.fragment().filter(|f| !f.is_empty()) {
                found.extend(find_params(
                    form_urlencoded::parse(fragment.as_bytes()),
                    &self.sources,
                ));
            }
        }

        // One bad value abandons the scan, so decode everything before recording.
        let mut decoded = Vec::with_capacity(found.len());
        for (config, raw) in found {
            let value = if self.options.decode_values {
                match decode_component(&raw) {
                    Ok(value) => value,
                    Err(e) => {
                        self.report("value decode", &format_args!("{e:#}"));
                        self.last_scan = ScanOutcome::Failed(format!("{}: {e:#}", config.name));
                        return;
                    }
                }
            } else {
                raw
            };
            decoded.push((config, value));
        }

        let captured = decoded.len();
        for (config, value) in decoded {
            self.record_click(&config, value);
        }
        self.last_scan = ScanOutcome::Scanned { captured };
    }

    fn record_click(&mut self, config: &SourceConfig, value: String) {
        let now = self.now();
        let ttl = i64::try_from(config.expires_after_ms).unwrap_or(i64::MAX);
        let record = ClickRecord {
            value,
            timestamp: now,
            expires_at: now.saturating_add(ttl),
            landing: self.env.page.url().unwrap_or_default(),
            referrer: self.env.page.referrer().unwrap_or_default(),
        };

        let records = self.clicks.entry(config.name.clone()).or_default();
        match records.iter().position(|r| r.value == record.value) {
            Some(index) => {
                records[index] = record.clone();
                debug!(source = %config.name, "updated click");
                if let Some(cb) = self.callbacks.on_updated_click.as_mut() {
                    cb(&record);
                }
            }
            None => {
                records.push(record.clone());
                let evicted = model::trim_front(records, config.max_records);
                debug!(source = %config.name, evicted, "recorded click");
                if let Some(cb) = self.callbacks.on_new_click.as_mut() {
                    cb(&record);
                }
            }
        }

        self.save();
    }
}

fn max_records(sources: &[SourceConfig], name: &str) -> usize {
    sources
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.max_records)
        .unwrap_or(DEFAULT_MAX_CLICKS)
}

/// Percent-decode a value that has already been through query parsing.
/// A `%` not followed by two hex digits, or a result that is not UTF-8, is an error.
fn decode_component(raw: &str) -> anyhow::Result<String> {
    let bytes = raw.as_bytes();
    for (i, _) in raw.match_indices('%') {
        let escape = bytes.get(i + 1..i + 3);
        if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
            anyhow::bail!("malformed escape at byte {i}");
        }
    }
    let value = percent_decode_str(raw)
        .decode_utf8()
        .context("decoded value is not UTF-8")?;
    Ok(value.into_owned())
}

/// First non-empty value for each configured source, in configuration order.
fn find_params<'a, I>(pairs: I, sources: &[SourceConfig]) -> Vec<(SourceConfig, String)>
where
    I: Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>,
{
    let pairs: Vec<_> = pairs.collect();
    sources
        .iter()
        .filter_map(|s| {
            pairs
                .iter()
                .find(|(k, _)| *k == s.name)
                .filter(|(_, v)| !v.is_empty())
                .map(|(_, v)| (s.clone(), v.to_string()))
        })
        .collect()
}
