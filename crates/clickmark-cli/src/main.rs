use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clickmark::{
    Callbacks, ClickIdConfig, ClickMap, ClickRecord, ClickRegistry, Clock, Environment,
    LoadOutcome, PersistOutcome, RedbStorage, ScanOutcome, StaticPage, SystemClock,
    TrackerOptions,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod dirs;

/// Identifiers tracked when no options file is given.
const DEFAULT_SOURCES: &[&str] = &["gclid", "fbclid", "msclkid", "ttclid"];

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "clickmark", about = "Capture and inspect ad click identifiers", version)]
struct Cli {
    /// TOML options file ($CLICKMARK_CONFIG)
    #[arg(long, env = "CLICKMARK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding clickmark.db ($CLICKMARK_DATA_DIR)
    #[arg(long, env = "CLICKMARK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Storage key the clicks blob lives under ($CLICKMARK_STORAGE_KEY)
    #[arg(long, env = "CLICKMARK_STORAGE_KEY")]
    storage_key: Option<String>,

    /// Log recoverable storage and URL failures
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a page URL and capture any configured identifiers in it
    Visit {
        /// Full page URL, e.g. "https://shop.example/?gclid=abc"
        url: String,
        /// Document referrer for the visit
        #[arg(long, default_value = "")]
        referrer: String,
    },
    /// Record an identifier directly
    Track {
        /// Source name, e.g. gclid
        source: String,
        /// Identifier value
        value: String,
        /// Expiry for unconfigured sources e.g. 1h, 7d
        #[arg(long)]
        ttl: Option<String>,
    },
    /// List stored identifiers
    List {
        /// Only the newest identifier per configured source
        #[arg(long)]
        latest: bool,
        /// Print the raw JSON mapping
        #[arg(long)]
        json: bool,
    },
    /// Clear one source, or everything
    Clear {
        /// Source name (omit to clear all)
        source: Option<String>,
    },
    /// Drop expired and over-limit identifiers from storage
    Prune,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CLICKMARK_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let options = resolve_options(cli.config.as_deref(), cli.storage_key, cli.debug)?;

    let data_dir = dirs::data_dir(cli.data_dir.as_deref())?;
    let db_path = data_dir.join("clickmark.db");
    debug!(path = %db_path.display(), "opening click store");
    let storage = RedbStorage::open(&db_path).context("open click store")?;

    match cli.command {
        Commands::Visit { url, referrer } => cmd_visit(options, storage, url, referrer),
        Commands::Track { source, value, ttl } => {
            let ttl_ms = ttl.as_deref().map(parse_duration_ms).transpose()?;
            cmd_track(options, storage, &source, &value, ttl_ms)
        }
        Commands::List { latest, json } => cmd_list(options, storage, latest, json),
        Commands::Clear { source } => cmd_clear(options, storage, source.as_deref()),
        Commands::Prune => cmd_prune(options, storage),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

fn cmd_visit(
    options: TrackerOptions,
    storage: RedbStorage,
    url: String,
    referrer: String,
) -> Result<()> {
    let captured: Rc<RefCell<Vec<(&'static str, ClickRecord)>>> = Rc::default();
    let (new, updated) = (captured.clone(), captured.clone());
    let callbacks = Callbacks::default()
        .on_new_click(move |r: &ClickRecord| new.borrow_mut().push(("new", r.clone())))
        .on_updated_click(move |r: &ClickRecord| updated.borrow_mut().push(("updated", r.clone())));

    let page = StaticPage::new(url).with_referrer(referrer);
    let registry = ClickRegistry::with_callbacks(options, Environment::new(storage).page(page), callbacks);

    if let ScanOutcome::Failed(reason) = registry.last_scan() {
        anyhow::bail!("URL scan failed: {reason}");
    }
    ensure_persisted(registry.last_persist())?;

    let captured = captured.borrow();
    if captured.is_empty() {
        println!("(no click identifiers in URL)");
    }
    for (kind, record) in captured.iter() {
        println!("✓ {kind} {}", record.value);
    }
    Ok(())
}

fn cmd_track(
    options: TrackerOptions,
    storage: RedbStorage,
    source: &str,
    value: &str,
    ttl_ms: Option<u64>,
) -> Result<()> {
    let mut registry = ClickRegistry::new(options, Environment::new(storage));
    warn_on_load(registry.last_load());
    registry.track(source, value, ttl_ms);
    ensure_persisted(registry.last_persist())?;
    println!("✓ tracked {source}={value}");
    Ok(())
}

fn cmd_list(options: TrackerOptions, storage: RedbStorage, latest: bool, json: bool) -> Result<()> {
    let registry = ClickRegistry::new(options, Environment::new(storage));
    warn_on_load(registry.last_load());
    let clicks = registry.get(latest);

    if json {
        println!("{}", serde_json::to_string_pretty(&clicks).context("encode clicks")?);
        return Ok(());
    }

    print!("{}", render_list(&clicks, SystemClock.now_ms()));
    Ok(())
}

fn cmd_clear(options: TrackerOptions, storage: RedbStorage, source: Option<&str>) -> Result<()> {
    let mut registry = ClickRegistry::new(options, Environment::new(storage));
    registry.clear(source);
    ensure_persisted(registry.last_persist())?;
    match source {
        Some(s) => println!("✓ cleared {s}"),
        None => println!("✓ cleared all sources"),
    }
    Ok(())
}

fn cmd_prune(options: TrackerOptions, storage: RedbStorage) -> Result<()> {
    let mut registry = ClickRegistry::new(options, Environment::new(storage));
    let pruned = match registry.last_load() {
        LoadOutcome::Loaded { pruned, .. } => *pruned,
        other => {
            warn_on_load(other);
            0
        }
    };
    ensure_persisted(registry.flush())?;
    println!("pruned {pruned} click identifier(s)");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn resolve_options(
    config: Option<&Path>,
    storage_key: Option<String>,
    debug: bool,
) -> Result<TrackerOptions> {
    let mut options = match config {
        Some(path) => TrackerOptions::load(path)?,
        None => TrackerOptions::new(DEFAULT_SOURCES.iter().map(|s| ClickIdConfig::new(*s)).collect()),
    };
    if let Some(key) = storage_key {
        options.storage_key = key;
    }
    options.debug |= debug;
    Ok(options)
}

fn ensure_persisted(outcome: &PersistOutcome) -> Result<()> {
    match outcome {
        PersistOutcome::Failed(reason) => anyhow::bail!("could not persist clicks: {reason}"),
        PersistOutcome::Saved | PersistOutcome::Pending => Ok(()),
    }
}

fn warn_on_load(outcome: &LoadOutcome) {
    match outcome {
        LoadOutcome::Malformed(reason) | LoadOutcome::Unavailable(reason) => {
            eprintln!("warning: stored clicks ignored: {reason}");
        }
        LoadOutcome::Missing | LoadOutcome::Loaded { .. } => {}
    }
}

/// Parse human duration strings like "1h", "30m", "7d" into milliseconds.
fn parse_duration_ms(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_millis() as u64)
}

fn render_list(clicks: &ClickMap, now: i64) -> String {
    if clicks.values().all(Vec::is_empty) {
        return "(no click identifiers)\n".to_string();
    }
    let mut out = String::new();
    for (source, records) in clicks {
        for r in records {
            let left = r.expires_at - now;
            let expiry = if left > 0 {
                format!("expires in {}", format_duration((left / 1000) as u64))
            } else {
                "expired".to_string()
            };
            out.push_str(&format!("  {source} {} — {expiry}", r.value));
            if !r.landing.is_empty() {
                out.push_str(&format!(" — {}", r.landing));
            }
            out.push('\n');
        }
    }
    out
}

/// Remaining time in its coarsest unit, e.g. "23h" or "30days".
fn format_duration(secs: u64) -> String {
    let full = humantime::format_duration(Duration::from_secs(secs)).to_string();
    full.split(' ').next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: &str, expires_at: i64, landing: &str) -> ClickRecord {
        ClickRecord {
            value: value.into(),
            timestamp: 0,
            expires_at,
            landing: landing.into(),
            referrer: String::new(),
        }
    }

    #[test]
    fn parses_human_durations() {
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("7d").unwrap(), 604_800_000);
        assert!(parse_duration_ms("soon").is_err());
    }

    #[test]
    fn formats_coarsest_unit() {
        assert_eq!(format_duration(90_000), "1day");
        assert_eq!(format_duration(2_592_000), "30days");
        assert_eq!(format_duration(7_200), "2h");
        assert_eq!(format_duration(61), "1m");
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(0), "0s");
    }

    #[test]
    fn renders_records() {
        let mut clicks = ClickMap::new();
        clicks.insert(
            "gclid".into(),
            vec![record("abc", 86_400_000, "https://a.test/?gclid=abc")],
        );
        clicks.insert("fbclid".into(), vec![record("old", 10, "")]);
        let out = render_list(&clicks, 1_000);
        assert!(out.contains("  gclid abc — expires in 23h — https://a.test/?gclid=abc\n"));
        assert!(out.contains("  fbclid old — expired\n"));
    }

    #[test]
    fn renders_empty() {
        let mut clicks = ClickMap::new();
        clicks.insert("gclid".into(), Vec::new());
        assert_eq!(render_list(&clicks, 0), "(no click identifiers)\n");
    }

    #[test]
    fn default_options_track_common_sources() {
        let opts = resolve_options(None, Some("k".into()), true).unwrap();
        assert_eq!(opts.storage_key, "k");
        assert!(opts.debug);
        let names: Vec<_> = opts.source_configs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, DEFAULT_SOURCES);
    }

    #[test]
    fn persist_failure_is_an_error() {
        assert!(ensure_persisted(&PersistOutcome::Failed("full".into())).is_err());
        assert!(ensure_persisted(&PersistOutcome::Saved).is_ok());
    }

    #[test]
    fn visit_then_list_against_redb() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(&dir.path().join("clickmark.db")).unwrap();
        let options = resolve_options(None, None, false).unwrap();

        cmd_visit(
            options.clone(),
            storage.clone(),
            "https://shop.test/?gclid=abc123".into(),
            String::new(),
        )
        .unwrap();

        let registry = ClickRegistry::new(options, Environment::new(storage));
        assert_eq!(registry.latest("gclid").unwrap().value, "abc123");
    }

    #[test]
    fn visit_with_malformed_escape_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(&dir.path().join("clickmark.db")).unwrap();
        let options = resolve_options(None, None, false).unwrap();

        let err = cmd_visit(
            options.clone(),
            storage.clone(),
            "https://shop.test/?gclid=50%25off&fbclid=ok".into(),
            String::new(),
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("URL scan failed"));

        let registry = ClickRegistry::new(options, Environment::new(storage));
        assert!(registry.latest("fbclid").is_none());
    }
}
