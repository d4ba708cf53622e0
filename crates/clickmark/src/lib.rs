//! Capture advertising click identifiers (`gclid`, `fbclid`, ...) from a page
//! URL and keep them in key-value storage with per-source expiry and caps.

pub mod config;
pub mod env;
pub mod registry;
pub mod store;

pub use config::{ClickIdConfig, SourceConfig, TrackerOptions};
pub use env::{Clock, ManualClock, NoPage, PageContext, StaticPage, SystemClock};
pub use registry::{
    Callbacks, ClickRegistry, Environment, LoadOutcome, PersistOutcome, ScanOutcome,
};
pub use store::{ClickMap, ClickRecord, KeyValueStorage, MemoryStorage, RedbStorage};
