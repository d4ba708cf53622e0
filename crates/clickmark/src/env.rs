use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Read-only view of the page the registry runs in.
pub trait PageContext {
    /// Full current URL, or `None` outside a page.
    fn url(&self) -> Option<String>;
    /// Document referrer, if any.
    fn referrer(&self) -> Option<String>;
}

/// No page at all (server-side rendering, workers, CLI without a URL).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPage;

impl PageContext for NoPage {
    fn url(&self) -> Option<String> {
        None
    }

    fn referrer(&self) -> Option<String> {
        None
    }
}

/// A fixed URL and referrer.
#[derive(Debug, Clone, Default)]
pub struct StaticPage {
    pub url: String,
    pub referrer: String,
}

impl StaticPage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referrer: String::new(),
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = referrer.into();
        self
    }
}

impl PageContext for StaticPage {
    fn url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn referrer(&self) -> Option<String> {
        Some(self.referrer.clone())
    }
}

/// Millisecond wall clock.
pub trait Clock {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start_ms)))
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared() {
        let a = ManualClock::new(1_000);
        let b = a.clone();
        a.advance(500);
        assert_eq!(b.now_ms(), 1_500);
        b.set(7);
        assert_eq!(a.now_ms(), 7);
    }

    #[test]
    fn system_clock_is_epoch_ms() {
        // 2020-01-01 in epoch ms.
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn no_page_has_no_url() {
        assert!(NoPage.url().is_none());
        let page = StaticPage::new("https://a.test/").with_referrer("https://b.test/");
        assert_eq!(page.referrer().as_deref(), Some("https://b.test/"));
    }
}
