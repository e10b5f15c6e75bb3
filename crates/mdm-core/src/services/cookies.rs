use std::sync::Mutex;
use std::time::{Duration, Instant};
use url::Url;

use crate::config::{CookieBrowser, CookieConfig};

/// Supplies optional extra fetch-tool arguments. The engine only forwards
/// the arguments and reports verification challenges back.
pub trait CookieHint: Send + Sync {
    fn extra_args(&self, source: &str) -> Vec<String>;
    fn record_challenge(&self, source: &str);
}

/// Never adds arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCookieHint;

impl CookieHint for NoCookieHint {
    fn extra_args(&self, _source: &str) -> Vec<String> {
        Vec::new()
    }

    fn record_challenge(&self, _source: &str) {}
}

/// Borrow the browser's cookies for YouTube, but only for a while after
/// YouTube asked us to prove we are not a bot.
#[derive(Debug)]
pub struct BrowserCookieHint {
    browser: CookieBrowser,
    block_memory: Duration,
    blocked_at: Mutex<Option<Instant>>,
}

impl BrowserCookieHint {
    pub fn new(cfg: &CookieConfig) -> Self {
        Self {
            browser: cfg.browser,
            block_memory: Duration::from_secs(cfg.block_memory_secs),
            blocked_at: Mutex::new(None),
        }
    }

    /// Safari's cookie store is only readable on macOS.
    fn browser_name(&self) -> &'static str {
        match self.browser {
            CookieBrowser::Safari if !cfg!(target_os = "macos") => CookieBrowser::Chrome.as_str(),
            b => b.as_str(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        let blocked_at = *self.blocked_at.lock().unwrap_or_else(|e| e.into_inner());
        blocked_at.is_some_and(|t| t.elapsed() < self.block_memory)
    }

    pub fn reset(&self) {
        *self.blocked_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl CookieHint for BrowserCookieHint {
    fn extra_args(&self, source: &str) -> Vec<String> {
        if is_youtube(source) && self.is_blocked() {
            vec![
                "--cookies-from-browser".to_string(),
                self.browser_name().to_string(),
            ]
        } else {
            Vec::new()
        }
    }

    fn record_challenge(&self, source: &str) {
        if !is_youtube(source) {
            return;
        }
        *self.blocked_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        tracing::info!(
            "verification challenge recorded; using {} cookies for YouTube",
            self.browser_name()
        );
    }
}

fn is_youtube(source: &str) -> bool {
    let Ok(url) = Url::parse(source) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    host == "youtube.com" || host.ends_with(".youtube.com") || host == "youtu.be"
}
