//! Narrow collaborator interfaces the engine talks to, with the default
//! implementations used by the CLI.

mod cookies;
mod log_sink;
mod notifier;
mod resolver;

pub use cookies::{BrowserCookieHint, CookieHint, NoCookieHint};
pub use log_sink::{clean_old_logs, FileLogSink, LogSink, LogWriter, NullLogSink};
pub use notifier::{spawn_notifier, Notifier};
pub use resolver::{ResolvedTool, SearchPathResolver, StaticResolver, Tool, ToolResolver};

use std::sync::Arc;

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ToolResolver>,
    pub log_sink: Arc<dyn LogSink>,
    pub cookies: Arc<dyn CookieHint>,
}

impl Collaborators {
    /// Resolver only; logs discarded and no cookie hints. Headless use and tests.
    pub fn headless(resolver: Arc<dyn ToolResolver>) -> Self {
        Self {
            resolver,
            log_sink: Arc::new(NullLogSink),
            cookies: Arc::new(NoCookieHint),
        }
    }
}
