use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// External tool names and an optional directory of bundled binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Fetch tool used for `simple-fetch` jobs.
    pub fetch_tool: String,
    /// Remux tool used for `stream-remux` jobs.
    pub remux_tool: String,
    /// Directory searched before `PATH` (e.g. binaries shipped next to the app).
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch_tool: "yt-dlp".to_string(),
            remux_tool: "ffmpeg".to_string(),
            bin_dir: None,
        }
    }
}

/// Browser whose cookie jar the fetch tool may borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieBrowser {
    #[default]
    Chrome,
    Firefox,
    Safari,
}

impl CookieBrowser {
    pub fn as_str(self) -> &'static str {
        match self {
            CookieBrowser::Chrome => "chrome",
            CookieBrowser::Firefox => "firefox",
            CookieBrowser::Safari => "safari",
        }
    }
}

/// Cookie hint settings (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    pub browser: CookieBrowser,
    /// How long a recorded verification challenge keeps cookies enabled.
    pub block_memory_secs: u64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            browser: CookieBrowser::Chrome,
            block_memory_secs: 60 * 60,
        }
    }
}

/// Per-job log retention (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRetentionConfig {
    pub retain_success_hours: u64,
    /// Logs that mention an error are kept longer.
    pub retain_error_hours: u64,
}

impl Default for LogRetentionConfig {
    fn default() -> Self {
        Self {
            retain_success_hours: 24,
            retain_error_hours: 7 * 24,
        }
    }
}

/// Global configuration loaded from `~/.config/mdm/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdmConfig {
    /// Engine slot limit: jobs with a live process at once.
    pub max_concurrent_downloads: usize,
    /// Second gate in front of batch submissions (1..=9). None = batches rely on the engine limit only.
    #[serde(default)]
    pub batch_concurrency: Option<usize>,
    /// Lines of stderr kept in memory per process for error classification.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
    /// Buffered events per subscriber before it starts lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub cookies: CookieConfig,
    #[serde(default)]
    pub logs: LogRetentionConfig,
}

fn default_stderr_tail_lines() -> usize {
    200
}

fn default_event_capacity() -> usize {
    256
}

impl Default for MdmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            batch_concurrency: Some(2),
            stderr_tail_lines: default_stderr_tail_lines(),
            event_capacity: default_event_capacity(),
            tools: ToolsConfig::default(),
            cookies: CookieConfig::default(),
            logs: LogRetentionConfig::default(),
        }
    }
}

impl MdmConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            bail!("max_concurrent_downloads must be at least 1");
        }
        if let Some(n) = self.batch_concurrency {
            if !(1..=9).contains(&n) {
                bail!("batch_concurrency must be between 1 and 9 (got {n})");
            }
        }
        if self.stderr_tail_lines == 0 {
            bail!("stderr_tail_lines must be at least 1");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be at least 1");
        }
        if self.tools.fetch_tool.trim().is_empty() || self.tools.remux_tool.trim().is_empty() {
            bail!("tools.fetch_tool and tools.remux_tool must not be empty");
        }
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<MdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = MdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: MdmConfig = toml::from_str(&data)?;
    cfg.validate()?;
    Ok(cfg)
}
