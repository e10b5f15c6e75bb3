//! Locate the external tools at spawn time.

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::ToolsConfig;
use crate::supervisor::LaunchFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// Used by `simple-fetch` jobs.
    Fetch,
    /// Used by `stream-remux` jobs.
    Remux,
}

/// A runnable tool: executable plus arguments that go before the job's own
/// (e.g. an interpreter running a script).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ResolvedTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

pub trait ToolResolver: Send + Sync {
    /// Failure is reported per job, never at startup.
    fn resolve(&self, tool: Tool) -> Result<ResolvedTool, LaunchFailure>;
}

/// Bundled-binary directory first, then every `PATH` entry.
#[derive(Debug, Clone)]
pub struct SearchPathResolver {
    fetch_name: String,
    remux_name: String,
    bin_dir: Option<PathBuf>,
    search_path: Option<OsString>,
}

impl SearchPathResolver {
    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self {
            fetch_name: tools.fetch_tool.clone(),
            remux_name: tools.remux_tool.clone(),
            bin_dir: tools.bin_dir.clone(),
            search_path: None,
        }
    }

    /// Use this list instead of the process `PATH`.
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    fn name_for(&self, tool: Tool) -> &str {
        match tool {
            Tool::Fetch => &self.fetch_name,
            Tool::Remux => &self.remux_name,
        }
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let file_name = executable_name(name);
        let mut dirs: Vec<PathBuf> = self.bin_dir.iter().cloned().collect();
        let path = self.search_path.clone().or_else(|| env::var_os("PATH"));
        if let Some(path) = path {
            dirs.extend(env::split_paths(&path));
        }
        dirs.into_iter().map(|d| d.join(&file_name)).collect()
    }
}

impl ToolResolver for SearchPathResolver {
    fn resolve(&self, tool: Tool) -> Result<ResolvedTool, LaunchFailure> {
        let name = self.name_for(tool);
        // A configured path is used as-is.
        if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
            let path = PathBuf::from(name);
            return if is_executable(&path) {
                Ok(ResolvedTool::new(path))
            } else {
                Err(LaunchFailure::ToolNotFound(name.to_string()))
            };
        }
        self.candidates(name)
            .into_iter()
            .find(|p| is_executable(p))
            .map(ResolvedTool::new)
            .ok_or_else(|| LaunchFailure::ToolNotFound(name.to_string()))
    }
}

/// Fixed tool table. Tools missing from the table fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    tools: HashMap<Tool, ResolvedTool>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: Tool, resolved: ResolvedTool) -> Self {
        self.tools.insert(tool, resolved);
        self
    }
}

impl ToolResolver for StaticResolver {
    fn resolve(&self, tool: Tool) -> Result<ResolvedTool, LaunchFailure> {
        self.tools.get(&tool).cloned().ok_or_else(|| {
            LaunchFailure::ToolNotFound(
                match tool {
                    Tool::Fetch => "fetch tool",
                    Tool::Remux => "remux tool",
                }
                .to_string(),
            )
        })
    }
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) && !name.to_ascii_lowercase().ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
