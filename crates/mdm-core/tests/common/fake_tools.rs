//! Shell scripts standing in for the fetch and remux tools.
//!
//! The fetch script picks its behaviour from the source URL:
//! `.../fail...` exits 1 with an "unavailable" error, `.../slow...` leaves a
//! partial file and sleeps, `.../merge...` goes through a merge step before
//! succeeding, anything else prints progress and succeeds.
//! Listing runs (`--flat-playlist`, `--dump-single-json`) print JSON instead;
//! a `.../bot...` listing fails with a verification challenge and an
//! `.../empty...` one prints nothing.
//! Every run records how many runs were alive when it started.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mdm_core::config::ToolsConfig;
use mdm_core::engine::{Engine, EngineOptions};
use mdm_core::services::{Collaborators, FileLogSink, NoCookieHint, SearchPathResolver};
use mdm_core::store::JobStore;
use tempfile::TempDir;

const FETCH: &str = r#"#!/bin/sh
here="$(dirname "$0")"
mkdir -p "$here/running"
touch "$here/running/$$"
ls "$here/running" | wc -l >> "$here/concurrency.log"
echo "$$" > "$here/pid.$(basename "$1")"
base="${3%.*}"
case "$2" in
  --flat-playlist)
    rm -f "$here/running/$$"
    case "$1" in
      *bot*)
        echo "ERROR: [youtube] PLbot: Sign in to confirm you're not a bot" >&2
        exit 1
        ;;
      *empty*) exit 0 ;;
    esac
    echo '{"id": "one", "title": "First", "playlist_title": "Fake list"}'
    echo '{"id": "two", "title": null}'
    echo "[youtube:tab] Downloading page 1" >&2
    exit 0
    ;;
  --dump-single-json)
    rm -f "$here/running/$$"
    echo '{"id": "clip", "title": "Clip: the sequel"}'
    exit 0
    ;;
esac
case "$1" in
  *fail*)
    echo "ERROR: [generic] $1: Video unavailable" >&2
    rm -f "$here/running/$$"
    exit 1
    ;;
  *slow*)
    echo "[download]   5.0% of 10.00MiB at 1.00MiB/s ETA 00:09"
    touch "$base.f137.mp4.part"
    sleep 30
    ;;
  *merge*)
    echo "[generic] Extracting URL: $1?start_time=30"
    echo "[download]  60.0% of 10.00MiB at 2.00MiB/s ETA 00:02"
    echo "[download] 100% of 10.00MiB in 00:05"
    echo "[Merger] Merging formats into \"$base.mp4\""
    sleep 0.5
    echo "[download] 100% of 10.00MiB in 00:05"
    touch "$base.mp4"
    rm -f "$here/running/$$"
    exit 0
    ;;
esac
echo "[download] Destination: $base.mp4"
echo "[download]  45.2% of 10.00MiB at 2.00MiB/s ETA 00:03"
sleep 0.3
echo "[download] 100% of 10.00MiB in 00:05"
touch "$base.mp4"
rm -f "$here/running/$$"
exit 0
"#;

const REMUX: &str = r#"#!/bin/sh
echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 0 kb/s" >&2
echo "frame=  120 fps=0.0 q=-1.0 size=  256kB time=00:00:05.00 bitrate= 419.4kbits/s speed=2.5x" >&2
for last; do :; done
touch "$last"
exit 0
"#;

pub struct FakeTools {
    dir: TempDir,
}

impl FakeTools {
    pub fn install() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir.path().join("yt-dlp"), FETCH);
        write_script(&dir.path().join("ffmpeg"), REMUX);
        Self { dir }
    }

    pub fn bin_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    /// Resolves only from the script directory, never the real `PATH`.
    pub fn resolver(&self) -> SearchPathResolver {
        let tools = ToolsConfig {
            bin_dir: Some(self.bin_dir().to_path_buf()),
            ..ToolsConfig::default()
        };
        SearchPathResolver::from_config(&tools).with_search_path("")
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            resolver: Arc::new(self.resolver()),
            log_sink: Arc::new(FileLogSink::new(self.log_dir())),
            cookies: Arc::new(NoCookieHint),
        }
    }

    pub async fn engine(&self, store: Arc<dyn JobStore>, limit: usize) -> Engine {
        let options = EngineOptions {
            max_concurrent: limit,
            stderr_tail_lines: 50,
            event_capacity: 1024,
        };
        Engine::open(store, self.collaborators(), options).await.unwrap()
    }

    /// Highest number of simultaneously running fetch processes observed.
    pub fn concurrency_peak(&self) -> usize {
        fs::read_to_string(self.dir.path().join("concurrency.log"))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .max()
            .unwrap_or(0)
    }

    pub fn runs(&self) -> usize {
        fs::read_to_string(self.dir.path().join("concurrency.log"))
            .unwrap_or_default()
            .lines()
            .count()
    }

    /// Pid of the last fetch run for a source ending in `name`.
    pub fn pid_of(&self, name: &str) -> Option<u32> {
        fs::read_to_string(self.dir.path().join(format!("pid.{name}")))
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}
