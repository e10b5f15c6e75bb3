//! Classify a failed tool run into a short user-facing category.
//!
//! Input is the bounded stderr tail kept by the supervisor. Matching is
//! case-insensitive substring search; the first category that matches wins,
//! so the more specific signals are checked before the generic ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a `ProcessFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    AccessDenied,
    RestrictedFormat,
    VerificationChallenge,
    PlatformError,
    FilePermission,
    NotFound,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::AccessDenied => "access-denied",
            FailureKind::RestrictedFormat => "restricted-format",
            FailureKind::VerificationChallenge => "verification-challenge",
            FailureKind::PlatformError => "platform-error",
            FailureKind::FilePermission => "file-permission",
            FailureKind::NotFound => "not-found",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Stable message shown to the user. Raw tool output stays in the job log.
    pub fn message(self) -> &'static str {
        match self {
            FailureKind::AccessDenied => {
                "Access denied: this media requires signing in or is private"
            }
            FailureKind::RestrictedFormat => {
                "The requested format is not available for this media"
            }
            FailureKind::VerificationChallenge => {
                "The site asked for a verification challenge; try again later"
            }
            FailureKind::PlatformError => "The media platform returned an error",
            FailureKind::FilePermission => "Cannot write to the output directory",
            FailureKind::NotFound => "The media was not found or is no longer available",
            FailureKind::Unknown => "Download failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const VERIFICATION: &[&str] = &["not a bot", "confirm you're not", "captcha", "verify you are"];
const ACCESS_DENIED: &[&str] = &[
    "sign in",
    "login required",
    "authentication",
    "http error 401",
    "http error 403",
    "forbidden",
    "private video",
    "members-only",
    "members only",
];
const RESTRICTED_FORMAT: &[&str] = &[
    "requested format is not available",
    "no video formats found",
    "drm",
];
const FILE_PERMISSION: &[&str] = &[
    "permission denied",
    "read-only file system",
    "no space left on device",
];
const NOT_FOUND: &[&str] = &[
    "http error 404",
    "not found",
    "video unavailable",
    "is unavailable",
    "does not exist",
    "no such file or directory",
];
const PLATFORM: &[&str] = &["error: [", "unable to extract", "unable to download", "http error 5"];

/// Classify the captured stderr tail of a process that exited unsuccessfully.
pub fn classify<S: AsRef<str>>(stderr_tail: &[S]) -> FailureKind {
    let text = stderr_tail
        .iter()
        .map(|l| l.as_ref().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("\n");

    let table: [(&[&str], FailureKind); 6] = [
        (VERIFICATION, FailureKind::VerificationChallenge),
        (ACCESS_DENIED, FailureKind::AccessDenied),
        (RESTRICTED_FORMAT, FailureKind::RestrictedFormat),
        (FILE_PERMISSION, FailureKind::FilePermission),
        (NOT_FOUND, FailureKind::NotFound),
        (PLATFORM, FailureKind::PlatformError),
    ];
    table
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| text.contains(n)))
        .map(|(_, kind)| *kind)
        .unwrap_or(FailureKind::Unknown)
}

/// User-facing message for a failed run: the category message, plus the exit
/// code when nothing more specific is known.
pub fn failure_message(kind: FailureKind, exit_code: Option<i32>) -> String {
    match (kind, exit_code) {
        (FailureKind::Unknown, Some(code)) => format!("Download failed (exit code {code})"),
        (FailureKind::Unknown, None) => "Download failed (process was terminated)".to_string(),
        _ => kind.message().to_string(),
    }
}
