//! Progress scraping from tool output.
//!
//! The tools have no structured progress protocol, so this is a best-effort
//! line scraper: unrecognized or malformed lines produce no update and never
//! an error.

mod parser;

pub use parser::{LineParser, Phase, ProgressUpdate};
