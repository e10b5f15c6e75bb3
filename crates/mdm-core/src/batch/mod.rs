//! Playlist batches: one request fans out into member jobs with derived ids.

mod analyze;
mod coordinator;
mod types;

#[cfg(test)]
mod tests;

pub use analyze::{
    analyze_playlist, is_playlist_url, media_title, parse_flat_listing, playlist_id_from_url,
};
pub use coordinator::{BatchCoordinator, BatchOptions};
pub use types::{
    derived_job_id, member_base_name, sanitize_title, BatchEvent, BatchMember, BatchProgress,
    BatchRecord, BatchRequest, MemberRecord, MEMBER_SEPARATOR,
};
