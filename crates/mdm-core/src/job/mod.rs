//! The unit of work: an immutable request plus mutable status/progress fields.

mod request;
mod types;

pub use request::{BatchLink, JobKind, JobRequest, MediaKind, MediaSelector};
pub use types::*;
pub(crate) use types::unix_timestamp;
