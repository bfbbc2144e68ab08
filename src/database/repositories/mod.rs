pub mod config;
pub mod content;
pub mod content_hash;
pub mod duplicate_group;
pub mod scan_queue;

pub use config::ConfigRepository;
pub use content::ContentRepository;
pub use content_hash::ContentHashRepository;
pub use duplicate_group::DuplicateGroupRepository;
pub use scan_queue::ScanQueueRepository;

use chrono::{SecondsFormat, Utc};

/// RFC 3339 timestamp with microseconds, so rows created within one scan
/// still sort in creation order.
pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
