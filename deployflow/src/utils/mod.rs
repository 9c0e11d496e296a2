//! Utility functions for identifiers, digests and timestamps.

mod digest;
pub mod timestamps;

pub use digest::{sha256_hex, short_digest};
pub use timestamps::{iso_timestamp, now_utc, Timestamp};

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a new UUID v7 (time-ordered).
///
/// Used for execution ids so that records sort by creation time.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}
