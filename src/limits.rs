//! Upper bounds enforced at the engine boundary.

pub const MAX_STUDENTS_PER_RESERVATION: usize = 32;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_PHONE_LEN: usize = 32;

/// Longest lesson accepted on the direct create path (12 hours).
pub const MAX_LESSON_MINUTES: u32 = 12 * 60;

/// Widest date range a single list query may cover.
pub const MAX_QUERY_DAYS: i64 = 93;

pub const MAX_REASON_LEN: usize = 1024;

/// Largest single cache payload written to the durable tier.
pub const MAX_CACHE_ENTRY_BYTES: usize = 8 * 1024 * 1024;

/// Outbound notification queue depth before new messages are dropped.
pub const OUTBOX_CAPACITY: usize = 1024;

/// Overrides kept in memory for listing; the audit file keeps them all.
pub const MAX_RECENT_OVERRIDES: usize = 1000;
