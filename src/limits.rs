use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single reservation may not hold a resource for more than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;

/// Upper bound on units requested in one direct booking or attachment.
pub const MAX_UNITS_PER_REQUEST: u32 = 10_000;

/// Distinct articles bundled into a single room reservation.
pub const MAX_ATTACHMENTS_PER_RESERVATION: usize = 64;

/// Commitments held by one resource ledger.
pub const MAX_COMMITMENTS_PER_RESOURCE: usize = 100_000;

pub const MAX_QUERY_LIMIT: usize = 1_000;

/// Largest single wire request line.
pub const MAX_REQUEST_LINE_BYTES: usize = 64 * 1024;
