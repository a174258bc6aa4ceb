//! Hard limits enforced by the engine and the SQL surface.

pub const MAX_MEMBERS: usize = 10_000;
pub const MAX_REQUESTS: usize = 1_000_000;
pub const MAX_HOLIDAYS: usize = 10_000;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_LABEL_LEN: usize = 128;
pub const MAX_COMMENT_LEN: usize = 1024;

/// Upper bound for either balance on a member.
pub const MAX_BALANCE: u32 = 100_000;

/// Discretionary hours are requested per day, between these bounds.
pub const MIN_DISCRETIONARY_HOURS: u32 = 1;
pub const MAX_DISCRETIONARY_HOURS: u32 = 8;

/// Accepted calendar years for requests, holidays and calendar queries.
pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 2200;

/// Rows per multi-row INSERT.
pub const MAX_BATCH_SIZE: usize = 1000;
