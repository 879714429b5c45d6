use std::time::{SystemTime, UNIX_EPOCH};

pub const CURRENT: &str = "Current";
pub const SESSION: &str = "Session";
pub const TEST_OUTPUT_PREFIX: &str = "TestOutput-";
pub const MOCK_STATE_PREFIX: &str = "MockState-";

/// Sort key for a new output: zero-padded microsecond timestamp plus a random
/// suffix, so independent writers never collide and keys sort by wall clock.
pub fn output_sort_key(at: SystemTime) -> String {
    let micros = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let suffix: u64 = rand::random();
    format!("{TEST_OUTPUT_PREFIX}{micros:020}-{suffix:016x}")
}

pub fn mock_state_key(mock_id: &str) -> String {
    format!("{MOCK_STATE_PREFIX}{mock_id}")
}

pub fn is_output_key(sk: &str) -> bool {
    sk.starts_with(TEST_OUTPUT_PREFIX)
}
