use chrono::Utc;

/// Current wall-clock time as unix milliseconds. Cache row expiries (`exp`)
/// are compared against this everywhere.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
