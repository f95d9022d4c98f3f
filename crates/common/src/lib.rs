pub mod alert;
pub mod retry;
pub mod tenant;
pub mod text;

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
