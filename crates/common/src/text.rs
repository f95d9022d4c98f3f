use sha2::{Digest, Sha256};

/// Truncate `s` to at most `n` code points. Longer inputs keep their first
/// `n - 3` code points and gain a `...` suffix; for `n <= 3` the input is cut
/// hard. The flag reports whether anything was dropped.
pub fn truncate(s: &str, n: usize) -> (String, bool) {
    if s.chars().count() <= n {
        return (s.to_string(), false);
    }
    if n <= 3 {
        return (s.chars().take(n).collect(), true);
    }
    let mut out: String = s.chars().take(n - 3).collect();
    out.push_str("...");
    (out, true)
}

/// Lowercase hex SHA-256 of a group key. Providers cap identifier length, so
/// dedup and incident keys use this fixed-size surrogate.
pub fn sha256hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
