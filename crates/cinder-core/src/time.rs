//! Monotonic millisecond clock for expiry bookkeeping.
//!
//! Expiry deadlines are stored as milliseconds since process start, which
//! keeps entries small and immune to wall-clock jumps. They never leave the
//! process: key transfers carry the remaining TTL instead.

use std::sync::OnceLock;
use std::time::Instant;

/// Returns current monotonic time in milliseconds since process start.
#[inline]
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Sentinel value meaning "no expiry".
pub const NO_EXPIRY: u64 = 0;

#[inline]
pub fn is_expired(expires_at_ms: u64) -> bool {
    expires_at_ms != NO_EXPIRY && now_ms() >= expires_at_ms
}

/// Converts a relative TTL in milliseconds to an absolute deadline.
/// `max(1)` keeps a deadline computed at process start from colliding
/// with the sentinel.
#[inline]
pub fn deadline_after(ttl_ms: u64) -> u64 {
    now_ms().saturating_add(ttl_ms).max(1)
}

/// Returns remaining TTL in milliseconds, or None if no expiry.
#[inline]
pub fn remaining_ms(expires_at_ms: u64) -> Option<u64> {
    if expires_at_ms == NO_EXPIRY {
        None
    } else {
        Some(expires_at_ms.saturating_sub(now_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_expiry_never_expires() {
        assert!(!is_expired(NO_EXPIRY));
        assert_eq!(remaining_ms(NO_EXPIRY), None);
    }

    #[test]
    fn deadlines() {
        let deadline = deadline_after(60_000);
        assert!(!is_expired(deadline));
        let left = remaining_ms(deadline).unwrap();
        assert!(left <= 60_000 && left > 59_000);
    }
}
