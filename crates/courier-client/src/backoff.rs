use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// A connection that has been up for this long resets the attempt counter on
/// its next drop.
pub const RECONNECT_RESET_AFTER: Duration = Duration::from_secs(60 * 5);

/// After retrying for this long without a successful connect, the client
/// stops and stays `Disconnected` until an explicit reconnect.
pub const GIVE_UP_AFTER: Duration = Duration::from_secs(60 * 5);

/// Capped exponential backoff with jitter. Returns the deadline for the next
/// attempt and the chosen delay in milliseconds.
pub fn schedule_reconnect(attempt: u32) -> (Instant, u64) {
    let base_ms = 500u64;
    let max_ms = 30_000u64;
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(6));
    let delay_ms = (base_ms.saturating_mul(pow)).min(max_ms);
    let jitter_window = (delay_ms / 10).max(1);
    let mut rng = rand::rng();
    let jitter_offset = rng.random_range(0..=(jitter_window * 2));
    let final_ms = delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset);
    (Instant::now() + Duration::from_millis(final_ms), final_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_bounds() {
        for attempt in 1..=20 {
            let (_, ms) = schedule_reconnect(attempt);
            let base = (500u64 * 2u64.pow((attempt - 1).min(6))).min(30_000);
            let window = (base / 10).max(1);
            assert!(ms >= base - window, "attempt {attempt}: {ms} < {}", base - window);
            assert!(ms <= base + window, "attempt {attempt}: {ms} > {}", base + window);
        }
    }

    #[test]
    fn delay_is_capped() {
        let (_, ms) = schedule_reconnect(100);
        assert!(ms <= 33_000);
    }

    #[test]
    fn first_attempt_is_near_base() {
        let (_, ms) = schedule_reconnect(1);
        assert!((450..=550).contains(&ms));
    }
}
