//! Coarse send-rate cap.
//!
//! The throttle looks at the bytes a pump moved since its accountant's
//! throttle mark. When they are ahead of what the cap allows for the time
//! since the mark, it returns how long the pump should hold off. The mark is
//! rolled forward every [`THROTTLE_WINDOW`], crediting only what the cap
//! allowed for the elapsed time; any surplus is carried into the next window,
//! so a datagram larger than one window's allowance still spreads out to the
//! cap over a long run. Idle time earns no credit beyond the current window.

use std::time::Duration;

use tokio::time::Instant;

use crate::account::Accountant;

/// Length of one throttle measurement window.
pub const THROTTLE_WINDOW: Duration = Duration::from_millis(100);

/// Shortest hold-off the throttle will ask for.
pub const MIN_QUANTUM: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    max_bps: u64,
}

impl Throttle {
    /// Cap at `max_bps` bits per second; `0` disables the cap.
    pub fn new(max_bps: u64) -> Self {
        Self { max_bps }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_limited(&self) -> bool {
        self.max_bps > 0
    }

    /// Bytes the cap allows over `elapsed`.
    fn allowance(&self, elapsed: Duration) -> u64 {
        let bytes = u128::from(self.max_bps) * elapsed.as_nanos() / 8_000_000_000;
        u64::try_from(bytes).unwrap_or(u64::MAX)
    }

    /// How long to wait before the next send, or `None` to send now.
    ///
    /// Waits are capped at one window so the pump re-checks its handle at
    /// least that often.
    pub fn delay(&self, acc: &Accountant, now: Instant) -> Option<Duration> {
        if !self.is_limited() {
            return None;
        }

        let (mut bytes, mut elapsed) = acc.throttle_sample(now);
        if elapsed >= THROTTLE_WINDOW {
            bytes = bytes.saturating_sub(self.allowance(elapsed));
            elapsed = Duration::ZERO;
            acc.roll_throttle_mark(now, bytes);
        }
        if bytes == 0 {
            return None;
        }

        let due = Duration::from_secs_f64((8 * bytes) as f64 / self.max_bps as f64);
        if due <= elapsed {
            return None;
        }
        Some((due - elapsed).clamp(MIN_QUANTUM, THROTTLE_WINDOW))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::FlowLabel;

    fn accountant() -> Accountant {
        Accountant::new(FlowLabel::new("0/1", "test send", "snd/s"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let throttle = Throttle::unlimited();
        let mut acc = accountant();
        for _ in 0..1000 {
            acc.update(65_000, Duration::from_secs(60));
        }
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(throttle.delay(&acc, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_cap_sends() {
        // 1 Mbps cap; 1000 bytes in 10ms is 0.8 Mbps.
        let throttle = Throttle::new(1_000_000);
        let mut acc = accountant();
        acc.update(1000, Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(throttle.delay(&acc, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_cap_waits_until_average_meets_cap() {
        // 1000 bytes is 8000 bits, which takes 8ms at 1 Mbps.
        let throttle = Throttle::new(1_000_000);
        let mut acc = accountant();
        acc.update(1000, Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(
            throttle.delay(&acc, Instant::now()),
            Some(Duration::from_millis(6))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded() {
        let throttle = Throttle::new(8);
        let mut acc = accountant();
        acc.update(1_000_000, Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(throttle.delay(&acc, Instant::now()), Some(THROTTLE_WINDOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_surplus_carries_into_next_window() {
        // 100 000 bytes at 1 Mbps is 800ms worth of sending.
        let throttle = Throttle::new(1_000_000);
        let mut acc = accountant();
        acc.update(100_000, Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(throttle.delay(&acc, Instant::now()), Some(THROTTLE_WINDOW));

        // A new window starts, but it still owes 650ms.
        tokio::time::advance(THROTTLE_WINDOW).await;
        assert_eq!(throttle.delay(&acc, Instant::now()), Some(THROTTLE_WINDOW));
        assert_eq!(throttle.delay(&acc, Instant::now()), Some(THROTTLE_WINDOW));

        // Once the debt is paid off the pump may send again.
        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(throttle.delay(&acc, Instant::now()), None);
        assert_eq!(throttle.delay(&acc, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_datagram_larger_than_window_allowance() {
        // 10 kbps allows 125 bytes per window; one 1470 byte datagram
        // takes 1.176s to pay off.
        let throttle = Throttle::new(10_000);
        let mut acc = accountant();
        acc.update(1470, Duration::from_secs(60));

        let mut waited = Duration::ZERO;
        while let Some(wait) = throttle.delay(&acc, Instant::now()) {
            tokio::time::advance(wait).await;
            waited += wait;
        }
        assert!(
            waited >= Duration::from_millis(1170) && waited <= Duration::from_millis(1200),
            "waited {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_earns_no_burst() {
        let throttle = Throttle::new(1_000_000);
        let mut acc = accountant();

        // A long idle stretch rolls the mark forward with nothing owed.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(throttle.delay(&acc, Instant::now()), None);

        // The next send is judged against the fresh window alone.
        acc.update(1000, Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(
            throttle.delay(&acc, Instant::now()),
            Some(Duration::from_millis(7))
        );
    }
}
