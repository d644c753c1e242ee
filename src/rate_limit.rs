// Rate limiting - rolling-window probe budget, one instance per worker.
//
// The window holds the emission times of the last minute of probes. When a
// worker would exceed its budget it sleeps until the earliest emission falls
// outside the window, which makes the guarantee exact over any rolling
// 60-second span rather than per calendar minute.

use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

pub struct RateWindow {
    window: Duration,
    emissions: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            emissions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Take one emission slot, sleeping as long as needed. `limit` is passed
    /// per call because the settings store is re-read every cycle; a limit
    /// of zero is clamped to one so a misconfigured node degrades instead of
    /// stalling forever.
    pub async fn acquire(&self, limit: u32) {
        let limit = limit.max(1) as usize;
        loop {
            let wait = {
                let mut emissions = self.emissions.lock().await;
                let now = Instant::now();
                while emissions
                    .front()
                    .map(|t| now.duration_since(*t) >= self.window)
                    .unwrap_or(false)
                {
                    emissions.pop_front();
                }
                if emissions.len() < limit {
                    emissions.push_back(now);
                    return;
                }
                // Head of the deque is the earliest in-window emission
                *emissions.front().expect("non-empty at capacity") + self.window - now
            };
            sleep(wait).await;
        }
    }

    /// Emissions currently inside the window (observational).
    pub async fn in_window(&self) -> usize {
        let mut emissions = self.emissions.lock().await;
        let now = Instant::now();
        while emissions
            .front()
            .map(|t| now.duration_since(*t) >= self.window)
            .unwrap_or(false)
        {
            emissions.pop_front();
        }
        emissions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_limit_is_immediate() {
        let window = RateWindow::per_minute();
        let start = Instant::now();
        for _ in 0..30 {
            window.acquire(30).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(window.in_window().await, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_enforced_over_rolling_window() {
        let window = RateWindow::per_minute();
        for _ in 0..30 {
            window.acquire(30).await;
        }
        let start = Instant::now();
        window.acquire(30).await;
        // The 31st emission had to wait for the first to age out
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(window.in_window().await, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spread_emissions_refill_incrementally() {
        let window = RateWindow::per_minute();
        // Two emissions 30s apart
        window.acquire(2).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        window.acquire(2).await;

        // At capacity; the next acquire waits only until the first slot
        // ages out (30 more seconds), not a full minute.
        let start = Instant::now();
        window.acquire(2).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(30));
        assert!(waited < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_clamped() {
        let window = RateWindow::per_minute();
        // Must not deadlock
        window.acquire(0).await;
        assert_eq!(window.in_window().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate_matches_limit() {
        let window = RateWindow::new(Duration::from_secs(60));
        let start = Instant::now();
        // 90 emissions at limit 30: first 30 at t=0, the rest paced by
        // the window, completing two more full windows.
        for _ in 0..90 {
            window.acquire(30).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(120));
        assert!(elapsed < Duration::from_secs(121));
    }
}
