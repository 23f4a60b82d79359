//! Throughput policy shared by the switchboards of one user
//!
//! A [`Valve`] combines two concerns: token-bucket rate limits for each
//! direction, and signed byte counters that an accounting layer can drain
//! periodically with [`Valve::nullify`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use shroud_core::ValveConfig;

/// Byte-granular token bucket that lets callers run into debt and then
/// wait it off
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket refilling at `rate` bytes/s with one second of burst
    fn new(rate: u64) -> Self {
        let rate = rate as f64;
        Self {
            tokens: rate,
            capacity: rate,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    /// Take `n` tokens and return how long the caller must wait for them
    fn reserve(&mut self, n: usize) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }
}

/// Rate limits and usage counters for both directions
#[derive(Debug)]
pub struct Valve {
    rx_limit: Option<Mutex<TokenBucket>>,
    tx_limit: Option<Mutex<TokenBucket>>,
    rx_credit: AtomicI64,
    tx_credit: AtomicI64,
}

impl Valve {
    /// Create a valve with optional limits in bytes per second
    ///
    /// A limit of zero is treated as unlimited.
    pub fn new(rx_rate: Option<u64>, tx_rate: Option<u64>) -> Self {
        let bucket = |rate: Option<u64>| rate.filter(|r| *r > 0).map(|r| Mutex::new(TokenBucket::new(r)));
        Self {
            rx_limit: bucket(rx_rate),
            tx_limit: bucket(tx_rate),
            rx_credit: AtomicI64::new(0),
            tx_credit: AtomicI64::new(0),
        }
    }

    /// A valve that only counts
    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    /// Create a valve from configuration
    pub fn from_config(config: &ValveConfig) -> Self {
        Self::new(config.rx_rate, config.tx_rate)
    }

    /// Wait until `n` inbound bytes fit under the rx limit
    pub async fn rx_wait(&self, n: usize) {
        Self::wait(self.rx_limit.as_ref(), n).await
    }

    /// Wait until `n` outbound bytes fit under the tx limit
    pub async fn tx_wait(&self, n: usize) {
        Self::wait(self.tx_limit.as_ref(), n).await
    }

    async fn wait(limit: Option<&Mutex<TokenBucket>>, n: usize) {
        let Some(bucket) = limit else {
            return;
        };
        let delay = bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve(n);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Account `n` received bytes
    pub fn add_rx(&self, n: usize) {
        self.rx_credit.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Account `n` sent bytes
    pub fn add_tx(&self, n: usize) {
        self.tx_credit.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Bytes received since the last [`nullify`](Self::nullify)
    pub fn rx_credit(&self) -> i64 {
        self.rx_credit.load(Ordering::Relaxed)
    }

    /// Bytes sent since the last [`nullify`](Self::nullify)
    pub fn tx_credit(&self) -> i64 {
        self.tx_credit.load(Ordering::Relaxed)
    }

    /// Read and reset both counters, returning `(rx, tx)`
    pub fn nullify(&self) -> (i64, i64) {
        (
            self.rx_credit.swap(0, Ordering::Relaxed),
            self.tx_credit.swap(0, Ordering::Relaxed),
        )
    }
}

impl Default for Valve {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let valve = Valve::unlimited();
        let start = Instant::now();
        valve.tx_wait(10 * 1024 * 1024).await;
        valve.rx_wait(10 * 1024 * 1024).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_limit_delays_past_burst() {
        let valve = Valve::new(None, Some(1000));
        let start = Instant::now();

        // The first second's worth is burst
        valve.tx_wait(1000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        valve.tx_wait(500).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limits_from_loaded_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux.toml");
        std::fs::write(&path, "[valve]\ntx_rate = 2000\n").unwrap();

        let config = shroud_core::MuxConfig::load(&path).unwrap();
        let valve = Valve::from_config(&config.valve);
        let start = Instant::now();

        valve.tx_wait(2000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        valve.tx_wait(1000).await;
        assert!(start.elapsed() >= Duration::from_millis(500));

        // rx was left unset
        valve.rx_wait(1 << 20).await;
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_is_unlimited() {
        let valve = Valve::new(Some(0), Some(0));
        let start = Instant::now();
        valve.rx_wait(1 << 20).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_credit_accounting() {
        let valve = Valve::default();
        valve.add_rx(100);
        valve.add_rx(23);
        valve.add_tx(7);

        assert_eq!(valve.rx_credit(), 123);
        assert_eq!(valve.tx_credit(), 7);
        assert_eq!(valve.nullify(), (123, 7));
        assert_eq!(valve.rx_credit(), 0);
        assert_eq!(valve.tx_credit(), 0);
    }
}
