//! Abstraction for waiting between attempts
//!
//! Enables fast, deterministic tests without real time delays

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that records every requested delay and returns immediately
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// All requested delays, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of sleeps requested.
    pub fn calls(&self) -> usize {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The `index`-th requested delay.
    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).get(index).copied()
    }

    pub fn clear(&self) {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        Box::pin(async {})
    }
}

/// Test sleeper that holds every sleep until [`GateSleeper::open`] is called.
///
/// Lets a test act while the client is parked between two attempts.
#[derive(Debug, Clone)]
pub struct GateSleeper {
    gate: Arc<watch::Sender<bool>>,
    entered: Arc<AtomicUsize>,
}

impl GateSleeper {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self { gate: Arc::new(gate), entered: Arc::new(AtomicUsize::new(0)) }
    }

    /// Release all current and future sleeps.
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Number of sleeps that have started.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` sleeps have started.
    pub async fn wait_until_entered(&self, count: usize) {
        while self.entered() < count {
            tokio::task::yield_now().await;
        }
    }
}

impl Default for GateSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for GateSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let mut open = self.gate.subscribe();
        let entered = self.entered.clone();
        Box::pin(async move {
            entered.fetch_add(1, Ordering::SeqCst);
            let _ = open.wait_for(|open| *open).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_doesnt_sleep() {
        let start = std::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_calls() {
        let sleeper = TrackingSleeper::new();

        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(200)).await;

        assert_eq!(sleeper.calls(), 2);
        assert_eq!(sleeper.call_at(1), Some(Duration::from_millis(200)));
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(100), Duration::from_millis(200)]);

        sleeper.clear();
        assert_eq!(sleeper.calls(), 0);
    }

    #[tokio::test]
    async fn gate_sleeper_waits_for_open() {
        let sleeper = GateSleeper::new();
        let parked = tokio::spawn(sleeper.sleep(Duration::from_secs(60)));
        sleeper.wait_until_entered(1).await;
        assert!(!parked.is_finished());

        sleeper.open();
        parked.await.unwrap();
        // Already open: later sleeps pass straight through.
        sleeper.sleep(Duration::from_secs(60)).await;
        assert_eq!(sleeper.entered(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_follows_runtime_clock() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
