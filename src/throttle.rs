use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Length of one accounting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Fixed-window read governor.
///
/// Bytes are attributed to the current one-second window. When admitting the
/// next chunk would push the window over the configured ceiling, the caller
/// waits out the rest of the window and starts a fresh one. No credit is
/// carried from one window into the next, so a caller may burst up to the full
/// per-second allowance at the start of each window.
///
/// The throttler is consulted before each read (pre-emptive), so the ceiling
/// is enforced before bytes arrive rather than corrected afterwards.
#[derive(Debug)]
pub struct BandwidthThrottler {
    target_bytes_per_second: u64,
    window_start: Instant,
    bytes_in_window: u64,
}

impl BandwidthThrottler {
    pub fn new(bytes_per_second: u64) -> Result<Self> {
        if bytes_per_second == 0 {
            return Err(Error::InvalidArgument(
                "bandwidth limit must be a positive number of bytes per second".into(),
            ));
        }

        Ok(Self {
            target_bytes_per_second: bytes_per_second,
            window_start: Instant::now(),
            bytes_in_window: 0,
        })
    }

    pub fn target_bytes_per_second(&self) -> u64 {
        self.target_bytes_per_second
    }

    pub fn bytes_in_window(&self) -> u64 {
        self.bytes_in_window
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Decides whether a chunk of `n` bytes may be read at `now`.
    ///
    /// Rolls the window over first if it has expired. Returns the time the
    /// caller has to wait before reading, or `None` if the chunk fits. An empty
    /// window always admits, which bounds the overshoot to a single chunk.
    pub fn admit(&mut self, n: u64, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= WINDOW {
            self.roll_over(now);
            return None;
        }

        if self.bytes_in_window > 0
            && self.bytes_in_window.saturating_add(n) > self.target_bytes_per_second
        {
            return Some(WINDOW.saturating_sub(elapsed));
        }

        None
    }

    /// Waits until `n` more bytes fit into the current window.
    pub async fn acquire(&mut self, n: u64) {
        if let Some(wait) = self.admit(n, Instant::now()) {
            debug!(
                wait_ms = wait.as_millis() as u64,
                bytes_in_window = self.bytes_in_window,
                limit = self.target_bytes_per_second,
                "Window budget exhausted, waiting for next window"
            );
            tokio::time::sleep(wait).await;
            self.roll_over(Instant::now());
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up with [`Error::Cancelled`]
    /// once `cancel` fires. The window is left untouched on cancellation.
    pub async fn acquire_cancellable(&mut self, n: u64, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(wait) = self.admit(n, Instant::now()) {
            debug!(
                wait_ms = wait.as_millis() as u64,
                bytes_in_window = self.bytes_in_window,
                "Window budget exhausted, waiting for next window"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => self.roll_over(Instant::now()),
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        Ok(())
    }

    /// Attributes `n` bytes that were actually read to the current window.
    pub fn record(&mut self, n: u64) {
        self.bytes_in_window = self.bytes_in_window.saturating_add(n);
    }

    fn roll_over(&mut self, now: Instant) {
        self.window_start = now;
        self.bytes_in_window = 0;
    }
}
