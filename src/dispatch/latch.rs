//! Countdown latch parameterized by a completion ratio.
//!
//! A latch over `n` slots with ratio `r` releases waiters once
//! `ceil(n * r)` completions have been observed. Ratio 1.0 waits for every
//! slot; lower ratios let a dispatch move on before stragglers answer.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CountdownLatch {
    inner: Arc<LatchInner>,
}

#[derive(Debug)]
struct LatchInner {
    remaining: Mutex<u64>,
    done: watch::Sender<bool>,
}

impl CountdownLatch {
    pub fn new(slots: usize, ratio: f64) -> Self {
        let needed = (slots as f64 * ratio.clamp(0.0, 1.0)).ceil() as u64;
        let (done, _) = watch::channel(needed == 0);
        Self {
            inner: Arc::new(LatchInner {
                remaining: Mutex::new(needed),
                done,
            }),
        }
    }

    /// Record one completion. Extra completions past the threshold are
    /// accepted and ignored.
    pub fn count_down(&self) {
        let mut remaining = self.inner.remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                let _ = self.inner.done.send(true);
            }
        }
    }

    pub fn is_released(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Wait until enough completions arrive. Callers bound this with a
    /// timeout; the latch itself never gives up.
    pub async fn wait(&self) {
        let mut rx = self.inner.done.subscribe();
        // The sender lives inside the latch, so this cannot error while we
        // hold `self`.
        let _ = rx.wait_for(|released| *released).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn releases_after_all_slots() {
        let latch = CountdownLatch::new(3, 1.0);
        assert!(!latch.is_released());
        latch.count_down();
        latch.count_down();
        assert!(!latch.is_released());
        latch.count_down();
        latch.wait().await;
        assert!(latch.is_released());
    }

    #[tokio::test]
    async fn ratio_rounds_up() {
        // ceil(4 * 0.6) = 3
        let latch = CountdownLatch::new(4, 0.6);
        latch.count_down();
        latch.count_down();
        assert!(!latch.is_released());
        latch.count_down();
        assert!(latch.is_released());
    }

    #[tokio::test]
    async fn zero_slots_release_immediately() {
        let latch = CountdownLatch::new(0, 1.0);
        latch.wait().await;
    }

    #[tokio::test]
    async fn zero_ratio_releases_immediately() {
        let latch = CountdownLatch::new(7, 0.0);
        assert!(latch.is_released());
    }

    #[tokio::test]
    async fn extra_completions_are_harmless() {
        let latch = CountdownLatch::new(2, 1.0);
        for _ in 0..5 {
            latch.count_down();
        }
        assert!(latch.is_released());
    }

    #[tokio::test]
    async fn wait_blocks_until_released() {
        let latch = CountdownLatch::new(1, 1.0);
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        latch.count_down();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
