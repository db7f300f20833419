use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;

/// Cooperative shutdown flag shared between the binary and the background
/// loops. Cloning shares the underlying flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Trip the flag on Ctrl-C.
    pub fn listen_for_ctrl_c(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            log::info!("Shutdown requested (Ctrl-C)");
            flag.request();
        })?;
        Ok(())
    }

    /// Sleep up to `duration`, waking early when shutdown is requested.
    /// Long idle sleeps (the sweeper's 15 minute interval) must not delay
    /// process exit.
    pub async fn sleep(&self, duration: Duration) {
        const TICK: Duration = Duration::from_millis(250);
        let mut remaining = duration;
        while !self.is_requested() && !remaining.is_zero() {
            let step = remaining.min(TICK);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_returns_early_on_request() {
        let flag = ShutdownFlag::new();
        let sleeper = flag.clone();

        let start = std::time::Instant::now();
        let handle = tokio::spawn(async move {
            sleeper.sleep(Duration::from_secs(60)).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        flag.request();
        handle.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
