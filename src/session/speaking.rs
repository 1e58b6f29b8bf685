//! Speaking-detection loop deadline.
//!
//! Not an interval: the next tick is scheduled only after the previous one
//! ran, and cancelling simply clears the deadline.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct SpeakingLoop {
    period: Duration,
    deadline: Option<Instant>,
}

impl SpeakingLoop {
    pub fn new(period: Duration) -> Self {
        Self { period, deadline: None }
    }

    pub fn start(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
    }

    /// Schedule the next tick; no-op once cancelled
    pub fn reschedule(&mut self) {
        if self.deadline.is_some() {
            self.start();
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve at the deadline; never resolves while cancelled
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_period() {
        let mut tick = SpeakingLoop::new(Duration::from_millis(16));
        tick.start();
        let before = Instant::now();
        tick.wait().await;
        assert!(Instant::now() - before >= Duration::from_millis(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_never_fires() {
        let mut tick = SpeakingLoop::new(Duration::from_millis(16));
        tick.start();
        tick.cancel();
        tick.reschedule();
        assert!(!tick.is_active());

        let fired = tokio::time::timeout(Duration::from_secs(1), tick.wait()).await;
        assert!(fired.is_err());
    }
}
