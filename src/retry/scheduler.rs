//! Inter-attempt delay.
//!
//! The supervisor suspends through a [`RetryScheduler`] so that tests can
//! substitute a scheduler that never touches the clock.

use async_trait::async_trait;
use std::time::Duration;

/// Executes the delay between a failed attempt and the next one.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    /// Suspend for `delay`. A zero delay must return without suspending.
    async fn delay(&self, delay: Duration);
}

/// Scheduler backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl RetryScheduler for TokioScheduler {
    async fn delay(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}
