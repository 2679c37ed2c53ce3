//! Request pacing between chunk fetches

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Waits between consecutive remote requests.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, interval: Duration);
}

/// Real-time pacer backed by `tokio::time::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SleepPacer;

#[async_trait]
impl Pacer for SleepPacer {
    async fn pause(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        debug!("Pacing for {:?}", interval);
        tokio::time::sleep(interval).await;
    }
}
