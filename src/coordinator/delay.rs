use crate::core::ResourceId;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

/// Pause injected between the read and the write of the unlocked
/// read-modify-write path, to widen its race window in tests and demos.
#[async_trait]
pub trait DelayHook: Send + Sync {
    async fn pause(&self, resource: ResourceId);
}

/// No pause at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

#[async_trait]
impl DelayHook for NoDelay {
    async fn pause(&self, _resource: ResourceId) {}
}

/// Sleep for the same duration every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

#[async_trait]
impl DelayHook for FixedDelay {
    async fn pause(&self, _resource: ResourceId) {
        tokio::time::sleep(self.0).await;
    }
}

/// Sleep for a uniformly random duration in `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct JitterDelay {
    min: Duration,
    max: Duration,
}

impl JitterDelay {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    fn sample(&self) -> Duration {
        let min = self.min.as_micros() as u64;
        let max = self.max.as_micros() as u64;
        Duration::from_micros(rand::thread_rng().gen_range(min..=max))
    }
}

#[async_trait]
impl DelayHook for JitterDelay {
    async fn pause(&self, _resource: ResourceId) {
        let pause = self.sample();
        tokio::time::sleep(pause).await;
    }
}
