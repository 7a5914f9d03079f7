//! Management API throttle - one token bucket per operation

use crate::dispatch::TokenBucket;
use dashmap::DashMap;
use outpost_common::config::ManagementConfig;
use outpost_common::{Error, Result};
use tracing::debug;

pub struct ManagementThrottle {
    calls_per_second: f64,
    buckets: DashMap<&'static str, TokenBucket>,
}

impl ManagementThrottle {
    /// A rate of zero or less disables throttling
    pub fn new(calls_per_second: f64) -> Self {
        Self {
            calls_per_second,
            buckets: DashMap::new(),
        }
    }

    pub fn from_config(config: &ManagementConfig) -> Self {
        Self::new(config.calls_per_second)
    }

    /// Admit one call of `operation` or fail with `Throttling`
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.calls_per_second <= 0.0 {
            return Ok(());
        }

        let admitted = self
            .buckets
            .entry(operation)
            .or_insert_with(|| TokenBucket::new(self.calls_per_second))
            .try_acquire();

        if admitted {
            Ok(())
        } else {
            debug!(operation, "Management call throttled");
            Err(Error::Throttling(operation.to_string()))
        }
    }
}
