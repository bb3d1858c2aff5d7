//! Session retry policies

use crate::domain::models::DeviceStatus;

/// Decides whether a failed or timed out session is started again.
pub trait RetryPolicy: Send {
    /// `status` is the device status at the time of the failure, `None` when
    /// the device is no longer known. `retry_count` counts earlier retries.
    fn should_retry(&self, status: Option<DeviceStatus>, retry_count: u32) -> bool;
}

/// Retry for as long as the device is still connected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStillKnown;

impl RetryPolicy for DeviceStillKnown {
    fn should_retry(&self, status: Option<DeviceStatus>, _retry_count: u32) -> bool {
        matches!(status, Some(DeviceStatus::Connected | DeviceStatus::Ranging))
    }
}

/// Like [`DeviceStillKnown`], bounded to `max` retries.
#[derive(Debug, Clone, Copy)]
pub struct MaxAttempts {
    pub max: u32,
}

impl RetryPolicy for MaxAttempts {
    fn should_retry(&self, status: Option<DeviceStatus>, retry_count: u32) -> bool {
        retry_count < self.max && DeviceStillKnown.should_retry(status, retry_count)
    }
}

/// Policy selected by `retry_max_attempts`.
pub fn from_settings(retry_max_attempts: Option<u32>) -> Box<dyn RetryPolicy> {
    match retry_max_attempts {
        Some(max) => Box::new(MaxAttempts { max }),
        None => Box::new(DeviceStillKnown),
    }
}
