//! Rate control for latest-buffer subscriptions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery rate for latest-buffer subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every buffer as it is ingested
    Native,

    /// At most this many updates per second (latest wins)
    Max(u32),
}

impl UpdateRate {
    /// Interval between deliveries, if throttled.
    ///
    /// `Max(0)` is treated as unthrottled.
    pub fn throttle_interval(self) -> Option<Duration> {
        match self {
            UpdateRate::Native | UpdateRate::Max(0) => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals() {
        assert_eq!(UpdateRate::Native.throttle_interval(), None);
        assert_eq!(UpdateRate::Max(0).throttle_interval(), None);
        assert_eq!(UpdateRate::Max(10).throttle_interval(), Some(Duration::from_millis(100)));
    }
}
