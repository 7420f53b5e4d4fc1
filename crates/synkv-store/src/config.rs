use serde::{Deserialize, Serialize};

/// Configuration for a [`Store`](crate::Store).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How many recent local writes per key are remembered to recognise the
    /// backend echoing them back. `0` disables echo suppression.
    pub echo_window: usize,
    /// Capacity of the out-of-band error channel.
    pub error_channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            echo_window: 16,
            error_channel_capacity: 64,
        }
    }
}
