//! Configuration for the event bus.

/// Configuration for the in-process event bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Messages buffered per subscriber before new ones are dropped for it.
    pub buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-subscriber buffer. Values below 1 are raised to 1.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }
}
