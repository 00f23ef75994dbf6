//! Server configuration.

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum entries accepted in one push request.
    pub max_push_batch: usize,
    /// Maximum records returned by one pull.
    pub max_pull_records: usize,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_push_batch: 500,
            max_pull_records: 10_000,
        }
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size.max(1);
        self
    }

    /// Sets the maximum number of records per pull.
    pub fn with_max_pull_records(mut self, size: usize) -> Self {
        self.max_pull_records = size.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_push_batch, 500);
        assert_eq!(config.max_pull_records, 10_000);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new().with_max_push_batch(0).with_max_pull_records(20);
        assert_eq!(config.max_push_batch, 1);
        assert_eq!(config.max_pull_records, 20);
    }
}
