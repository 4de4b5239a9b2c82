//! Configuration system.
//!
//! Loads client configuration from JSON strings/files (file IO left to app).

use serde::{Deserialize, Serialize};

/// Root configuration for the world client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Simulation server hostname.
    pub server_host: String,
    /// Simulation server port.
    pub server_port: u16,
    /// Directory for the persistent asset cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

fn default_cache_dir() -> String {
    "cache".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 12345,
            cache_dir: default_cache_dir(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
