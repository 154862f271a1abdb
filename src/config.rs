use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_PORT;

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// TCP port the listener binds and the dialer targets.
    pub port: u16,
    /// Default destination for received files.
    pub download_directory: String,
    /// Transfer chunk size in bytes. Larger chunks trade latency for
    /// throughput.
    pub chunk_size: usize,
    /// Minimum interval between progress/speed samples, in milliseconds.
    pub progress_interval_ms: u64,
    /// Bounded wait applied to receive operations, in seconds. A timeout
    /// with no data is retried; it is not itself an error.
    pub receive_timeout_secs: u64,
    /// Previously used peer addresses, most recent first. Persisted by the
    /// UI layer; the core takes the initial value and emits updates.
    pub recent_peers: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());

        Self {
            port: DEFAULT_PORT,
            download_directory: format!("{}/Downloads", home),
            chunk_size: 256 * 1024,
            progress_interval_ms: 200,
            receive_timeout_secs: 60,
            recent_peers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file or create default
    pub fn load_or_default(config_path: Option<&str>) -> Self {
        if let Some(config) = config_path
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
        {
            return config;
        }
        Self::default()
    }

    /// Save configuration to file
    pub fn save_to_file(&self, config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Get the download directory as PathBuf
    pub fn download_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.download_directory)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    /// Ensure the download directory exists
    pub fn ensure_directories(&self) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.download_directory)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.chunk_size == 0 {
            return Err("Chunk size must be greater than 0".into());
        }

        if self.port == 0 {
            return Err("Port must be greater than 0".into());
        }

        if self.receive_timeout_secs == 0 {
            return Err("Receive timeout must be greater than 0".into());
        }

        Ok(())
    }
}
