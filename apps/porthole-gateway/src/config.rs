use std::env;
use std::time::Duration;

use porthole_core::chunk::ChunkPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub shell: String,
    /// WebSocket keepalive sentinel cadence is a third of this.
    pub liveness_timeout: Duration,
    /// Close a session after this long without user input.
    pub idle_timeout: Duration,
    /// Close a session after this long regardless of activity.
    pub connection_timeout: Duration,
    pub cache_ttl: Duration,
    pub upload_dir: String,
    /// JSON-lines audit trail; unset disables file auditing.
    pub audit_log: Option<String>,
    pub chunk: ChunkPolicy,
}

fn secs_env(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    pub fn from_env() -> Self {
        let chunk = ChunkPolicy {
            threshold: env::var("PORTHOLE_CHUNK_THRESHOLD")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(1000),
            fragment: env::var("PORTHOLE_CHUNK_FRAGMENT")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(500),
            delay: Duration::from_millis(
                env::var("PORTHOLE_CHUNK_DELAY_MS")
                    .ok()
                    .and_then(|val| val.parse().ok())
                    .unwrap_or(50),
            ),
        };

        Self {
            host: env::var("PORTHOLE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORTHOLE_PORT")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(8006),
            shell: env::var("PORTHOLE_SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
            liveness_timeout: secs_env("PORTHOLE_LIVENESS_TIMEOUT", 45),
            idle_timeout: secs_env("PORTHOLE_IDLE_TIMEOUT", 300),
            connection_timeout: secs_env("PORTHOLE_CONNECTION_TIMEOUT", 3600),
            cache_ttl: secs_env("PORTHOLE_CACHE_TTL", 300),
            upload_dir: env::var("PORTHOLE_UPLOAD_DIR").unwrap_or_else(|_| "/tmp".to_string()),
            audit_log: env::var("PORTHOLE_AUDIT_LOG").ok(),
            chunk,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8006,
            shell: "/bin/bash".to_string(),
            liveness_timeout: Duration::from_secs(45),
            idle_timeout: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(3600),
            cache_ttl: Duration::from_secs(300),
            upload_dir: "/tmp".to_string(),
            audit_log: None,
            chunk: ChunkPolicy::default(),
        }
    }
}
