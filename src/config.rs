use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

/// Topology sizing and the registry/balance timing knobs. The defaults are
/// the reference topology; a TTL of zero means never expire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of fd-owning event loops.
    pub sub_reactors: usize,
    /// Number of decoders pulling readiness batches.
    pub decoders: usize,
    /// Worker count; sized generously because user methods may block.
    pub workers: usize,
    /// Seconds an idle writer waits before retiring from the pool.
    pub writer_idle_secs: u64,
    /// Seconds a registered server stays live without a heartbeat.
    pub registry_ttl_secs: u64,
    /// Seconds between heartbeats; the default keeps a comfortable margin
    /// under the registry TTL.
    pub heartbeat_secs: u64,
    /// Seconds the client-side service snapshot stays fresh.
    pub balance_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            sub_reactors: 10,
            decoders: 10,
            workers: 500,
            writer_idle_secs: 60,
            registry_ttl_secs: 120,
            heartbeat_secs: 60,
            balance_ttl_secs: 25,
        }
    }
}

impl Config {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    #[inline]
    pub fn writer_idle(&self) -> Duration {
        Duration::from_secs(self.writer_idle_secs)
    }

    #[inline]
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_secs)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    #[inline]
    pub fn balance_ttl(&self) -> Duration {
        Duration::from_secs(self.balance_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_topology() {
        let config = Config::default();
        assert_eq!(config.sub_reactors, 10);
        assert_eq!(config.decoders, 10);
        assert_eq!(config.workers, 500);
        assert_eq!(config.writer_idle(), Duration::from_secs(60));
        assert_eq!(config.registry_ttl(), Duration::from_secs(120));
        assert_eq!(
            config.registry_ttl() - config.heartbeat_interval(),
            Duration::from_secs(60)
        );
        assert_eq!(config.balance_ttl(), Duration::from_secs(25));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = serdeconv::from_toml_str("workers = 8").unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.sub_reactors, 10);
    }
}
