//! Session configuration.

use std::io::Read;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default fabric port both roles agree on.
pub const DEFAULT_PORT: u16 = 12345;

/// Tunables for one session, loadable from a TOML file.
///
/// Defaults reproduce the canonical demo: a 1 MiB exposed region, a
/// 100-byte bulk payload, and two-second resolution timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Port the responder listens on and the initiator connects to.
    pub port: u16,
    /// Listen backlog hint.
    pub backlog: u32,
    /// Length of the responder's exposed region.
    pub region_len: usize,
    /// Bytes of the region pushed as bulk payload and read back by the
    /// one-sided session. Must stay within one page.
    pub bulk_len: usize,
    /// Bounded wait for address and route resolution, milliseconds.
    pub resolve_timeout_ms: u64,
    /// Bounded wait for an incoming connection request, milliseconds.
    pub accept_timeout_ms: u64,
    /// Bounded wait for any single completion, milliseconds.
    pub completion_timeout_ms: u64,
    /// Completion queue depth.
    pub cq_depth: usize,
    /// Greeting the responder pre-fills its region with.
    pub greeting: String,
    /// Message the initiator writes into the remote region.
    pub message: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backlog: 1,
            region_len: 1 << 20,
            bulk_len: 100,
            resolve_timeout_ms: 2000,
            accept_timeout_ms: 60_000,
            completion_timeout_ms: 5000,
            cq_depth: 16,
            greeting: "Hello from Server! This is RDMA magic.".into(),
            message: "HELLO FROM CLIENT! I modified your RAM via RDMA!".into(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_toml(path: &str) -> Result<Self> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| Error::Config(format!("cannot open {path}: {e}")))?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)
            .map_err(|e| Error::Config(format!("cannot read {path}: {e}")))?;
        let config: Config =
            toml::from_str(&toml_str).map_err(|e| Error::Config(format!("bad {path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bulk_len == 0 || self.bulk_len > crate::utils::page_size() {
            return Err(Error::Config(format!(
                "bulk_len {} must be within one page",
                self.bulk_len
            )));
        }
        if self.region_len < self.bulk_len {
            return Err(Error::Config("region_len smaller than bulk_len".into()));
        }
        Ok(())
    }

    /// Bounded wait for resolution steps.
    #[inline]
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Bounded wait for a single completion.
    #[inline]
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    /// Bounded wait for an incoming connection request.
    #[inline]
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_demo_constants() {
        let c = Config::default();
        assert_eq!(c.port, 12345);
        assert_eq!(c.region_len, 1 << 20);
        assert_eq!(c.bulk_len, 100);
        assert_eq!(c.greeting.len(), 38);
        assert_eq!(c.message.len(), 48);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn toml_overrides_apply() {
        let parsed: Config = toml::from_str(
            r#"
            port = 23456
            region_len = 65536
            greeting = "hi"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.port, 23456);
        assert_eq!(parsed.region_len, 65536);
        assert_eq!(parsed.greeting, "hi");
        // Untouched fields keep their defaults.
        assert_eq!(parsed.bulk_len, 100);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("nonsense = 1").is_err());
    }

    #[test]
    fn oversized_bulk_is_rejected() {
        let c = Config {
            bulk_len: crate::utils::page_size() + 1,
            ..Config::default()
        };
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }
}
