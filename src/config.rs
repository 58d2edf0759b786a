//! Channel configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields the
//! depth-1, 16B-inline setup the communicator is designed around.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables of an [`RdmaChannel`](crate::channel::RdmaChannel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Requested send queue depth.
    pub max_send_wr: u32,
    /// Requested receive queue depth.
    pub max_recv_wr: u32,
    /// Requested SGEs per send work request.
    pub max_send_sge: u32,
    /// Requested SGEs per receive work request.
    pub max_recv_sge: u32,
    /// Requested inline data size, which is also the largest message that is
    /// ever posted inline.
    pub max_inline_data: u32,
    /// Listen backlog. `0` lets the connection manager pick.
    pub backlog: i32,
    /// Number of empty completion polls between two peer liveness checks.
    pub peer_check_interval: u32,
    /// Seconds a poll may spin before a warning is logged. Only used with
    /// the `warned_spin` feature.
    pub spin_warn_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_send_wr: 1,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 16,
            backlog: 0,
            peer_check_interval: 1024,
            spin_warn_secs: 5,
        }
    }
}

impl ChannelConfig {
    /// Name of the TOML table that holds the configuration.
    pub const TOML_TABLE: &'static str = "rrcomm";

    /// Parse a TOML document.
    ///
    /// The keys are read from the `[rrcomm]` table if there is one, or from
    /// the top level otherwise.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut doc: toml::Table = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        let table = match doc.remove(Self::TOML_TABLE) {
            Some(toml::Value::Table(t)) => t,
            Some(_) => {
                return Err(Error::Config(format!(
                    "`{}` is not a table",
                    Self::TOML_TABLE
                )))
            }
            None => doc,
        };
        let config: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from a file, picking the format by extension
    /// (`.json` for JSON, anything else for TOML).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Check that the configuration can set up a queue pair at all.
    pub fn validate(&self) -> Result<()> {
        if self.max_send_wr == 0 || self.max_recv_wr == 0 {
            return Err(Error::Config("queue depth must be at least 1".to_owned()));
        }
        if self.max_send_sge == 0 || self.max_recv_sge == 0 {
            return Err(Error::Config(
                "at least 1 SGE per work request is required".to_owned(),
            ));
        }
        if self.peer_check_interval == 0 {
            return Err(Error::Config(
                "peer check interval must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    #[test]
    fn test_toml_table() {
        let config = ChannelConfig::from_toml_str(
            r#"
            [rrcomm]
            max_inline_data = 64
            backlog = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.max_inline_data, 64);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.max_send_wr, 1);
    }

    #[test]
    fn test_toml_top_level() {
        let config = ChannelConfig::from_toml_str("peer_check_interval = 8").unwrap();
        assert_eq!(config.peer_check_interval, 8);
        assert_eq!(ChannelConfig::from_toml_str("").unwrap(), ChannelConfig::default());
    }

    #[test]
    fn test_reject_bad() {
        assert!(matches!(
            ChannelConfig::from_toml_str("max_send_wr = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ChannelConfig::from_toml_str("no_such_key = 1"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ChannelConfig::from_toml_str("rrcomm = 3"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ChannelConfig::from_json_str("{\"max_recv_sge\": 0}"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load() -> anyhow::Result<()> {
        let dir = env::temp_dir().join(format!("rrcomm-config-{}", std::process::id()));
        fs::create_dir_all(&dir)?;

        let json = dir.join("channel.json");
        fs::write(&json, r#"{ "max_inline_data": 0, "spin_warn_secs": 1 }"#)?;
        let config = ChannelConfig::load(&json)?;
        assert_eq!(config.max_inline_data, 0);
        assert_eq!(config.spin_warn_secs, 1);

        let toml = dir.join("channel.toml");
        fs::write(&toml, "[rrcomm]\nmax_recv_wr = 4\n")?;
        let config = ChannelConfig::load(&toml)?;
        assert_eq!(config.max_recv_wr, 4);

        assert!(ChannelConfig::load(dir.join("missing.toml")).is_err());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
