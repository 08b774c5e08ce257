//! Daemon configuration loading.
//!
//! Settings come from three layers: the engine defaults, an optional
//! configuration file, and `NETMGR_*` environment variables. The file is
//! optional unless the operator names one explicitly.

use std::path::Path;

use anyhow::{Context, Result};

use netmgr_core::NetmgrConfig;

const DEFAULT_CONFIG_FILE: &str = "/etc/netmgr/netmgr";

/// Load the layered configuration.
pub fn load(path: Option<&Path>) -> Result<NetmgrConfig> {
    let mut builder = config::Config::builder();
    builder = match path {
        Some(path) => builder.add_source(config::File::from(path)),
        None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
    };
    builder = builder.add_source(config::Environment::with_prefix("NETMGR"));

    let settings = builder.build().context("failed to read configuration")?;
    let config: NetmgrConfig = settings
        .try_deserialize()
        .context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = load(None).unwrap();
        assert_eq!(config.advertise_interval, 3);
    }

    #[test]
    fn test_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netmgr.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "advertise_interval = 5").unwrap();
        writeln!(f, "private_link = \"priv0\"").unwrap();
        drop(f);

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.advertise_interval, 5);
        assert_eq!(config.private_link.as_deref(), Some("priv0"));
        // untouched values keep their defaults
        assert_eq!(config.link_bounce_attempts, 2);
    }
}
