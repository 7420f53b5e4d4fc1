//! Layered CLI configuration: built-in defaults, then an optional TOML file,
//! then command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use synkv_backend::{FileBackendConfig, Namespace};
use synkv_store::StoreConfig;

use crate::cli::Cli;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub root: PathBuf,
    pub namespace: String,
    /// How often `watch` rescans the namespace directory.
    pub poll_interval_ms: u64,
    pub echo_window: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".synkv"),
            namespace: "settings".into(),
            poll_interval_ms: 250,
            echo_window: StoreConfig::default().echo_window,
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Defaults, overlaid by `--config`, overlaid by explicit flags.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(root) = &cli.root {
            config.root = root.clone();
        }
        if let Some(namespace) = &cli.namespace {
            config.namespace = namespace.clone();
        }
        Ok(config)
    }

    pub fn namespace(&self) -> anyhow::Result<Namespace> {
        Namespace::new(self.namespace.as_str()).context("invalid namespace")
    }

    /// Backend settings; `watch` enables the polling change feed.
    pub fn backend_config(&self, watch: bool) -> FileBackendConfig {
        FileBackendConfig {
            root: self.root.clone(),
            poll_interval: watch.then(|| Duration::from_millis(self.poll_interval_ms.max(1))),
            ..Default::default()
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            echo_window: self.echo_window,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn default_config() {
        let c = CliConfig::default();
        assert_eq!(c.root, PathBuf::from(".synkv"));
        assert_eq!(c.namespace, "settings");
        assert_eq!(c.poll_interval_ms, 250);
        assert_eq!(c.echo_window, 16);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: CliConfig = toml::from_str("namespace = \"prefs\"\npoll_interval_ms = 50\n").unwrap();
        assert_eq!(c.namespace, "prefs");
        assert_eq!(c.poll_interval_ms, 50);
        assert_eq!(c.root, PathBuf::from(".synkv"));
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synkv.toml");
        std::fs::write(&path, "root = \"/srv/kv\"\nnamespace = \"prefs\"\n").unwrap();

        let cli = Cli::parse_from([
            "synkv",
            "--config",
            path.to_str().unwrap(),
            "--namespace",
            "ui",
            "list",
        ]);
        let c = CliConfig::resolve(&cli).unwrap();
        assert_eq!(c.root, PathBuf::from("/srv/kv"));
        assert_eq!(c.namespace, "ui");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn polling_only_when_watching() {
        let c = CliConfig::default();
        assert_eq!(c.backend_config(false).poll_interval, None);
        assert_eq!(
            c.backend_config(true).poll_interval,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn invalid_namespace_is_rejected() {
        let c = CliConfig {
            namespace: "a:b".into(),
            ..Default::default()
        };
        assert!(c.namespace().is_err());
    }
}
