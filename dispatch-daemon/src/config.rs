//! Daemon configuration (`spec.md` §6.4): a `serde`+`toml` struct loaded
//! from `<config-dir>/dispatch.toml`, with environment-variable and
//! `-c key=value` CLI overrides layered on top (`dispatch-common`'s
//! `CliConfigOverrides`, carried from the teacher's own config-override
//! helper).

use std::path::Path;
use std::path::PathBuf;

use dispatch_common::CliConfigOverrides;
use serde::Deserialize;
use serde::Serialize;

/// `spec.md` §6.4's recognized options, plus the `dispatch-store` file path
/// and the daemon's own TLS knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub store_path: PathBuf,
    pub workspaces_root: PathBuf,
    #[serde(default = "default_adapter_start_timeout_ms")]
    pub adapter_start_timeout_ms: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default = "default_pre_start_buffer_bytes")]
    pub pre_start_buffer_bytes: usize,
    #[serde(default = "default_subscriber_window_bytes")]
    pub subscriber_window_bytes: usize,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub tls_config: Option<TlsConfig>,
    /// Ambient addition: static bearer tokens accepted by the default
    /// `StaticTokenValidator` (`spec.md` §1: the Session Core "consumes an
    /// AuthValidator capability"; this is the daemon's own default
    /// implementation of that capability, not part of the core contract).
    #[serde(default)]
    pub auth_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

fn default_adapter_start_timeout_ms() -> u64 {
    30_000
}

fn default_close_grace_ms() -> u64 {
    5_000
}

fn default_pre_start_buffer_bytes() -> usize {
    dispatch_recorder::DEFAULT_PRE_START_BUFFER_BYTES
}

fn default_subscriber_window_bytes() -> usize {
    dispatch_hub::DEFAULT_SUBSCRIBER_WINDOW_BYTES
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    7777
}

impl Default for Config {
    fn default() -> Self {
        let home = default_config_dir();
        Config {
            store_path: home.join("dispatch.sqlite"),
            workspaces_root: home.join("workspaces"),
            adapter_start_timeout_ms: default_adapter_start_timeout_ms(),
            close_grace_ms: default_close_grace_ms(),
            pre_start_buffer_bytes: default_pre_start_buffer_bytes(),
            subscriber_window_bytes: default_subscriber_window_bytes(),
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            tls_config: None,
            auth_tokens: Vec::new(),
        }
    }
}

/// `~/.dispatch`, or `$DISPATCH_HOME` if set (teacher's `find_codex_home`
/// idiom, generalized to this project's own env var).
pub fn default_config_dir() -> PathBuf {
    if let Ok(val) = std::env::var("DISPATCH_HOME") {
        if !val.is_empty() {
            return PathBuf::from(val);
        }
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".dispatch")
}

impl Config {
    /// Loads `<config_dir>/dispatch.toml` (if present), then applies
    /// `-c key=value` overrides on top, matching the teacher's own
    /// config-merge order: file first, CLI overrides win.
    pub fn load(config_dir: &Path, overrides: &CliConfigOverrides) -> anyhow::Result<Config> {
        let toml_path = config_dir.join("dispatch.toml");
        let from_file = if toml_path.exists() {
            let raw = std::fs::read_to_string(&toml_path)?;
            toml::from_str::<toml::Value>(&raw)?
        } else {
            toml::Value::Table(toml::map::Map::new())
        };

        let mut merged = serde_json::to_value(Config::default())?;
        merge_json(&mut merged, serde_json::to_value(from_file)?);

        overrides
            .apply_on_value(&mut merged)
            .map_err(|e| anyhow::anyhow!("invalid config override: {e}"))?;

        Ok(serde_json::from_value(merged)?)
    }
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                merge_json(base_map.entry(k).or_insert(serde_json::Value::Null), v);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn load_with_no_toml_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let overrides = CliConfigOverrides::default();
        let cfg = Config::load(dir.path(), &overrides).expect("load");
        assert_eq!(cfg.listen_port, 7777);
    }

    #[test]
    fn toml_file_values_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("dispatch.toml"), "listenPort = 9090\n").expect("write");
        let overrides = CliConfigOverrides::default();
        let cfg = Config::load(dir.path(), &overrides).expect("load");
        assert_eq!(cfg.listen_port, 9090);
    }

    #[test]
    fn cli_override_wins_over_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("dispatch.toml"), "listenPort = 9090\n").expect("write");
        let overrides = CliConfigOverrides {
            raw_overrides: vec!["listenPort=9091".to_string()],
        };
        let cfg = Config::load(dir.path(), &overrides).expect("load");
        assert_eq!(cfg.listen_port, 9091);
    }
}
