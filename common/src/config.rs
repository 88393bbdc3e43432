use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Source recorded for configurations that were assembled from command-line
/// arguments instead of a config file.
pub const CLI_SOURCE: &str = "cli-flags";

/// Default config file searched for in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".proxy.config.toml";

/// Base port used when a bare target URL is given without a listen address.
pub const AUTO_LISTEN_BASE_PORT: u16 = 20003;

/// Top-level system configuration, loaded from a TOML file and overridden by
/// command-line flags and persisted settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SysConfig {
    pub log_level: String,
    pub log_dest: String,
    pub db_path: String,
    pub in_memory: bool,
    pub api_addr: String,
    pub max_sessions_retain: i64,
    pub proxies: Vec<ProxyEntry>,

    /// Path of the file this configuration was loaded from, if any.
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

/// One proxy listener definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyEntry {
    pub listen: String,
    pub target: String,
    #[serde(default)]
    pub truncate_log_body: bool,
}

impl SysConfig {
    /// Load configuration from `path`, or from `./.proxy.config.toml` when no
    /// explicit path is given. A missing default file yields the built-in
    /// defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                return Ok(Self::default());
            }
            Err(e) => return Err(anyhow::anyhow!("cannot read {}: {}", path.display(), e)),
        };

        let mut cfg: SysConfig = toml::from_str(&contents)?;
        cfg.config_file = Some(path);
        Ok(cfg)
    }

    /// The source path recorded on config rows registered under this
    /// configuration.
    pub fn source_path(&self) -> String {
        self.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| CLI_SOURCE.to_string())
    }
}

/// Parse a positional proxy argument. Accepted forms:
/// `listen,target[,truncate]` or a bare target URL, which gets an
/// auto-assigned listen port of `20003 + index`.
pub fn parse_proxy_arg(arg: &str, index: usize) -> anyhow::Result<ProxyEntry> {
    let parts: Vec<&str> = arg.split(',').collect();

    if parts.len() == 1 {
        let candidate = parts[0].trim();
        if candidate.contains("://") {
            return Ok(ProxyEntry {
                listen: format!(":{}", AUTO_LISTEN_BASE_PORT as usize + index),
                target: candidate.to_string(),
                truncate_log_body: true,
            });
        }
        anyhow::bail!(
            "invalid proxy format '{}': a single part must be a target URL",
            arg
        );
    }

    let listen = parts[0].trim().to_string();
    let target = parts[1].trim().to_string();
    let truncate_log_body = match parts.get(2).map(|s| s.trim()) {
        Some(t) => matches!(t, "true" | "1" | "yes"),
        None => true,
    };

    Ok(ProxyEntry {
        listen,
        target,
        truncate_log_body,
    })
}
