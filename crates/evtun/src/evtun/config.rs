use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::evtun::{
    net,
    tunnel::{
        client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_INTERVAL},
        reader::DEFAULT_BUFFER_CAP,
    },
};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    /// `--config` or `EVTUN_CONFIG`.
    Flag,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        let p = if p.is_dir() {
            discover_config_path(&p).unwrap_or_else(|_| p.join("evtun.toml"))
        } else {
            p
        };
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["evtun.toml", "evtun.yaml", "evtun.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no evtun.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/evtun/evtun.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("io", "evtun", "evtun")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("evtun.toml"))
    }
}

/// Loads the resolved config. Only the OS default location may be absent, in which case
/// built-in defaults apply.
pub fn load_resolved(resolved: &ResolvedConfigPath) -> anyhow::Result<(Config, bool)> {
    if resolved.source == ConfigPathSource::Default && !resolved.path.is_file() {
        return Ok((Config::default(), false));
    }
    let cfg = load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    Ok((cfg, true))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" | "yaml" | "yml" if s.trim().is_empty() => FileConfig::default(),
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc, path)
}

/// Reads the JSON metadata announced to the server on every connect.
pub fn load_metadata(path: &Path) -> anyhow::Result<serde_json::Value> {
    let data = fs::read(path).with_context(|| format!("metadata: read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("metadata: parse {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    /// Inline `[metadata]` table, used when no metadata file is given.
    pub metadata: serde_json::Value,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub bind_host: IpAddr,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub buffer_cap: usize,
    pub metadata_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientConfig {
                server_addr: net::normalize_server_addr(""),
                bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                buffer_cap: DEFAULT_BUFFER_CAP,
                metadata_file: None,
            },
            metadata: serde_json::Value::Object(Default::default()),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    client: Option<FileClient>,
    metadata: Option<serde_json::Value>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: Option<String>,
    bind_host: Option<String>,
    reconnect_interval_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    buffer_cap_bytes: Option<i64>,
    metadata_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let mut cfg = Config::default();
        let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

        if let Some(c) = fc.client {
            if let Some(addr) = c.server_addr {
                cfg.client.server_addr = net::normalize_server_addr(&addr);
            }
            if let Some(h) = c.bind_host {
                let h = h.trim();
                cfg.client.bind_host = h
                    .parse()
                    .with_context(|| format!("config: invalid client.bind_host {h:?}"))?;
            }
            if let Some(ms) = c.reconnect_interval_ms {
                if ms > 0 {
                    cfg.client.reconnect_interval = Duration::from_millis(ms as u64);
                }
            }
            if let Some(ms) = c.connect_timeout_ms {
                cfg.client.connect_timeout = Duration::from_millis(ms.max(0) as u64);
            }
            if let Some(n) = c.buffer_cap_bytes {
                if n <= 0 {
                    anyhow::bail!("config: client.buffer_cap_bytes must be positive");
                }
                cfg.client.buffer_cap = n as usize;
            }
            cfg.client.metadata_file = c
                .metadata_file
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| if p.is_relative() { config_dir.join(p) } else { p });
        }

        if let Some(md) = fc.metadata {
            cfg.metadata = md;
        }

        if let Some(l) = fc.logging {
            let norm = |s: Option<String>, dflt: &str| {
                s.map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| dflt.to_string())
            };
            cfg.logging = LoggingConfig {
                level: norm(l.level, "info").to_ascii_lowercase(),
                format: norm(l.format, "text").to_ascii_lowercase(),
                output: norm(l.output, "stderr"),
                add_source: l.add_source,
            };
            match cfg.logging.format.as_str() {
                "text" | "json" => {}
                other => anyhow::bail!("config: logging.format {other:?} (expected text|json)"),
            }
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "evtun_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = temp_dir("toml");
        let cfg_path = dir.join("evtun.toml");

        let toml = r#"
[client]
server_addr = "tunnel.example"
bind_host = "::1"
reconnect_interval_ms = 250
connect_timeout_ms = 0
metadata_file = "meta.json"

[metadata]
site = "lab"

[logging]
level = "DEBUG"
format = "json"
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.client.server_addr, "tunnel.example:9000");
        assert_eq!(cfg.client.bind_host, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.client.reconnect_interval, Duration::from_millis(250));
        assert_eq!(cfg.client.connect_timeout, Duration::ZERO);
        assert_eq!(cfg.client.buffer_cap, DEFAULT_BUFFER_CAP);
        assert_eq!(cfg.client.metadata_file, Some(dir.join("meta.json")));
        assert_eq!(cfg.metadata, serde_json::json!({"site": "lab"}));
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.logging.output, "stderr");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_and_empty_file() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("evtun.yaml");

        std::fs::write(&cfg_path, "client:\n  server_addr: \":9100\"\n").expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.client.server_addr, "127.0.0.1:9100");
        assert_eq!(cfg.client.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);

        for name in ["empty.toml", "empty.yml"] {
            let p = dir.join(name);
            std::fs::write(&p, "\n").expect("write");
            let cfg = load_config(&p).expect("load_config");
            assert_eq!(cfg.client.server_addr, "127.0.0.1:9000");
            assert_eq!(cfg.metadata, serde_json::json!({}));
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        let dir = temp_dir("reject");
        let cfg_path = dir.join("evtun.toml");

        std::fs::write(&cfg_path, "[client]\nserver = \"x\"\n").expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(msg.contains("server"), "got: {msg}");

        std::fs::write(&cfg_path, "[client]\nbind_host = \"localhost\"\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        std::fs::write(&cfg_path, "[logging]\nformat = \"xml\"\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        std::fs::write(dir.join("evtun.ini"), "").expect("write");
        assert!(load_config(&dir.join("evtun.ini")).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn flag_dir_discovers_file_and_missing_default_is_ok() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("evtun.yml"), "").expect("write");
        let r = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(r.path, dir.join("evtun.yml"));
        assert_eq!(r.source, ConfigPathSource::Flag);

        let missing = ResolvedConfigPath {
            path: dir.join("nope.toml"),
            source: ConfigPathSource::Default,
        };
        let (cfg, found) = load_resolved(&missing).unwrap();
        assert!(!found);
        assert_eq!(cfg.client.server_addr, "127.0.0.1:9000");

        let explicit = ResolvedConfigPath {
            path: dir.join("nope.toml"),
            source: ConfigPathSource::Flag,
        };
        assert!(load_resolved(&explicit).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn metadata_file_is_json() {
        let dir = temp_dir("metadata");
        let p = dir.join("meta.json");
        std::fs::write(&p, r#"{"host":"edge-1","tags":["a","b"]}"#).expect("write");
        let md = load_metadata(&p).unwrap();
        assert_eq!(md["host"], "edge-1");

        std::fs::write(&p, "{oops").expect("write");
        assert!(load_metadata(&p).is_err());
        assert!(load_metadata(&dir.join("missing.json")).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
