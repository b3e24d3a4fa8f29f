use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::lodestone::identity::IdentityConfig;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
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
    // clap maps LODESTONE_CONFIG into the flag value when the flag is unset.
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        let mut p = p;
        if p.extension().is_none() {
            p.set_extension("toml");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
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

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    for c in ["lodestone.toml", "lodestone.yaml", "lodestone.yml"] {
        let p = dir.join(c);
        if p.is_file() {
            return Some(p);
        }
    }
    None
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj =
        ProjectDirs::from("dev", "lodestone", "lodestone").context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("lodestone.toml"))
}

/// Writes a commented config template when the resolved path does not exist
/// yet. Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    fs::write(path, DEFAULT_CONFIG_TEMPLATE_TOML)
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data =
        fs::read_to_string(path).with_context(|| format!("config: read {}", path.display()))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => {
            toml::from_str(&data).with_context(|| format!("config: parse toml {}", path.display()))?
        }
        "yaml" | "yml" => serde_yaml::from_str(&data)
            .with_context(|| format!("config: parse yaml {}", path.display()))?,
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub proxy_addr: String,
    pub api_addr: String,
    pub api_key: String,
    pub manager_address: String,
    pub manager_api_key: String,
    pub routes_file: PathBuf,
    pub max_initial_bytes: usize,
    pub upstream_dial_timeout: Duration,
    pub http_timeout: Duration,
    pub timeouts: Timeouts,
    pub identity: IdentityConfig,
    pub debug_marker: Option<String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    /// How long to wait for the very first bytes of a connection.
    pub initial_grace: Duration,
    /// Idle window that ends initial-read coalescing once bytes have arrived.
    pub coalesce_idle: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    proxy_addr: String,

    #[serde(default)]
    api_addr: String,

    #[serde(default)]
    api_key: String,

    #[serde(default)]
    manager_address: String,

    #[serde(default)]
    manager_api_key: String,

    routes_file: Option<PathBuf>,

    #[serde(default)]
    max_initial_bytes: i64,

    #[serde(default)]
    upstream_dial_timeout_ms: i64,

    #[serde(default)]
    http_timeout_ms: i64,

    timeouts: Option<FileTimeouts>,

    identity: Option<FileIdentity>,

    debug_marker: Option<String>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    initial_grace_ms: Option<i64>,
    coalesce_idle_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileIdentity {
    primary_url: Option<String>,
    fallback_url: Option<String>,
    attempts: Option<u32>,
    retry_delay_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
}

const DEFAULT_PRIMARY_URL: &str = "https://api.mojang.com/users/profiles/minecraft";
const DEFAULT_FALLBACK_URL: &str = "https://playerdb.co/api/player/minecraft";

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let api_key = fc.api_key.trim().to_string();
        if api_key.is_empty() {
            anyhow::bail!("config: api_key is required");
        }

        let proxy_addr = non_empty_or(&fc.proxy_addr, ":25565");
        let api_addr = non_empty_or(&fc.api_addr, ":7000");

        let timeouts = Timeouts {
            initial_grace: millis_or(
                fc.timeouts.as_ref().and_then(|t| t.initial_grace_ms),
                5,
            ),
            coalesce_idle: millis_or(
                fc.timeouts.as_ref().and_then(|t| t.coalesce_idle_ms),
                250,
            ),
        };

        let identity = IdentityConfig {
            primary_url: fc
                .identity
                .as_ref()
                .and_then(|i| i.primary_url.clone())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_PRIMARY_URL.to_string()),
            fallback_url: fc
                .identity
                .as_ref()
                .and_then(|i| i.fallback_url.clone())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_FALLBACK_URL.to_string()),
            attempts: fc
                .identity
                .as_ref()
                .and_then(|i| i.attempts)
                .filter(|a| *a > 0)
                .unwrap_or(3),
            retry_delay: millis_or(fc.identity.as_ref().and_then(|i| i.retry_delay_ms), 1000),
        };

        // Logging knobs are vetted here so logging::init never sees a value
        // it has to guess about.
        let mut logging = LoggingConfig {
            level: "info".into(),
            format: LogFormat::Json,
            output: LogOutput::Stderr,
        };
        if let Some(l) = &fc.logging {
            if let Some(v) = &l.level {
                let v = v.trim().to_ascii_lowercase();
                match v.as_str() {
                    "" => {}
                    "trace" | "debug" | "info" | "warn" | "error" => logging.level = v,
                    other => anyhow::bail!("config: unknown logging.level {other:?}"),
                }
            }
            if let Some(v) = &l.format {
                let v = v.trim().to_ascii_lowercase();
                match v.as_str() {
                    "" => {}
                    "json" => logging.format = LogFormat::Json,
                    "text" => logging.format = LogFormat::Text,
                    other => anyhow::bail!("config: unknown logging.format {other:?}"),
                }
            }
            if let Some(v) = &l.output {
                match v.trim() {
                    "" => {}
                    "stderr" => logging.output = LogOutput::Stderr,
                    "stdout" => logging.output = LogOutput::Stdout,
                    "discard" => logging.output = LogOutput::Discard,
                    path => logging.output = LogOutput::File(PathBuf::from(path)),
                }
            }
        }

        Ok(Config {
            proxy_addr,
            api_addr,
            api_key,
            manager_address: fc.manager_address.trim().to_string(),
            manager_api_key: fc.manager_api_key.trim().to_string(),
            routes_file: fc
                .routes_file
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from("routes.json")),
            max_initial_bytes: if fc.max_initial_bytes > 0 {
                fc.max_initial_bytes as usize
            } else {
                64 * 1024
            },
            upstream_dial_timeout: millis_or(Some(fc.upstream_dial_timeout_ms), 5000),
            http_timeout: millis_or(Some(fc.http_timeout_ms), 5000),
            timeouts,
            identity,
            debug_marker: fc
                .debug_marker
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            logging,
        })
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        default.to_string()
    } else {
        v.to_string()
    }
}

fn millis_or(value: Option<i64>, default: u64) -> Duration {
    match value {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default),
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Lodestone configuration (auto-generated)
#
# This file was created because Lodestone could not find a configuration file
# at the resolved config path. The control-plane api_key below MUST be changed
# before the proxy is reachable from anywhere untrusted.

# Minecraft listener.
proxy_addr = ":25565"

# Control-plane (route CRUD, session kicks). Requests need the x-api-key header.
api_addr = ":7000"
api_key = "change-me"

# Central manager. Leave both empty to disable the per-domain firewall and
# connection reporting.
manager_address = ""
manager_api_key = ""

# Durable routing table, rewritten on every control-plane mutation.
routes_file = "routes.json"

upstream_dial_timeout_ms = 5000
http_timeout_ms = 5000

[timeouts]
initial_grace_ms = 5
coalesce_idle_ms = 250

[identity]
# primary_url = "https://api.mojang.com/users/profiles/minecraft"
# fallback_url = "https://playerdb.co/api/player/minecraft"
attempts = 3
retry_delay_ms = 1000

[logging]
level = "info"
format = "json" # json | text
output = "stderr" # stderr | stdout | discard | <path>
"#;
