use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [sandbox]
//                    kill_timeout_ms = 5000
//
//   env var:         DEVROOM_SANDBOX__KILL_TIMEOUT_MS=5000   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub sandbox: SandboxFileConfig,
    #[serde(default)]
    pub store: StoreFileConfig,
}

/// `[server]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// `[relay]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    /// Events buffered per subscriber before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// `[sandbox]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxFileConfig {
    /// Run before every start; empty skips the install step
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
    #[serde(default = "default_start_command")]
    pub start_command: Vec<String>,
    /// Where workspace files are mounted. Defaults to `<data dir>/sandboxes`.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SandboxFileConfig {
    fn default() -> Self {
        Self {
            install_command: default_install_command(),
            start_command: default_start_command(),
            root_dir: None,
            kill_timeout_ms: default_kill_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// `[store]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreFileConfig {
    /// Keep everything in memory; nothing survives a restart
    #[serde(default)]
    pub ephemeral: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7420
}
fn default_queue_capacity() -> usize {
    256
}
fn default_install_command() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}
fn default_start_command() -> Vec<String> {
    vec!["npm".to_string(), "start".to_string()]
}
fn default_kill_timeout_ms() -> u64 {
    5000
}
fn default_event_capacity() -> usize {
    1024
}

/// Build a figment that layers: defaults → config.toml → DEVROOM_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `DEVROOM_SERVER__PORT=8080`  →  `server.port = 8080`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("DEVROOM_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub install_command: Vec<String>,
    pub start_command: Vec<String>,
    pub root_dir: PathBuf,
    pub kill_timeout: Duration,
    pub event_capacity: usize,
}

impl SandboxConfig {
    pub fn from_file(fc: &SandboxFileConfig, data_dir: &Path) -> Self {
        Self {
            install_command: fc.install_command.clone(),
            start_command: fc.start_command.clone(),
            root_dir: fc
                .root_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("sandboxes")),
            kill_timeout: Duration::from_millis(fc.kill_timeout_ms),
            event_capacity: fc.event_capacity,
        }
    }

    /// Mount directory of one workspace. Anything but `[A-Za-z0-9_-]` is
    /// replaced so an id can never leave `root_dir`.
    pub fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        let safe: String = workspace_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root_dir.join(safe)
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DevroomConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl DevroomConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".devroom"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("devroom.db");
        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
