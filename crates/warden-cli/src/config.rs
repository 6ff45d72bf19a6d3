//! Configuration file management for warden.
//!
//! Provides a TOML-based config file at `~/.config/warden/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use warden_core::project::XcodeProject;
use warden_db::config::DbConfig;

/// Harness timeout used when nothing else is configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub harness: HarnessSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Directory containing the Xcode workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Where transcripts go. Defaults to `<root_path>/logs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSection {
    pub binary: String,
    pub workspace: String,
    pub scheme: String,
    /// Lines containing any of these markers go to the filtered transcript.
    pub filter_markers: Vec<String>,
}

impl Default for HarnessSection {
    fn default() -> Self {
        let project = XcodeProject::default();
        Self {
            binary: project.binary,
            workspace: project.workspace,
            scheme: project.scheme,
            filter_markers: vec!["[STATUS]".to_string(), "[ERROR]".to_string()],
        }
    }
}

impl HarnessSection {
    pub fn project(&self) -> XcodeProject {
        XcodeProject {
            binary: self.binary.clone(),
            workspace: self.workspace.clone(),
            scheme: self.scheme.clone(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the warden config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/warden` or `~/.config/warden`,
/// on macOS too.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("warden");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("warden")
}

/// Return the path to the warden config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_config(&contents)
}

fn parse_config(contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix since it holds the database URL.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Overrides taken from the command line.
#[derive(Debug, Default)]
pub struct CliOverrides<'a> {
    pub db_url: Option<&'a str>,
    pub root_path: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct WardenConfig {
    pub db_config: DbConfig,
    pub root_path: PathBuf,
    pub harness_timeout: Duration,
    pub log_dir: PathBuf,
    pub harness: HarnessSection,
}

impl WardenConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `--database-url` > `WARDEN_DATABASE_URL` > `database.url` > `DbConfig::DEFAULT_URL`
    /// - Root: `--root` > `WARDEN_ROOT_PATH` > `supervisor.root_path` > current directory
    /// - Timeout: `--timeout` > `WARDEN_TIMEOUT_SECS` > `supervisor.timeout_secs` > 60
    pub fn resolve(cli: CliOverrides<'_>) -> Result<Self> {
        Self::resolve_with(cli, load_config().ok())
    }

    fn resolve_with(cli: CliOverrides<'_>, file_config: Option<ConfigFile>) -> Result<Self> {
        let db_url = if let Some(url) = cli.db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("WARDEN_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let file_supervisor = file_config.as_ref().map(|c| &c.supervisor);

        let root_path = if let Some(root) = cli.root_path {
            root
        } else if let Ok(root) = std::env::var("WARDEN_ROOT_PATH") {
            PathBuf::from(root)
        } else if let Some(root) = file_supervisor.and_then(|s| s.root_path.clone()) {
            root
        } else {
            std::env::current_dir().context("failed to determine current directory")?
        };

        let timeout_secs = if let Some(secs) = cli.timeout_secs {
            secs
        } else if let Ok(raw) = std::env::var("WARDEN_TIMEOUT_SECS") {
            raw.trim()
                .parse()
                .with_context(|| format!("WARDEN_TIMEOUT_SECS is not a number: {raw:?}"))?
        } else if let Some(secs) = file_supervisor.and_then(|s| s.timeout_secs) {
            secs
        } else {
            DEFAULT_TIMEOUT_SECS
        };

        let log_dir = file_supervisor
            .and_then(|s| s.log_dir.clone())
            .unwrap_or_else(|| root_path.join("logs"));

        let harness = file_config.map(|c| c.harness).unwrap_or_default();

        Ok(Self {
            db_config: DbConfig::new(db_url),
            root_path,
            harness_timeout: Duration::from_secs(timeout_secs),
            log_dir,
            harness,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
