//! TaskCell configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::budget::GovernorConfig;
use crate::bus::BusConfig;
use crate::cell::CellConfig;
use crate::protocol::ProtocolConfig;

/// Main TaskCell configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Budget accounting and admission
    pub governor: GovernorConfig,

    /// Message routing and metering
    pub bus: BusConfig,

    /// Per-cell limits
    pub cell: CellConfig,

    /// Delegation rounds, review and conflict thresholds
    pub protocol: ProtocolConfig,

    /// Audit trail output
    pub audit: AuditConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        let sections = [
            self.governor.validate(),
            self.bus.validate(),
            self.cell.validate(),
            self.protocol.validate(),
            self.audit.validate(),
        ];
        let problems: Vec<String> = sections.into_iter().filter_map(|r| r.err()).collect();
        if !problems.is_empty() {
            return Err(eyre::eyre!("Invalid configuration: {}", problems.join("; ")));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .taskcell.yml
        let local_config = PathBuf::from(".taskcell.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/taskcell/taskcell.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskcell").join("taskcell.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuditConfig {
    /// Write episode, conflict and submission records
    pub enabled: bool,

    /// JSONL output file; defaults to ~/.local/share/taskcell/audit.jsonl
    pub path: Option<PathBuf>,
}

impl AuditConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(path) = &self.path
            && path.as_os_str().is_empty()
        {
            return Err("audit.path must not be empty".to_string());
        }
        Ok(())
    }

    /// Where audit records go when enabled
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("taskcell")
                .join("audit.jsonl")
        })
    }
}
