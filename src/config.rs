use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::{BridgeConfig, CredentialPolicy};
use crate::frame;
use crate::handshake;
use crate::process::{CommandLauncher, Launcher, SshLauncher};

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_TERMINAL_PATH: &str = "/terminal";

/// Top-level config, loaded from TOML. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub bridge: BridgeSection,
    pub process: ProcessSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: SocketAddr,
    /// Path that accepts terminal upgrades.
    pub terminal_path: String,
    /// Largest accepted request head, in bytes.
    pub max_head_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            terminal_path: DEFAULT_TERMINAL_PATH.to_string(),
            max_head_bytes: handshake::DEFAULT_MAX_HEAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeSection {
    pub max_frame_bytes: usize,
    pub input_queue: usize,
    pub credential_policy: CredentialPolicy,
    pub exit_drain_ms: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        let defaults = BridgeConfig::default();
        Self {
            max_frame_bytes: frame::DEFAULT_MAX_PAYLOAD,
            input_queue: defaults.input_queue,
            credential_policy: defaults.credential_policy,
            exit_drain_ms: defaults.exit_drain.as_millis() as u64,
        }
    }
}

impl BridgeSection {
    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            max_frame_bytes: self.max_frame_bytes,
            input_queue: self.input_queue.max(1),
            credential_policy: self.credential_policy,
            exit_drain: Duration::from_millis(self.exit_drain_ms),
            ..BridgeConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    #[default]
    Ssh,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessSection {
    pub launcher: LauncherKind,
    /// Program to run. Defaults to `ssh` for the ssh launcher; required for
    /// the command launcher.
    pub program: Option<String>,
    /// For ssh, placed before the connection arguments.
    pub args: Vec<String>,
    /// Working directory for the command launcher.
    pub cwd: Option<PathBuf>,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            launcher: LauncherKind::Ssh,
            program: None,
            args: SshLauncher::default().extra_args,
            cwd: None,
        }
    }
}

impl ProcessSection {
    pub fn build_launcher(&self) -> Result<Arc<dyn Launcher>, ConfigError> {
        match self.launcher {
            LauncherKind::Ssh => {
                let mut launcher = SshLauncher {
                    extra_args: self.args.clone(),
                    ..SshLauncher::default()
                };
                if let Some(program) = &self.program {
                    launcher.program = program.clone();
                }
                Ok(Arc::new(launcher))
            }
            LauncherKind::Command => {
                let program = self
                    .program
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or(ConfigError::MissingProgram)?;
                let mut launcher = CommandLauncher::new(program).args(self.args.iter().cloned());
                if let Some(dir) = &self.cwd {
                    launcher = launcher.current_dir(dir);
                }
                Ok(Arc::new(launcher))
            }
        }
    }
}

/// Values given on the command line. `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<SocketAddr>,
    pub terminal_path: Option<String>,
    pub ssh_program: Option<String>,
    /// Run this through `sh -c` instead of ssh.
    pub command: Option<String>,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path` if given, falling back to defaults when absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => match Self::load(path)? {
                Some(config) => Ok(config),
                None => {
                    tracing::warn!(path = %path.display(), "config file not found, using defaults");
                    Ok(Self::default())
                }
            },
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(bind) = overrides.bind {
            self.server.bind = bind;
        }
        if let Some(path) = overrides.terminal_path {
            self.server.terminal_path = path;
        }
        if let Some(script) = overrides.command {
            self.process = ProcessSection {
                launcher: LauncherKind::Command,
                program: Some("/bin/sh".to_string()),
                args: vec!["-c".to_string(), script],
                cwd: self.process.cwd.take(),
            };
        } else if let Some(program) = overrides.ssh_program {
            self.process.launcher = LauncherKind::Ssh;
            self.process.program = Some(program);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.terminal_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.terminal_path must start with '/', got {:?}",
                self.server.terminal_path
            )));
        }
        if self.server.max_head_bytes == 0 {
            return Err(ConfigError::Invalid("server.max_head_bytes must be positive".into()));
        }
        if self.bridge.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("bridge.max_frame_bytes must be positive".into()));
        }
        if let Some(dir) = &self.process.cwd {
            if self.process.launcher == LauncherKind::Ssh {
                return Err(ConfigError::Invalid("process.cwd only applies to the command launcher".into()));
            }
            if !dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "process.cwd must be an absolute path, got {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
    MissingProgram,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
            Self::MissingProgram => write!(f, "process.program is required for the command launcher"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFailed(_, e) => Some(e),
            Self::ParseFailed(_, e) => Some(e),
            _ => None,
        }
    }
}
