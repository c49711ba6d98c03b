use crate::error::{LauncherError, Result};
use crate::process::capture::{CaptureLimits, DEFAULT_CAPACITY, DEFAULT_MAX_LINE_BYTES};
use crate::process::ProcessSlot;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "TOOLBOX_LAUNCHER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lines buffered per process before the capture side blocks
    pub channel_capacity: usize,
    /// Longer output lines are split into pieces of at most this many bytes
    pub max_line_bytes: usize,
    /// How long a shutdown waits for each process to exit
    pub stop_timeout_ms: u64,
    pub stop_signal: StopSignal,
    pub skin: SlotCommand,
    pub helper: SlotCommand,
}

/// Signal delivered to a child's process group on stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopSignal {
    /// SIGKILL
    #[default]
    Kill,
    /// SIGTERM on unix, a plain kill elsewhere.
    ///
    /// A stop frees the slot as soon as the signal is delivered. A child that
    /// ignores SIGTERM keeps running unbound, and a new start may then run
    /// beside it; `stop_and_wait` reports that case as a timeout.
    Terminate,
}

/// Program and arguments launched for a slot
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SlotCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl SlotCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
        }
    }

    /// Space-joined command line, for logs and stats
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CAPACITY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            stop_timeout_ms: 5000,
            stop_signal: StopSignal::Kill,
            skin: SlotCommand::new("python", &["majsoul_max.py"]),
            helper: SlotCommand::new("./third_party/mahjong-helper", &[]),
        }
    }
}

impl Config {
    /// Load the first readable config from the search path, or defaults
    pub fn load() -> Self {
        let paths = [
            std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            dirs::config_dir().map(|p| p.join("toolbox-launcher/config.toml")),
            dirs::home_dir().map(|p| p.join(".toolbox-launcher.toml")),
            Some(PathBuf::from("toolbox-launcher.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Ignoring config: {e}"),
                }
            }
        }

        Config::default()
    }

    /// Load a config file, reporting read and parse failures
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LauncherError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|e| LauncherError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.channel_capacity = config.channel_capacity.max(1);
        config.max_line_bytes = config.max_line_bytes.max(1);
        Ok(config)
    }

    pub fn command_for(&self, slot: ProcessSlot) -> &SlotCommand {
        match slot {
            ProcessSlot::Skin => &self.skin,
            ProcessSlot::Helper => &self.helper,
        }
    }

    pub fn capture_limits(&self) -> CaptureLimits {
        CaptureLimits {
            channel_capacity: self.channel_capacity,
            max_line_bytes: self.max_line_bytes,
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
