/// Bridge configuration
///
/// Loaded from a JSON file, with every field optional, then adjusted from the
/// environment so a configured Android SDK is found without a config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge tool executable
    pub adb_path: PathBuf,
    /// Budget for `adb devices`
    pub listing_timeout_ms: u64,
    /// Budget for other bridge commands and for each MI command
    pub command_timeout_ms: u64,
    /// Budget for the whole client handshake
    pub attach_timeout_ms: u64,
    pub debugger: DebuggerConfig,
    pub server: DebugServerConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from(format!("adb{}", std::env::consts::EXE_SUFFIX)),
            listing_timeout_ms: 1000,
            command_timeout_ms: 10_000,
            attach_timeout_ms: 30_000,
            debugger: DebuggerConfig::default(),
            server: DebugServerConfig::default(),
        }
    }
}

/// The MI debugger client running on the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Sent in order before connecting to the server
    pub init_commands: Vec<String>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gdb"),
            args: vec!["--interpreter=mi2".into(), "--nx".into()],
            working_dir: None,
            init_commands: vec![
                "-gdb-set pagination off".into(),
                "-gdb-set breakpoint pending on".into(),
            ],
        }
    }
}

/// The debug server the client connects to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugServerConfig {
    pub executable: String,
    /// Extra arguments placed before the listen address
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    /// Run the server through `adb shell` and forward its port
    pub on_device: bool,
    pub attach_pid: Option<u32>,
    /// Launched under the server when no pid is given
    pub target_program: Option<String>,
}

impl Default for DebugServerConfig {
    fn default() -> Self {
        Self {
            executable: "gdbserver".into(),
            args: Vec::new(),
            host: "localhost".into(),
            port: 5039,
            on_device: true,
            attach_pid: None,
            target_program: None,
        }
    }
}

impl DebugServerConfig {
    /// Address given to `-target-select remote`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Server arguments: extras, listen address, then what to debug
    pub fn server_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(format!(":{}", self.port));
        if let Some(pid) = self.attach_pid {
            args.push("--attach".into());
            args.push(pid.to_string());
        } else if let Some(program) = &self.target_program {
            args.push(program.clone());
        }
        args
    }
}

impl BridgeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded config from {}", path.display());
        Self::from_json(&text)
    }

    /// Apply `DEVBRIDGE_ADB`, `ANDROID_SDK_ROOT` and `ANDROID_HOME`
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env(|key| std::env::var(key).ok());
        self
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(path) = present("DEVBRIDGE_ADB") {
            self.adb_path = PathBuf::from(path);
        } else if let Some(sdk) = present("ANDROID_SDK_ROOT").or_else(|| present("ANDROID_HOME")) {
            self.adb_path = Path::new(&sdk)
                .join("platform-tools")
                .join(format!("adb{}", std::env::consts::EXE_SUFFIX));
        } else {
            return;
        }
        log::debug!("Bridge tool: {}", self.adb_path.display());
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_millis(self.listing_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = BridgeConfig::from_json(
            r#"{"listing_timeout_ms": 2500, "server": {"port": 6000, "attach_pid": 42}}"#,
        )
        .unwrap();
        assert_eq!(config.listing_timeout(), Duration::from_millis(2500));
        assert_eq!(config.command_timeout_ms, 10_000);
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.executable, "gdbserver");
        assert_eq!(config.server.endpoint(), "localhost:6000");
        assert_eq!(config.server.server_args(), [":6000", "--attach", "42"]);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            BridgeConfig::from_json("{\"port\": "),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            BridgeConfig::load(Path::new("/nonexistent/devbridge.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("ANDROID_HOME", "/opt/sdk")].into();
        let mut config = BridgeConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert!(config.adb_path.starts_with("/opt/sdk/platform-tools"));

        let env: HashMap<&str, &str> =
            [("ANDROID_HOME", "/opt/sdk"), ("DEVBRIDGE_ADB", "/usr/local/bin/adb")].into();
        let mut config = BridgeConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.adb_path, PathBuf::from("/usr/local/bin/adb"));

        let mut config = BridgeConfig::default();
        config.apply_env(|_| None);
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_target_program_without_pid() {
        let server = DebugServerConfig {
            target_program: Some("/data/local/tmp/app".into()),
            ..DebugServerConfig::default()
        };
        assert_eq!(server.server_args(), [":5039", "/data/local/tmp/app"]);
    }
}
