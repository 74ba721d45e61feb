//! Agent configuration stored as TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize};

/// Agent configuration (TOML).
///
/// Every field is optional on disk; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Comma-separated device property names the service uses for compatibility.
    pub compat_property_names: String,

    /// Parent directory of per-workflow work folders.
    pub work_folder_root: PathBuf,

    /// Where the reboot/restart snapshot is written.
    pub snapshot_path: PathBuf,

    /// Send `DownloadSucceeded`, `InstallStarted`, `InstallSucceeded`, `ApplyStarted`.
    pub report_intermediate_states: bool,

    pub component_name: String,
    pub agent_property: String,
    pub service_property: String,

    #[serde(deserialize_with = "reboot_table")]
    pub reboot: CommandConfig,
    #[serde(deserialize_with = "restart_table")]
    pub restart: CommandConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandConfig {
    /// Program and arguments (e.g. `["systemctl","reboot"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl CommandConfig {
    /// `systemctl reboot`, 60 s.
    pub fn reboot() -> Self {
        Self {
            command: vec!["systemctl".to_string(), "reboot".to_string()],
            timeout_secs: 60,
        }
    }

    /// `systemctl restart du-agent`, 60 s.
    pub fn restart() -> Self {
        Self {
            command: vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "du-agent".to_string(),
            ],
            timeout_secs: 60,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("{name}.command must be a non-empty array"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("{name}.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            compat_property_names: "manufacturer,model".to_string(),
            work_folder_root: PathBuf::from("/var/lib/du-agent/downloads"),
            snapshot_path: PathBuf::from("/var/lib/du-agent/snapshot.json"),
            report_intermediate_states: true,
            component_name: "deviceUpdate".to_string(),
            agent_property: "agent".to_string(),
            service_property: "service".to_string(),
            reboot: CommandConfig::reboot(),
            restart: CommandConfig::restart(),
        }
    }
}

/// On-disk command table; keys left out keep the built-in value.
#[derive(Deserialize)]
struct CommandTable {
    command: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

impl CommandTable {
    fn or(self, fallback: CommandConfig) -> CommandConfig {
        CommandConfig {
            command: self.command.unwrap_or(fallback.command),
            timeout_secs: self.timeout_secs.unwrap_or(fallback.timeout_secs),
        }
    }
}

fn reboot_table<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CommandConfig, D::Error> {
    Ok(CommandTable::deserialize(deserializer)?.or(CommandConfig::reboot()))
}

fn restart_table<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CommandConfig, D::Error> {
    Ok(CommandTable::deserialize(deserializer)?.or(CommandConfig::restart()))
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("compat_property_names", &self.compat_property_names),
            ("component_name", &self.component_name),
            ("agent_property", &self.agent_property),
            ("service_property", &self.service_property),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        if self.work_folder_root.as_os_str().is_empty() {
            return Err(anyhow!("work_folder_root must not be empty"));
        }
        if self.snapshot_path.file_name().is_none() {
            return Err(anyhow!("snapshot_path must name a file"));
        }
        self.reboot.validate("reboot")?;
        self.restart.validate("restart")?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
        assert_eq!(cfg.compat_property_names, "manufacturer,model");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("du-agent.toml");
        fs::write(
            &path,
            "report_intermediate_states = false\n\n[reboot]\ncommand = [\"true\"]\ntimeout_secs = 5\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert!(!cfg.report_intermediate_states);
        assert_eq!(cfg.reboot.command, vec!["true".to_string()]);
        assert_eq!(cfg.restart, AgentConfig::default().restart);
        assert_eq!(cfg.component_name, "deviceUpdate");
    }

    #[test]
    fn command_tables_fill_missing_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("du-agent.toml");
        fs::write(
            &path,
            "[reboot]\ncommand = [\"/sbin/reboot\"]\n\n[restart]\ntimeout_secs = 5\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.reboot.command, vec!["/sbin/reboot".to_string()]);
        assert_eq!(cfg.reboot.timeout_secs, 60);
        assert_eq!(cfg.restart.command, CommandConfig::restart().command);
        assert_eq!(cfg.restart.timeout_secs, 5);
    }

    #[test]
    fn rejects_empty_property_name() {
        let cfg = AgentConfig {
            service_property: " ".to_string(),
            ..AgentConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("service_property"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut cfg = AgentConfig::default();
        cfg.restart.timeout_secs = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("restart.timeout_secs"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("du-agent.toml");
        let cfg = AgentConfig {
            compat_property_names: "manufacturer,model,location".to_string(),
            ..AgentConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }
}
