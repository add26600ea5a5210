//! Configuration management for Agent Client
//!
//! Handles loading, saving, and resolving agent launch settings: the
//! built-in agents, user-defined custom agents, and client behaviour flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Agent used when nothing else is configured
pub const DEFAULT_AGENT_ID: &str = "claude-code-acp";

/// One `KEY=VALUE` pair passed to an agent process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Agent used for new chats
    pub default_agent_id: String,
    pub claude: BuiltinAgentSettings,
    pub codex: BuiltinAgentSettings,
    pub gemini: BuiltinAgentSettings,
    pub custom_agents: Vec<CustomAgentSettings>,
    /// Approve permission requests without asking
    pub auto_allow_permissions: bool,
    /// Absolute path to the node executable; its directory is put on PATH
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_path: Option<PathBuf>,
    pub debug_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub floating_window: Option<WindowGeometry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_agent_id: DEFAULT_AGENT_ID.to_string(),
            claude: BuiltinAgentSettings::claude(),
            codex: BuiltinAgentSettings::codex(),
            gemini: BuiltinAgentSettings::gemini(),
            custom_agents: Vec::new(),
            auto_allow_permissions: false,
            node_path: None,
            debug_mode: false,
            floating_window: None,
        }
    }
}

/// Settings for one of the agents shipped with the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinAgentSettings {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Stored in plain text; injected as the provider's key variable
    #[serde(default)]
    pub api_key: String,
}

impl BuiltinAgentSettings {
    pub fn claude() -> Self {
        Self {
            id: "claude-code-acp".to_string(),
            display_name: "Claude Code".to_string(),
            command: "claude-code-acp".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            api_key: String::new(),
        }
    }

    pub fn codex() -> Self {
        Self {
            id: "codex-acp".to_string(),
            display_name: "Codex".to_string(),
            command: "codex-acp".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            api_key: String::new(),
        }
    }

    pub fn gemini() -> Self {
        Self {
            id: "gemini-cli".to_string(),
            display_name: "Gemini CLI".to_string(),
            command: "gemini".to_string(),
            args: vec!["--experimental-acp".to_string()],
            env: Vec::new(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomAgentSettings {
    pub id: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
}

/// Last known floating window position and size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Fully resolved launch configuration for one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub id: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Settings {
    /// Resolve the launch configuration of an agent by id
    pub fn agent(&self, id: &str) -> Option<AgentConfig> {
        self.agents().into_iter().find(|agent| agent.id == id)
    }

    /// All agents that can be launched, built-ins first
    pub fn agents(&self) -> Vec<AgentConfig> {
        let builtins = [
            (&self.claude, "ANTHROPIC_API_KEY"),
            (&self.codex, "OPENAI_API_KEY"),
            (&self.gemini, "GEMINI_API_KEY"),
        ]
        .into_iter()
        .map(|(builtin, key_var)| {
            let mut env = builtin.env.clone();
            let key = builtin.api_key.trim();
            if !key.is_empty() && !env.iter().any(|e| e.key.trim() == key_var) {
                env.push(EnvVar::new(key_var, key));
            }
            (
                &builtin.id,
                &builtin.display_name,
                &builtin.command,
                &builtin.args,
                env,
            )
        });

        let custom = self.custom_agents.iter().map(|agent| {
            (
                &agent.id,
                &agent.display_name,
                &agent.command,
                &agent.args,
                agent.env.clone(),
            )
        });

        builtins
            .chain(custom)
            .filter(|(id, _, command, _, _)| !id.trim().is_empty() && !command.trim().is_empty())
            .map(|(id, display_name, command, args, env)| {
                let mut env = normalize_env(env);
                self.apply_node_path(&mut env);
                AgentConfig {
                    id: id.trim().to_string(),
                    display_name: if display_name.trim().is_empty() {
                        id.trim().to_string()
                    } else {
                        display_name.clone()
                    },
                    command: command.trim().to_string(),
                    args: args.clone(),
                    env,
                }
            })
            .collect()
    }

    /// Point `default_agent_id` at a launchable agent if it no longer is one
    pub fn ensure_default_agent_id(&mut self) {
        let agents = self.agents();
        if agents.iter().any(|agent| agent.id == self.default_agent_id) {
            return;
        }
        self.default_agent_id = agents
            .first()
            .map(|agent| agent.id.clone())
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());
    }

    fn apply_node_path(&self, env: &mut Vec<(String, String)>) {
        let Some(dir) = self
            .node_path
            .as_deref()
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty())
        else {
            return;
        };
        if env.iter().any(|(key, _)| key == "PATH") {
            return;
        }

        let mut paths = vec![dir.to_path_buf()];
        if let Some(current) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&current));
        }
        if let Ok(joined) = std::env::join_paths(paths) {
            env.push(("PATH".to_string(), joined.to_string_lossy().into_owned()));
        }
    }
}

/// Trim keys, drop empty ones, and keep the last value of duplicates
pub fn normalize_env(env: Vec<EnvVar>) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();
    for var in env {
        let key = var.key.trim();
        if key.is_empty() {
            continue;
        }
        match result.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = var.value,
            None => result.push((key.to_string(), var.value)),
        }
    }
    result
}

/// Parse agent arguments entered one per line
pub fn parse_args(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `KEY=VALUE` lines; lines without `=` or a key are skipped
pub fn parse_env(text: &str) -> Vec<EnvVar> {
    let vars = text
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| EnvVar::new(key, value.trim()))
        })
        .collect();

    normalize_env(vars)
        .into_iter()
        .map(|(key, value)| EnvVar { key, value })
        .collect()
}

/// Settings manager for loading/saving the settings file
pub struct ConfigManager {
    config_path: PathBuf,
    config: Settings,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let mut config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Settings::default()
        };
        config.ensure_default_agent_id();

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("agent-client").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Settings> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current settings
    pub fn config(&self) -> &Settings {
        &self.config
    }

    /// Get mutable access to settings
    pub fn config_mut(&mut self) -> &mut Settings {
        &mut self.config
    }

    /// Save the current settings to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}
