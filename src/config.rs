//! LexSync configuration
//!
//! Persistent client configuration: per-agent webhook URLs and Drive folder
//! mapping, upload limits, history retention, and the OAuth client settings
//! for the identity provider and the storage provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Logical per-agent destination. Each role owns a webhook endpoint and a
/// Drive root container ("bucket" in upload terms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    Contracts,
    Labor,
    ConsumerDefense,
    General,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::Contracts,
        AgentRole::Labor,
        AgentRole::ConsumerDefense,
        AgentRole::General,
    ];

    /// Stable key used for storage, stats and CLI arguments.
    pub fn as_key(&self) -> &'static str {
        match self {
            AgentRole::Contracts => "contracts",
            AgentRole::Labor => "labor",
            AgentRole::ConsumerDefense => "consumer-defense",
            AgentRole::General => "general",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "contracts" => Some(AgentRole::Contracts),
            "labor" => Some(AgentRole::Labor),
            "consumer-defense" => Some(AgentRole::ConsumerDefense),
            "general" => Some(AgentRole::General),
            _ => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Contracts => write!(f, "Contracts"),
            AgentRole::Labor => write!(f, "Labor"),
            AgentRole::ConsumerDefense => write!(f, "Consumer Defense"),
            AgentRole::General => write!(f, "General"),
        }
    }
}

/// Per-agent endpoints and storage destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Workflow webhook that answers chat messages for this agent.
    pub webhook_url: String,
    /// Provider-side root container the agent's uploads land under.
    pub drive_root_folder_id: String,
    /// Subfolder created (once) under the root for incoming documents.
    #[serde(default = "default_subfolder_name")]
    pub subfolder_name: String,
}

fn default_subfolder_name() -> String {
    "unprocessed".to_string()
}

/// Upload pipeline limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Files uploaded concurrently within a group (groups run sequentially).
    pub max_concurrent: usize,
    /// Per-file size limit in bytes. The whole batch is rejected when any
    /// file exceeds it.
    pub max_file_size: u64,
    /// MIME allow-list. `text/*` always passes by prefix match.
    pub allowed_mime_types: Vec<String>,
    /// Extra attempts after a 5xx response.
    pub max_server_retries: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_file_size: 50 * 1024 * 1024,
            allowed_mime_types: vec![
                "application/pdf".to_string(),
                "application/msword".to_string(),
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string(),
                "application/vnd.ms-excel".to_string(),
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
                "text/plain".to_string(),
                "text/csv".to_string(),
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/gif".to_string(),
            ],
            max_server_retries: 2,
        }
    }
}

impl UploadConfig {
    /// MIME allow-list check. `text/*` is accepted by prefix regardless of
    /// list membership.
    pub fn is_mime_allowed(&self, mime_type: &str) -> bool {
        mime_type.starts_with("text/") || self.allowed_mime_types.iter().any(|m| m == mime_type)
    }
}

/// Identity provider (Keycloak) client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeycloakConfig {
    pub url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl Default for KeycloakConfig {
    fn default() -> Self {
        Self {
            url: "https://keycloak.example.com".to_string(),
            realm: "legal-assistant".to_string(),
            client_id: "lexsync-client".to_string(),
            client_secret: None,
        }
    }
}

/// Storage provider (Google Drive) OAuth client settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriveAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub agents: HashMap<AgentRole, AgentConfig>,
    #[serde(default)]
    pub upload: UploadConfig,
    /// Retained upload sessions; the oldest is dropped on overflow.
    #[serde(default = "default_history_max_sessions")]
    pub history_max_sessions: usize,
    #[serde(default)]
    pub keycloak: KeycloakConfig,
    #[serde(default)]
    pub drive: DriveAuthConfig,
}

fn default_history_max_sessions() -> usize {
    20
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut agents = HashMap::new();
        for role in AgentRole::ALL {
            agents.insert(
                role,
                AgentConfig {
                    webhook_url: format!("https://workflows.example.com/webhook/{}", role.as_key()),
                    drive_root_folder_id: String::new(),
                    subfolder_name: default_subfolder_name(),
                },
            );
        }
        Self {
            agents,
            upload: UploadConfig::default(),
            history_max_sessions: default_history_max_sessions(),
            keycloak: KeycloakConfig::default(),
            drive: DriveAuthConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn agent(&self, role: AgentRole) -> Option<&AgentConfig> {
        self.agents.get(&role)
    }

    /// Validate before first use. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        for role in AgentRole::ALL {
            let agent = self
                .agents
                .get(&role)
                .ok_or_else(|| format!("Missing agent config for {}", role.as_key()))?;
            url::Url::parse(&agent.webhook_url)
                .map_err(|e| format!("Invalid webhook URL for {}: {}", role.as_key(), e))?;
            if agent.subfolder_name.trim().is_empty() {
                return Err(format!("Empty subfolder name for {}", role.as_key()));
            }
        }
        if self.upload.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        if self.upload.max_file_size == 0 {
            return Err("max_file_size must be positive".to_string());
        }
        if self.upload.max_server_retries > 10 {
            return Err("max_server_retries must be 10 or less".to_string());
        }
        if self.history_max_sessions == 0 {
            return Err("history_max_sessions must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Path to the config file: `<config_dir>/lexsync/config.json`.
fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("lexsync").join("config.json")
}

/// Load configuration from disk, falling back to defaults on any failure.
pub fn load_config() -> AppConfig {
    load_config_from(&get_config_path())
}

pub fn load_config_from(path: &PathBuf) -> AppConfig {
    if path.exists() {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config: {}", e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config: {}", e);
            }
        }
    }
    AppConfig::default()
}

/// Save configuration to disk.
pub fn save_config(config: &AppConfig) -> Result<(), String> {
    save_config_to(config, &get_config_path())
}

pub fn save_config_to(config: &AppConfig, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.max_concurrent, 3);
        assert_eq!(config.upload.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.history_max_sessions, 20);
    }

    #[test]
    fn test_role_key_roundtrip() {
        for role in AgentRole::ALL {
            assert_eq!(AgentRole::from_key(role.as_key()), Some(role));
        }
        assert_eq!(AgentRole::from_key("nope"), None);
    }

    #[test]
    fn test_role_serde_kebab_case() {
        let json = serde_json::to_string(&AgentRole::ConsumerDefense).unwrap();
        assert_eq!(json, "\"consumer-defense\"");
        let back: AgentRole = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AgentRole::ConsumerDefense);
    }

    #[test]
    fn test_mime_allow_list() {
        let upload = UploadConfig::default();
        assert!(upload.is_mime_allowed("application/pdf"));
        assert!(upload.is_mime_allowed("image/png"));
        // text/* passes by prefix even when not listed
        assert!(upload.is_mime_allowed("text/markdown"));
        assert!(!upload.is_mime_allowed("application/x-msdownload"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.upload.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config
            .agents
            .get_mut(&AgentRole::General)
            .unwrap()
            .webhook_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.max_server_retries = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.upload.max_concurrent = 5;
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path);
        assert_eq!(loaded.upload.max_concurrent, 5);
    }

    #[test]
    fn test_load_missing_file_falls_back_to_default() {
        let path = PathBuf::from("/nonexistent/lexsync/config.json");
        let config = load_config_from(&path);
        assert_eq!(config.history_max_sessions, 20);
    }
}
