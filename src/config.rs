use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Evaluation mode requested for a service operation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[strum(ascii_case_insensitive)]
pub enum ActionType {
    /// One-shot evaluation in a fresh stateless session.
    #[serde(rename = "EXECUTE")]
    #[strum(to_string = "EXECUTE")]
    Execute,
    /// Insert into the shared stateful session and run a full pass.
    #[default]
    #[serde(rename = "FIRE_ALL", alias = "FIRE_ALL_RULES")]
    #[strum(to_string = "FIRE_ALL", serialize = "FIRE_ALL_RULES")]
    FireAll,
    /// Insert into the shared stateful session evaluated continuously by a worker.
    #[serde(rename = "FIRE_UNTIL_HALT")]
    #[strum(to_string = "FIRE_UNTIL_HALT")]
    FireUntilHalt,
}

/// Component configuration handed over by the route loader.
///
/// Loaded once at handler initialization and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesComponentConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default)]
    pub target_namespace: String,

    #[serde(default = "default_message_content_name")]
    pub message_content_name: String,

    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub audit: Option<AuditConfig>,

    #[serde(default)]
    pub actions: Vec<ActionConfig>,

    /// Mode used for operations without an action descriptor.
    #[serde(default)]
    pub default_action: ActionType,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnowledgeConfig {
    /// Names of rule resources registered in the catalog.
    #[serde(default)]
    pub resources: Vec<String>,

    /// When present, the knowledge base is served through a refreshing agent.
    #[serde(default)]
    pub agent: Option<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_true")]
    pub scan_enabled: bool,

    #[serde(default = "default_scan_interval", with = "duration_ms")]
    pub scan_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scan_enabled: default_true(),
            scan_interval: default_scan_interval(),
        }
    }
}

/// Session tuning parameters applied to every session the handler creates.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Upper bound on rule firings within a single evaluation pass.
    #[serde(default)]
    pub fire_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    #[default]
    Console,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub kind: AuditKind,

    #[serde(default)]
    pub log: Option<PathBuf>,
}

/// Action descriptor, one per service operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionConfig {
    pub name: String,

    #[serde(default, rename = "type")]
    pub action_type: Option<ActionType>,

    #[serde(default)]
    pub entry_point: Option<String>,
}

impl ActionConfig {
    pub fn new(name: &str, action_type: ActionType) -> Self {
        Self {
            name: name.to_string(),
            action_type: Some(action_type),
            entry_point: None,
        }
    }

    pub fn with_entry_point(mut self, entry_point: &str) -> Self {
        self.entry_point = Some(entry_point.to_string());
        self
    }
}

/// Channel descriptor: a named output adapter rules can send facts to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChannelConfig {
    pub name: String,

    /// Registered adapter kind; the service channel is used when absent.
    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub operation: Option<String>,

    /// Local name of the service reference, qualified with the target namespace.
    #[serde(default)]
    pub reference: Option<String>,
}

impl ChannelConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl Default for RulesComponentConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            target_namespace: String::new(),
            message_content_name: default_message_content_name(),
            knowledge: KnowledgeConfig::default(),
            session: SessionConfig::default(),
            audit: None,
            actions: Vec::new(),
            default_action: ActionType::default(),
            channels: Vec::new(),
        }
    }
}

impl RulesComponentConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).map_err(|e| ConfigError::Io {
            path: path_ref.display().to_string(),
            message: e.to_string(),
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(s: &str) -> ConfigResult<Self> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for action in &self.actions {
            if action.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "action name must not be empty".to_string(),
                ));
            }
            if !seen.insert(action.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate action name: {}",
                    action.name
                )));
            }
        }
        if let Some(agent) = &self.knowledge.agent {
            if agent.scan_enabled && agent.scan_interval.is_zero() {
                return Err(ConfigError::Invalid(
                    "agent scan interval must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Action descriptors keyed by operation name.
    pub fn action_map(&self) -> HashMap<String, ActionConfig> {
        self.actions
            .iter()
            .map(|action| (action.name.clone(), action.clone()))
            .collect()
    }
}

fn default_service_name() -> String {
    "rules".to_string()
}

fn default_message_content_name() -> String {
    "content".to_string()
}

fn default_true() -> bool {
    true
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(60)
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
