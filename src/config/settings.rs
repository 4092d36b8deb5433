use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub models: ModelsConfig,
    pub limits: LimitsConfig,
    pub context: ContextConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model for routing decisions (the decision oracle)
    pub orchestration: String,
    /// Model for query planning
    pub planner: String,
    /// Model for SQL generation
    pub executor: String,
    /// Model for response formatting
    pub formatter: String,
    /// Model for pricing estimates
    pub pricing: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum decision iterations per request
    pub max_iterations: u32,
    /// Maximum clarification questions per thread
    pub max_clarification_rounds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Path to the schema context text file passed to the stage prompts
    pub schema_file: PathBuf,
    /// Directory of prompt template overrides (embedded templates otherwise)
    pub prompts_dir: Option<PathBuf>,
    /// How many past turns the oracle prompt sees
    pub history_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Directory for per-run request logs; old logs move to archive/
    pub dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models: ModelsConfig {
                orchestration: "gemini-2.5-flash-lite".to_string(),
                planner: "gemini-2.5-flash-lite".to_string(),
                executor: "gemini-2.5-flash-lite".to_string(),
                formatter: "gemini-2.5-flash-lite".to_string(),
                pricing: "gemini-2.5-flash-lite".to_string(),
            },
            limits: LimitsConfig {
                max_iterations: 10,
                max_clarification_rounds: 3,
            },
            context: ContextConfig {
                schema_file: PathBuf::from("schema_context.txt"),
                prompts_dir: None,
                history_window: 3,
            },
            logs: LogsConfig {
                dir: PathBuf::from("logs"),
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to the user config file and then to
    /// defaults when nothing exists
    pub fn load_or_default(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            Some(_) => Ok(Self::default()),
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Default user config location, e.g. ~/.config/query-pilot/config.yaml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("query-pilot").join("config.yaml"))
    }
}
