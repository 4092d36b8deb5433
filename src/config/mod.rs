pub mod settings;

pub use settings::{ContextConfig, EngineConfig, LimitsConfig, LogsConfig, ModelsConfig};
