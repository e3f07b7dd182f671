pub mod settings;

pub use settings::{
    CacheSettings, ConfigError, ConversationSettings, MemorySettings, RagSettings,
    ResilienceSettings, Settings,
};
