use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    pub object_store_dir: String,
    pub wal_flush_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorIndexConfig {
    pub dimension: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub default_strategy: String,
    pub chunk_size: usize,
    pub overlap_percent: u8,
    #[serde(default)]
    pub delimiters: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversionConfig {
    pub worker_pool_size: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub job_timeout_secs: u64,
    pub min_text_chars: usize,
    pub ocr_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    pub request_deadline_secs: u64,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    pub embedding_provider: String,
    pub embedding_dimension: usize,
    pub openai_compatible_base_url: Option<String>,
    pub openai_compatible_api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub vector_index: VectorIndexConfig,
    pub chunking: ChunkingConfig,
    pub conversion: ConversionConfig,
    pub retrieval: RetrievalConfig,
    pub providers: ProvidersConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("KB").separator("__"));

        builder.build()?.try_deserialize()
    }
}
