//! Layered configuration: YAML file < environment overrides.
//!
//! Every leaf can be overridden with an `ENGRAM_<SECTION>_<FIELD>` variable
//! (e.g. `ENGRAM_CHROMADB_URL`, `ENGRAM_LITELLM_DEFAULT_MODEL`).  The
//! credential for the LLM and cloud embedding providers is *not* part of
//! this struct; it is read from `OPENAI_API_KEY` by the clients themselves.

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Environment-variable prefix shared by all override keys.
pub const ENV_PREFIX: &str = "ENGRAM";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Metrics HTTP port.  The exporter itself lives outside this process
    /// core; the port is carried so deployments stay in one file.
    pub port: u16,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaDbConfig {
    pub url: String,
    pub collection: String,
    /// Hint for batching adds; the store client never splits a single add.
    pub batch_size: usize,
}

impl Default for ChromaDbConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            collection: "coding_memories".to_string(),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiteLlmConfig {
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub max_retries: u32,
    /// Per-attempt timeout in seconds.
    pub timeout: u64,
    /// Requests per minute; 0 disables client-side throttling.
    pub rate_limit: u32,
}

impl Default for LiteLlmConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o-mini".to_string(),
            fallback_models: vec!["gpt-3.5-turbo".to_string()],
            max_retries: 3,
            timeout: 30,
            rate_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// One of `openai`, `sentence-transformers`, or `fallback`.  An empty
    /// string also selects the degraded hash fallback.
    pub service: String,
    pub model: String,
    pub batch_size: usize,
    /// Base URL of the local embedding service (sentence-transformers mode).
    pub url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            service: "fallback".to_string(),
            model: "text-embedding-3-small".to_string(),
            batch_size: 32,
            url: "http://localhost:8001".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub enabled: bool,
    /// Cron expression consumed by the scheduler.
    pub schedule: String,
    pub batch_size: usize,
    pub worker_count: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: "0 0 2 * * *".to_string(),
            batch_size: 10,
            worker_count: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub directory: String,
    pub cache_enabled: bool,
    pub hot_reload: bool,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            directory: "prompts".to_string(),
            cache_enabled: true,
            hot_reload: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metrics_port: u16,
    pub enable_tracing: bool,
    pub sample_rate: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: 9090,
            enable_tracing: false,
            sample_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnboardingConfig {
    pub strategy_guide_path: String,
    /// Upper bound in bytes for the cached strategy guide.
    pub max_file_size: u64,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            strategy_guide_path: String::new(),
            max_file_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub chromadb: ChromaDbConfig,
    pub litellm: LiteLlmConfig,
    pub embedding: EmbeddingConfig,
    pub evolution: EvolutionConfig,
    pub prompts: PromptsConfig,
    pub monitoring: MonitoringConfig,
    pub onboarding: OnboardingConfig,
}

impl AppConfig {
    /// Load the YAML file (missing file → defaults), then apply environment
    /// overrides, then validate.  Any failure here is fatal at startup.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = serde_yaml::to_string(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Apply `ENGRAM_<SECTION>_<FIELD>` overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        override_parsed("SERVER_PORT", &mut self.server.port);
        override_string("SERVER_LOG_LEVEL", &mut self.server.log_level);

        override_string("CHROMADB_URL", &mut self.chromadb.url);
        override_string("CHROMADB_COLLECTION", &mut self.chromadb.collection);
        override_parsed("CHROMADB_BATCH_SIZE", &mut self.chromadb.batch_size);

        override_string("LITELLM_DEFAULT_MODEL", &mut self.litellm.default_model);
        override_list("LITELLM_FALLBACK_MODELS", &mut self.litellm.fallback_models);
        override_parsed("LITELLM_MAX_RETRIES", &mut self.litellm.max_retries);
        override_parsed("LITELLM_TIMEOUT", &mut self.litellm.timeout);
        override_parsed("LITELLM_RATE_LIMIT", &mut self.litellm.rate_limit);

        override_string("EMBEDDING_SERVICE", &mut self.embedding.service);
        override_string("EMBEDDING_MODEL", &mut self.embedding.model);
        override_parsed("EMBEDDING_BATCH_SIZE", &mut self.embedding.batch_size);
        override_string("EMBEDDING_URL", &mut self.embedding.url);

        override_parsed("EVOLUTION_ENABLED", &mut self.evolution.enabled);
        override_string("EVOLUTION_SCHEDULE", &mut self.evolution.schedule);
        override_parsed("EVOLUTION_BATCH_SIZE", &mut self.evolution.batch_size);
        override_parsed("EVOLUTION_WORKER_COUNT", &mut self.evolution.worker_count);

        override_string("PROMPTS_DIRECTORY", &mut self.prompts.directory);
        override_parsed("PROMPTS_CACHE_ENABLED", &mut self.prompts.cache_enabled);
        override_parsed("PROMPTS_HOT_RELOAD", &mut self.prompts.hot_reload);

        override_parsed("MONITORING_METRICS_PORT", &mut self.monitoring.metrics_port);
        override_parsed("MONITORING_ENABLE_TRACING", &mut self.monitoring.enable_tracing);
        override_parsed("MONITORING_SAMPLE_RATE", &mut self.monitoring.sample_rate);

        override_string(
            "ONBOARDING_STRATEGY_GUIDE_PATH",
            &mut self.onboarding.strategy_guide_path,
        );
        override_parsed("ONBOARDING_MAX_FILE_SIZE", &mut self.onboarding.max_file_size);
    }

    /// Reject configurations that would only fail later, deep inside a
    /// request.  Called after file + env merge.
    pub fn validate(&self) -> Result<()> {
        if self.chromadb.collection.trim().is_empty() {
            bail!("chromadb.collection must not be empty");
        }
        if self.chromadb.batch_size == 0 {
            bail!("chromadb.batch_size must be greater than zero");
        }
        if self.litellm.default_model.trim().is_empty() {
            bail!("litellm.default_model must not be empty");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be greater than zero");
        }
        match self.embedding.service.as_str() {
            "openai" | "sentence-transformers" | "fallback" | "" => {}
            other => bail!("embedding.service '{other}' is not recognised"),
        }
        if self.evolution.enabled {
            if self.evolution.batch_size == 0 {
                bail!("evolution.batch_size must be greater than zero");
            }
            cron::Schedule::from_str(&self.evolution.schedule).with_context(|| {
                format!(
                    "evolution.schedule '{}' is not a valid cron expression",
                    self.evolution.schedule
                )
            })?;
        }
        if self.onboarding.max_file_size == 0 {
            bail!("onboarding.max_file_size must be greater than zero");
        }
        Ok(())
    }
}

fn env_key(suffix: &str) -> String {
    format!("{ENV_PREFIX}_{suffix}")
}

fn override_string(suffix: &str, field: &mut String) {
    if let Ok(value) = env::var(env_key(suffix)) {
        if !value.is_empty() {
            *field = value;
        }
    }
}

fn override_parsed<T: FromStr>(suffix: &str, field: &mut T) {
    if let Ok(value) = env::var(env_key(suffix)) {
        if let Ok(parsed) = value.parse::<T>() {
            *field = parsed;
        }
    }
}

/// Comma-separated list override (`a,b,c`).  Empty entries are dropped.
fn override_list(suffix: &str, field: &mut Vec<String>) {
    if let Ok(value) = env::var(env_key(suffix)) {
        let parsed: Vec<String> = value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        if !parsed.is_empty() {
            *field = parsed;
        }
    }
}
