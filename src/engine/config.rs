use std::{collections::HashMap, env, net::SocketAddr, str::FromStr, time::Duration};

use crate::engine::models::{ContainerLimits, Language};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub pool: PoolConfig,
    pub run_timeout: Duration,
    pub compile_timeout: Duration,
    /// Bound on each cleanup step: killing the exec, the process sweep, the wipe.
    pub cleanup_timeout: Duration,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub container_prefix: String,
    pub default_pool_size: usize,
    pub pool_sizes: HashMap<Language, usize>,
    pub limits: ContainerLimits,
    pub network_disabled: bool,
    pub maintenance_interval: Duration,
    pub idle_timeout: Duration,
    /// Bound on creating and preparing one container, image pull included.
    pub provision_timeout: Duration,
}

impl PoolConfig {
    pub fn pool_size(&self, language: Language) -> usize {
        self.pool_sizes
            .get(&language)
            .copied()
            .unwrap_or(self.default_pool_size)
            .clamp(1, 64)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            container_prefix: "code-sandbox".to_string(),
            default_pool_size: 1,
            pool_sizes: HashMap::new(),
            limits: ContainerLimits {
                cpu_cores: 0.5,
                memory_mb: 256,
                max_processes: 64,
                max_output_bytes: 64 * 1024,
            },
            network_disabled: true,
            maintenance_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            provision_timeout: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            container_prefix: env::var("CONTAINER_PREFIX")
                .ok()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or(defaults.container_prefix),
            default_pool_size: env_parse("POOL_SIZE", defaults.default_pool_size),
            pool_sizes: pool_size_overrides(),
            limits: ContainerLimits {
                cpu_cores: env_parse("CONTAINER_CPUS", defaults.limits.cpu_cores),
                memory_mb: env_parse("CONTAINER_MEMORY_MB", defaults.limits.memory_mb),
                max_processes: env_parse("CONTAINER_PIDS_LIMIT", defaults.limits.max_processes),
                max_output_bytes: env_parse("MAX_OUTPUT_BYTES", defaults.limits.max_output_bytes),
            }
            .normalized(),
            network_disabled: env_parse("NETWORK_DISABLED", true),
            maintenance_interval: Duration::from_secs(
                env_parse("MAINTENANCE_INTERVAL_SECS", 60u64).max(1),
            ),
            idle_timeout: Duration::from_secs(env_parse("IDLE_TIMEOUT_SECS", 300u64).max(1)),
            provision_timeout: Duration::from_secs(
                env_parse("PROVISION_TIMEOUT_SECS", 300u64).clamp(1, 3_600),
            ),
        };

        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            pool,
            run_timeout: Duration::from_millis(
                env_parse("RUN_TIMEOUT_MS", 10_000u64).clamp(50, 120_000),
            ),
            compile_timeout: Duration::from_millis(
                env_parse("COMPILE_TIMEOUT_MS", 30_000u64).clamp(1_000, 300_000),
            ),
            cleanup_timeout: Duration::from_millis(
                env_parse("CLEANUP_TIMEOUT_MS", 5_000u64).clamp(100, 60_000),
            ),
            max_code_bytes: env_parse("MAX_CODE_BYTES", 256 * 1024usize),
            max_input_bytes: env_parse("MAX_INPUT_BYTES", 256 * 1024usize),
        }
    }
}

fn pool_size_overrides() -> HashMap<Language, usize> {
    let mut sizes = HashMap::new();
    for language in Language::ALL {
        let key = format!("POOL_SIZE_{}", language.as_str().to_ascii_uppercase());
        if let Some(size) = env::var(&key).ok().and_then(|raw| raw.trim().parse().ok()) {
            sizes.insert(language, size);
        }
    }
    sizes
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
