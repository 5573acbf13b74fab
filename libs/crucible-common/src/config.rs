use crate::types::Language;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration, read once from the environment at startup.
/// Defaults mirror a single-node development setup.
#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq: RabbitConfig,
    pub redis: RedisConfig,
    pub docker: DockerConfig,
    pub worker: WorkerConfig,
    pub languages: Vec<Language>,
}

#[derive(Debug, Clone)]
pub struct RabbitConfig {
    pub url: String,
    pub execution_queue: String,
    pub results_queue: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub cluster_enabled: bool,
    pub cluster_nodes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub socket_path: Option<String>,
    pub memory_limit_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub execution_timeout_ms: u64,
    /// Host directory bind-mounted read-write into every sandbox as
    /// the working directory. Shared across all sandboxes of this
    /// process; staged file names must be unique per task.
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_retries: u32,
    /// Bounds in-flight tasks, the consumer prefetch, and the size of
    /// each language's sandbox pool. These must stay equal so no
    /// consumed-but-unprocessable backlog piles up behind a saturated
    /// pool.
    pub concurrency: u16,
    pub health_check_interval: Duration,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Sandboxes get at least 256 MB regardless of configuration; below
/// that the language runtimes themselves fail to start.
pub fn memory_limit_bytes(limit_mb: i64) -> i64 {
    limit_mb.max(256) * 1024 * 1024
}

impl Config {
    pub fn from_env() -> Self {
        let cluster_nodes = std::env::var("REDIS_CLUSTER_NODES")
            .unwrap_or_default()
            .split(',')
            .filter(|n| !n.is_empty())
            .map(|n| n.trim().to_string())
            .collect();

        Self {
            rabbitmq: RabbitConfig {
                url: std::env::var("RABBITMQ_URL")
                    .unwrap_or_else(|_| "amqp://localhost".to_string()),
                execution_queue: "code-execution-queue".to_string(),
                results_queue: "execution-results-queue".to_string(),
            },
            redis: RedisConfig {
                host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_or("REDIS_PORT", 6379),
                password: std::env::var("REDIS_PASSWORD").ok(),
                cluster_enabled: std::env::var("REDIS_CLUSTER_ENABLED")
                    .map(|v| v == "true")
                    .unwrap_or(false),
                cluster_nodes,
            },
            docker: DockerConfig {
                socket_path: std::env::var("DOCKER_SOCKET").ok(),
                memory_limit_bytes: memory_limit_bytes(env_or("CONTAINER_MEMORY_LIMIT", 6)),
                cpu_period: 100_000,
                cpu_quota: env_or("CONTAINER_CPU_QUOTA", 50_000),
                pids_limit: 50,
                execution_timeout_ms: env_or("EXECUTION_TIMEOUT", 15_000),
                scratch_dir: std::env::temp_dir(),
            },
            worker: WorkerConfig {
                max_retries: env_or("WORKER_MAX_RETRIES", 3),
                concurrency: env_or("WORKER_CONCURRENCY", 5),
                health_check_interval: Duration::from_millis(env_or(
                    "HEALTH_CHECK_INTERVAL",
                    30_000,
                )),
            },
            languages: vec![
                Language::Javascript,
                Language::Typescript,
                Language::Python,
                Language::Go,
            ],
        }
    }
}
