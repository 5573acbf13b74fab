use crate::config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{AsyncCommands, RedisResult};

/// Result cache key layout and TTL. These are the contract the intake
/// API polls against, so they stay deterministic.

pub const RESULT_PREFIX: &str = "result";
pub const RESULT_TTL_SECONDS: u64 = 3600;

pub fn result_key(task_id: &str) -> String {
    format!("{}:{}", RESULT_PREFIX, task_id)
}

/// Result cache handle, either single-node or clustered depending on
/// deployment. Clones share the underlying connection and reconnect
/// automatically on transient failures.
#[derive(Clone)]
pub enum Cache {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

fn node_url(node: &str, password: Option<&str>) -> String {
    match password {
        Some(password) => format!("redis://:{}@{}", password, node),
        None => format!("redis://{}", node),
    }
}

impl Cache {
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        if config.cluster_enabled {
            let nodes: Vec<String> = config
                .cluster_nodes
                .iter()
                .map(|n| node_url(n, config.password.as_deref()))
                .collect();
            let client = ClusterClient::new(nodes)?;
            let conn = client.get_async_connection().await?;
            Ok(Cache::Cluster(conn))
        } else {
            let url = node_url(
                &format!("{}:{}", config.host, config.port),
                config.password.as_deref(),
            );
            let client = redis::Client::open(url.as_str())?;
            let conn = ConnectionManager::new(client).await?;
            Ok(Cache::Single(conn))
        }
    }

    /// Raw JSON body of a cached result, if the task already ran.
    pub async fn get_result(&mut self, task_id: &str) -> RedisResult<Option<String>> {
        let key = result_key(task_id);
        match self {
            Cache::Single(conn) => conn.get(&key).await,
            Cache::Cluster(conn) => conn.get(&key).await,
        }
    }

    /// Store a result body verbatim with the fixed TTL, so replay
    /// republishes byte-identical payloads.
    pub async fn store_result(&mut self, task_id: &str, payload: &str) -> RedisResult<()> {
        let key = result_key(task_id);
        match self {
            Cache::Single(conn) => conn.set_ex(&key, payload, RESULT_TTL_SECONDS).await,
            Cache::Cluster(conn) => conn.set_ex(&key, payload, RESULT_TTL_SECONDS).await,
        }
    }

    /// Health probe.
    pub async fn ping(&mut self) -> RedisResult<()> {
        let cmd = redis::cmd("PING");
        match self {
            Cache::Single(conn) => cmd.query_async::<_, String>(conn).await?,
            Cache::Cluster(conn) => cmd.query_async::<_, String>(conn).await?,
        };
        Ok(())
    }
}
