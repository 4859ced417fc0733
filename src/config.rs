//! Construction-time configuration: `RuntimeConfig`, `StageConfig`,
//! `ClientPoolConfig`, and the opaque `BootstrapConfig` map the external
//! bootstrap collaborator (out of scope) would populate from a file or
//! environment (§6). The core only defines the shape, not the parser.

use crate::error::RuntimeError;
use crate::queue::WaitStrategy;
use std::collections::HashMap;
use std::time::Duration;

/// How messages are hashed onto a worker index within a stage that does
/// not share its queue (`share_queue = false`).
pub type HashFn = dyn Fn(u64, usize) -> usize + Send + Sync;

fn default_hash(key: u64, worker_count: usize) -> usize {
    (key as usize).wrapping_mul(2654435761) % worker_count
}

/// Per-stage deployment shape (§4.4): worker count, queue geometry, and
/// whether the handler/queue is shared across workers.
pub struct StageConfig {
    pub name: String,
    pub worker_count: usize,
    pub queue_size: usize,
    pub share_handler: bool,
    pub share_queue: bool,
    pub normal_queue_timeout: Duration,
    pub wait_strategy: WaitStrategy,
    pub hash_fn: Box<HashFn>,
}

impl StageConfig {
    pub fn builder(name: impl Into<String>) -> StageConfigBuilder {
        StageConfigBuilder {
            name: name.into(),
            worker_count: 1,
            queue_size: 1024,
            share_handler: false,
            share_queue: false,
            normal_queue_timeout: crate::queue::constants::DEFAULT_NORMAL_QUEUE_TIMEOUT,
            wait_strategy: WaitStrategy::block(),
            hash_fn: Box::new(default_hash),
        }
    }
}

pub struct StageConfigBuilder {
    name: String,
    worker_count: usize,
    queue_size: usize,
    share_handler: bool,
    share_queue: bool,
    normal_queue_timeout: Duration,
    wait_strategy: WaitStrategy,
    hash_fn: Box<HashFn>,
}

impl StageConfigBuilder {
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn share_handler(mut self, share_handler: bool) -> Self {
        self.share_handler = share_handler;
        self
    }

    pub fn share_queue(mut self, share_queue: bool) -> Self {
        self.share_queue = share_queue;
        self
    }

    pub fn normal_queue_timeout(mut self, timeout: Duration) -> Self {
        self.normal_queue_timeout = timeout;
        self
    }

    pub fn wait_strategy(mut self, wait_strategy: WaitStrategy) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    pub fn hash_fn(mut self, hash_fn: impl Fn(u64, usize) -> usize + Send + Sync + 'static) -> Self {
        self.hash_fn = Box::new(hash_fn);
        self
    }

    pub fn build(self) -> Result<StageConfig, RuntimeError> {
        if self.worker_count == 0 {
            return Err(RuntimeError::fatal("stage worker_count must be at least 1"));
        }
        if !self.queue_size.is_power_of_two() {
            return Err(RuntimeError::fatal(format!(
                "stage `{}` queue_size must be a power of two, got {}",
                self.name, self.queue_size
            )));
        }
        Ok(StageConfig {
            name: self.name,
            worker_count: self.worker_count,
            queue_size: self.queue_size,
            share_handler: self.share_handler,
            share_queue: self.share_queue,
            normal_queue_timeout: self.normal_queue_timeout,
            wait_strategy: self.wait_strategy,
            hash_fn: self.hash_fn,
        })
    }
}

/// Bounded exponential back-off parameters for client channel reconnects.
#[derive(Copy, Clone, Debug)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// A named pool of outbound client connections to one endpoint URI.
pub struct ClientPoolConfig {
    pub name: String,
    pub endpoint: String,
    pub pool_size: usize,
    pub backoff: BackoffConfig,
    pub default_timeout: Duration,
}

impl ClientPoolConfig {
    pub fn builder(name: impl Into<String>, endpoint: impl Into<String>) -> ClientPoolConfigBuilder {
        ClientPoolConfigBuilder {
            name: name.into(),
            endpoint: endpoint.into(),
            pool_size: 1,
            backoff: BackoffConfig::default(),
            default_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ClientPoolConfigBuilder {
    name: String,
    endpoint: String,
    pool_size: usize,
    backoff: BackoffConfig,
    default_timeout: Duration,
}

impl ClientPoolConfigBuilder {
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ClientPoolConfig, RuntimeError> {
        if self.pool_size == 0 {
            return Err(RuntimeError::fatal("client pool_size must be at least 1"));
        }
        Ok(ClientPoolConfig {
            name: self.name,
            endpoint: self.endpoint,
            pool_size: self.pool_size,
            backoff: self.backoff,
            default_timeout: self.default_timeout,
        })
    }
}

/// Opaque key/value map populated by the bootstrap collaborator
/// (out of scope here) from a config file or environment. The core never
/// parses files; it only consumes this shape.
#[derive(Clone, Debug, Default)]
pub struct BootstrapConfig {
    values: HashMap<String, String>,
}

impl BootstrapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Top-level configuration consumed once by `Runtime::new`.
pub struct RuntimeConfig {
    pub reactor_count: usize,
    pub stages: Vec<StageConfig>,
    pub client_pools: Vec<ClientPoolConfig>,
    pub descriptor_capacity: usize,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder {
            reactor_count: 1,
            stages: Vec::new(),
            client_pools: Vec::new(),
            descriptor_capacity: 65536,
        }
    }
}

pub struct RuntimeConfigBuilder {
    reactor_count: usize,
    stages: Vec<StageConfig>,
    client_pools: Vec<ClientPoolConfig>,
    descriptor_capacity: usize,
}

impl RuntimeConfigBuilder {
    pub fn reactor_count(mut self, reactor_count: usize) -> Self {
        self.reactor_count = reactor_count;
        self
    }

    pub fn stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn client_pool(mut self, pool: ClientPoolConfig) -> Self {
        self.client_pools.push(pool);
        self
    }

    pub fn descriptor_capacity(mut self, capacity: usize) -> Self {
        self.descriptor_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<RuntimeConfig, RuntimeError> {
        if self.reactor_count == 0 {
            return Err(RuntimeError::fatal("reactor_count must be at least 1"));
        }
        Ok(RuntimeConfig {
            reactor_count: self.reactor_count,
            stages: self.stages,
            client_pools: self.client_pools,
            descriptor_capacity: self.descriptor_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_config_rejects_non_power_of_two_queue_size() {
        let err = StageConfig::builder("echo").queue_size(100).build().unwrap_err();
        assert_eq!(err.kind(), crate::error::RuntimeErrorKind::Fatal);
    }

    #[test]
    fn runtime_config_rejects_zero_reactors() {
        let err = RuntimeConfig::builder().reactor_count(0).build().unwrap_err();
        assert_eq!(err.kind(), crate::error::RuntimeErrorKind::Fatal);
    }

    #[test]
    fn bootstrap_config_round_trips_values() {
        let mut cfg = BootstrapConfig::new();
        cfg.insert("endpoint", "rapid://localhost:9000");
        assert_eq!(cfg.get("endpoint"), Some("rapid://localhost:9000"));
        assert_eq!(cfg.get("missing"), None);
    }
}
