//! Execution context registry (context name -> worker pool).
//!
//! # 設計メモ
//! グローバルな既定値は持ちません。レジストリは普通の値としてビルドし、
//! 使う側（TaskRunner など）へ明示的に渡します。テストでは
//! [`ContextRegistry::replace`] でプールを差し替えられます。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::TsumugiError;
use crate::pool::{NamedPool, WorkerPool};

/// Declarative shape of one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSpec {
    pub name: String,

    /// Worker threads for this context. 0 means "use available parallelism".
    #[serde(default)]
    pub workers: usize,
}

/// Declarative shape of a whole registry.
///
/// Design:
/// - Built once from config (or `Default`), then handed to
///   [`ContextRegistry::from_config`].
/// - The default mirrors a small interactive app: one serialized
///   interactive lane, CPU-wide compute, a handful of io workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub contexts: Vec<ContextSpec>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            contexts: vec![
                ContextSpec {
                    name: "interactive".to_string(),
                    workers: 1,
                },
                ContextSpec {
                    name: "compute".to_string(),
                    workers: 0,
                },
                ContextSpec {
                    name: "io".to_string(),
                    workers: 4,
                },
            ],
        }
    }
}

fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Registry of execution contexts (context name -> pool).
///
/// Resolution happens at submission time, so replacing a context affects
/// every task submitted afterwards.
#[derive(Default)]
pub struct ContextRegistry {
    pools: RwLock<HashMap<String, Arc<dyn WorkerPool>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Build named pools for every context in the config.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, TsumugiError> {
        let registry = Self::new();
        for spec in &config.contexts {
            let workers = if spec.workers == 0 {
                available_workers()
            } else {
                spec.workers
            };
            let pool = NamedPool::new(&spec.name, workers)?;
            registry.register(&spec.name, Arc::new(pool))?;
        }
        Ok(registry)
    }

    /// Register a new context.
    ///
    /// If you want "last wins", use [`ContextRegistry::replace`] instead.
    pub fn register(&self, name: &str, pool: Arc<dyn WorkerPool>) -> Result<(), TsumugiError> {
        let mut pools = self.pools.write().unwrap();
        if pools.contains_key(name) {
            return Err(TsumugiError::DuplicateContext(name.to_string()));
        }
        pools.insert(name.to_string(), pool);
        Ok(())
    }

    /// Swap a context's pool, returning the displaced one (if any).
    ///
    /// 差し替え前に投入済みのタスクは元のプールで走り続けます。
    pub fn replace(
        &self,
        name: &str,
        pool: Arc<dyn WorkerPool>,
    ) -> Option<Arc<dyn WorkerPool>> {
        self.pools.write().unwrap().insert(name.to_string(), pool)
    }

    /// Look up a context by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn WorkerPool>, TsumugiError> {
        self.pools
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TsumugiError::ContextNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().unwrap().is_empty()
    }

    /// Shut down every owned pool. Safe to call more than once.
    pub fn shutdown_all(&self) {
        for pool in self.pools.read().unwrap().values() {
            pool.shutdown();
        }
    }
}
