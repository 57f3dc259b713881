use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_PREFETCH: u32 = 64;
const DEFAULT_PARTITION_SIZE: u32 = 1;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TICK_BATCH: u32 = 64;
const DEFAULT_SAMPLE_RATE: f32 = 44_100.0;

/// Perillas del runtime. Cada una se puede sobreescribir con su env var.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hilos del pool de cada bush (BUSH_POOL_SIZE).
    pub pool_size: usize,
    /// Elementos pedidos por `read_next` desde un proxy (PROXY_PREFETCH).
    pub prefetch: u32,
    /// Bloque por carril al repartir y al mezclar (PARTITION_SIZE).
    pub partition_size: u32,
    /// Espera máxima por el lock de un cursor (CURSOR_LOCK_TIMEOUT_MS).
    pub cursor_lock_timeout_ms: u64,
    /// Timeout de llamadas remotas (CALL_TIMEOUT_MS).
    pub call_timeout_ms: u64,
    /// Elementos que consume un sink por tick (TICK_BATCH).
    pub tick_batch: u32,
    /// SAMPLE_RATE
    pub sample_rate: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            prefetch: DEFAULT_PREFETCH,
            partition_size: DEFAULT_PARTITION_SIZE,
            cursor_lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            tick_batch: DEFAULT_TICK_BATCH,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl RuntimeConfig {
    /// Defaults pisados por las env vars que estén definidas y sean válidas.
    pub fn from_env() -> Self {
        Self {
            pool_size: env_or("BUSH_POOL_SIZE", DEFAULT_POOL_SIZE).max(1),
            prefetch: env_or("PROXY_PREFETCH", DEFAULT_PREFETCH).max(1),
            partition_size: env_or("PARTITION_SIZE", DEFAULT_PARTITION_SIZE).max(1),
            cursor_lock_timeout_ms: env_or("CURSOR_LOCK_TIMEOUT_MS", DEFAULT_LOCK_TIMEOUT_MS),
            call_timeout_ms: env_or("CALL_TIMEOUT_MS", DEFAULT_CALL_TIMEOUT_MS),
            tick_batch: env_or("TICK_BATCH", DEFAULT_TICK_BATCH).max(1),
            sample_rate: env_or("SAMPLE_RATE", DEFAULT_SAMPLE_RATE),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.cursor_lock_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
