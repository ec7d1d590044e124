//! Helper-process name resolution: a [`HelperProcessWorker`] drives one
//! helper over a request/response pipe pair, a [`WorkerPool`] fans lookups
//! out over several of them, and [`build_resolver`] picks between the pool
//! and the in-process native resolver from a [`ResolverConfig`].

mod config;
mod pipes;
mod pool;
mod worker;

pub use config::{
    build_resolver, resolve_sibling_or_path, Backend, ResolverConfig, ENV_NAME_BACKEND,
    ENV_NAME_HELPER_BIN, ENV_NAME_TIMEOUT_MS, ENV_NAME_WORKERS, HELPER_BIN_NAME,
};
pub use haltkit_contracts::{HandleRecord, NameResolver, ResolveError};
pub use pool::{PoolOptions, WorkerPool, DEFAULT_POOL_SIZE, DEFAULT_RESCAN_INTERVAL};
pub use worker::{HelperProcessWorker, WorkerOptions, WorkerState, DEFAULT_HANDSHAKE_TIMEOUT};
