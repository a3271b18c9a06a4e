//! forkpool - a pool of forked worker processes.
//!
//! Tasks are registered by name in a [`TaskRegistry`] before the pool starts.
//! Workers are forked from the parent, so they inherit the registry and the
//! shared heap that backs the cross-process synchronization primitives.
//! Tasks travel to workers as JSON frames over pipes; results come back on
//! one shared pipe guarded by a process-shared lock.
//!
//! ```no_run
//! use forkpool::{ApplyOptions, Pool, PoolConfig, TaskRegistry};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let mut registry = TaskRegistry::new();
//! registry.register("add", |_, args| Ok(args.arg::<i64>(0)? + args.arg::<i64>(1)?));
//!
//! let pool = Pool::new(PoolConfig::new(2).with_timeout(Duration::from_secs(5)), registry)?;
//! let sum = pool.apply_async("add", vec![json!(2), json!(3)], ApplyOptions::new())?;
//! assert_eq!(sum.get(None)?, json!(5));
//! pool.close();
//! pool.join()?;
//! # Ok::<(), forkpool::PoolError>(())
//! ```

pub mod config;
pub mod error;
pub mod heap;
pub mod ipc;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod sync;
pub mod worker;

pub use config::PoolConfig;
pub use error::{ExceptionInfo, HeapError, PoolError, Result, SyncError, TaskError};
pub use heap::{ArenaStats, Heap};
pub use pool::{
    ApplyOptions, AsyncResult, IMapIterator, MapResult, Pool, PoolState, PoolStats, RestartState,
    TimeoutKind, default_chunksize,
};
pub use protocol::TaskArgs;
pub use registry::{TaskContext, TaskRegistry};
