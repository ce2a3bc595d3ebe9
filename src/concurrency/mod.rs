//! Concurrency Module
//!
//! Execution resources shared by the storage layers.
//!
//! ## Scheduling Model
//! - **Worker pool**: sized to available parallelism; runs chunk reads,
//!   writes, compression and region opens
//! - **Serial lane**: a one-thread pool; runs header flushes and region
//!   closes strictly in submission order
//! - **Promises**: results of in-flight operations, joinable by any number
//!   of waiters

mod pool;
mod promise;

pub use pool::{default_threads, PoolHandle, WorkerPool};
pub use promise::Promise;
