//! Single-flight fetch cache for rate-limited upstream JSON APIs.
//!
//! All outbound traffic goes through a [`registry::TaskRegistry`]: identical
//! concurrent requests collapse into one download, payloads persist in
//! SQLite with a TTL, and an [`sweeper::ExpirySweeper`] reclaims expired
//! rows without starving interactive work.

pub mod config;
pub mod error;
pub mod hn;
pub mod logger;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod store;
pub mod sweeper;
pub mod task;
pub mod utils;

pub use config::Config;
pub use error::{ FetchError, FetchResult };
pub use queue::FetchQueue;
pub use registry::{ Prefetch, TaskRegistry };
pub use store::CacheStore;
pub use sweeper::ExpirySweeper;
pub use task::UpdateFn;
