//! Core task orchestration for the shelfwatch scraping pipeline.
//!
//! Pure domain logic with no I/O dependencies: the task queue and
//! scheduler, retry classification, the exclusive window pool, the
//! single-flight page cache and listing rank computation. Persistence
//! and the window-farm HTTP client live in their own crates and plug in
//! through the [`store::TaskStore`] and [`resource::ResourceProvider`]
//! traits.

pub mod error;
pub mod page_cache;
pub mod queue;
pub mod rank;
pub mod resource;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod task;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::AppError;
pub use page_cache::KeyedSingleFlightCache;
pub use queue::{QueueConfig, TaskQueue};
pub use rank::{ListingFetcher, ListingItem, PositionInfo, RankConfig, RankingService};
pub use resource::{PoolConfig, ProviderError, ResourcePool, ResourceProvider, WindowLease};
pub use retry::{ErrorKind, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig, TaskHandler};
pub use store::{ErrorSink, TaskStore};
pub use task::{CreateTaskRequest, Task, TaskPriority, TaskStatus, TaskType};
