pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod optimizer;
pub mod pool;
pub mod scheduler;
pub mod task;
pub mod unit;

pub use cache::MemoCache;
pub use config::{
    CacheConfig, DispatchConfig, MetricsConfig, PoolConfig, SchedulerConfig, StellwerkConfig,
};
pub use dispatch::Dispatcher;
pub use error::StellwerkError;
pub use metrics::{spawn_report_task, MetricsCollector, MetricsSnapshot};
pub use optimizer::Optimizer;
pub use pool::ResourcePool;
pub use scheduler::{CycleReport, Scheduler, SchedulerState};
pub use task::{Completion, JobOutcome, Priority, WorkItem};
pub use unit::UnitWorker;
