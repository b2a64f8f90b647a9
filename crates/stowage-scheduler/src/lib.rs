//! Stowage Scheduler - places workspace pods on nodes
//!
//! The scheduler:
//! - Queues pending pods by workspace class and age
//! - Filters nodes by selectors, affinity, taints and required node services
//! - Picks a node with a pluggable [`Strategy`]
//! - Evicts ghost workspaces to make room for real ones
//! - Binds pods and keeps local slots until the cluster confirms them

pub mod config;
pub mod error;
pub mod filter;
pub mod queue;
pub mod scheduler;
pub mod slots;
pub mod state;
pub mod strategy;
pub mod types;

// Re-export commonly used types
pub use config::{DensityAndExperienceConfig, RateLimitConfig, SchedulerConfig, StrategyName};
pub use error::{Result, SchedulerError};
pub use filter::{default_filters, FilterPredicate};
pub use queue::{PriorityQueue, QueuedPodInfo};
pub use scheduler::{Scheduler, SchedulingResult};
pub use slots::SlotCache;
pub use state::{compute_state, State};
pub use strategy::{create_strategy, Strategy};
pub use types::{FilterResult, SchedulingContext};
