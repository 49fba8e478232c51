//! boardkeeper/crates/services/src/lib.rs
//!
//! Board upkeep and moderation logic, written against the `domains` ports.

pub mod buffers;
pub mod executor;
pub mod moderation;
pub mod retention;
pub mod scheduler;
pub mod upkeep;

pub use buffers::{OpenBodyBuffer, SpamScoreBuffer};
pub use executor::{Executor, Transaction};
pub use moderation::ModerationService;
pub use retention::RetentionPolicy;
pub use scheduler::{Scheduler, SchedulerIntervals, Upkeep};
pub use upkeep::Janitor;
