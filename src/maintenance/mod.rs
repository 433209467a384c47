//! Background maintenance.
//!
//! - [`ExpirationSweeper`]: deletes expired files and upload sessions
//! - [`Optimizer`]: reaps orphaned storage data and compacts the stores
//! - [`ResourceMonitor`]: host and store statistics
//! - [`JobRunner`]: periodic triggers with per-job overlap protection

mod monitor;
mod optimizer;
mod runner;
mod sweeper;

pub use monitor::{ResourceMonitor, ResourceSnapshot};
pub use optimizer::{OptimizeMode, OptimizeReport, Optimizer, OptimizerOptions};
pub use runner::{JobKind, JobOutcome, JobRunner};
pub use sweeper::{ExpirationSweeper, SweepReport};
