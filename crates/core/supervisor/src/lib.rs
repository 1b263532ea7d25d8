//! Child supervision and worker pooling for the sync daemons.
//!
//! The pipeline's heavy lifting is done by external commands (volume dumps,
//! restores, remote transfers). This crate owns the contract around them:
//! spawn with captured output, monitor on a progress schedule, never leave
//! an orphan behind, and bound how many run at once.

mod child;
mod pool;
mod schedule;
pub mod signals;

pub use self::{
    child::{run_command, supervise, ChildError, Progress, SuperviseAborted},
    pool::WorkerPool,
    schedule::IntervalSchedule,
};
