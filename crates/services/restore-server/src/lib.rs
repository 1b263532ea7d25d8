//! Destination-side restore service: the transfer, restore, release, and
//! delete stage workers plus the per-queue daemon shell.

mod server;
mod stages;

pub use self::{
    server::{run, Error, RestoreServerArgs},
    stages::{QueueWorker, RestoreStage},
};
