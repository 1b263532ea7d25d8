//! The check/alert service: policy sweeps over the job table, retries,
//! archival, and alert dispatch.

pub mod alerts;
mod engine;
mod server;

pub use self::{
    engine::{CheckEngine, EngineError},
    server::{run, Error},
};
