//! Source-side dump service: the dump stage worker and its daemon shell.

mod server;
mod stage;

pub use self::{
    server::{run, DumpServerArgs, Error},
    stage::DumpWorker,
};
