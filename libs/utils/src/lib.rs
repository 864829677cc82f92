//! Small cross-cutting pieces shared by the monitoring crate: process/attachment
//! identity newtypes and a `tracing` bootstrap, kept separate from `monitor` itself so
//! that other crates in this workspace could reuse them without pulling in the whole
//! monitoring subsystem.

pub mod id;
pub mod logging;
