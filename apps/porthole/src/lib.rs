pub mod cli;
pub mod config;
pub mod renderer;
pub mod session;
pub mod telemetry;
pub mod tunnel;
pub mod viewer;

pub use porthole_protocol as protocol;
pub use porthole_protocol::model;

