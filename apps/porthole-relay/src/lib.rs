pub mod config;
pub mod share;
pub mod state;
pub mod tunnel;

pub use state::RelayState;
pub use tunnel::build_router;
