//! Runner process management: launch command rendering, the supervised
//! process instance, readiness probing, and the swap-aware supervisor.

// region:    --- Modules

mod command;
mod instance;
mod supervisor;

pub mod probe;

// -- Flatten
pub use command::*;
pub use instance::*;
pub use supervisor::*;

// endregion: --- Modules
