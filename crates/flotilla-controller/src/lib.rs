//! Process-level pieces of the fleet manager: the operations CLI surface,
//! logging bootstrap and controller wiring.

pub mod deploy;
pub mod logging;
pub mod runtime;
