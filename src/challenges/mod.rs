// Challenge detection, per-realm state, parking, and the handlers that answer challenges.

pub mod core;
pub mod handlers;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod session;
pub mod state;
