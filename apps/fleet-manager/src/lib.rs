//! Fleet manager engine: keeps a session, a permission bootstrap and a console
//! stream per game-server instance behind one panel, and exposes the results
//! to an out-of-process chat bridge over a small admin API.

pub mod bootstrap;
pub mod config;
pub mod console;
pub mod instance;
pub mod log_throttle;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod streaming;
pub mod telemetry;
pub mod variants;
