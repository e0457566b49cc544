//! WebSocket fan-out hub: connection pumps, the serialized room/registry
//! mutator, per-frame dispatch, rate limiting, and the domain service seams
//! the dispatcher calls into.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod hub;
pub mod rate_limit;
pub mod services;
pub mod testing;

pub use connection::{Identity, Role};
pub use dispatcher::Dispatcher;
pub use hub::Hub;
