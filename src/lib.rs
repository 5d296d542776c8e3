//! Gateway relayer
//!
//! Watches outbound token transfers on every configured gateway chain and
//! executes them on their destination chain, exactly once per request.

pub mod api;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod dispatch;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod relay;
pub mod store;
pub mod types;
pub mod watchers;

pub use error::{RelayError, Result};
pub use relay::{RelayLoop, RelaySettings, RelayState, Route};
