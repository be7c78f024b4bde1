//! MCP gateway: JSON-RPC 2.0 over per-scope SSE, with admission control,
//! rate limiting, and circuit-broken proxying to backend tool servers.

pub mod admission;
pub mod audit;
pub mod auth;
pub mod breaker;
pub mod config;
pub mod error;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod state;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use state::AppState;
