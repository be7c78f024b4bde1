//! Per-scope SSE sessions and the JSON-RPC frame handlers.

pub mod handler;
pub mod session;

pub use handler::{message_handler, sse_handler};
pub use session::{Session, SessionRegistry};
