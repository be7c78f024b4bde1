//! JSON-RPC 2.0 dialect spoken on client sessions and backend connections.

pub mod types;

pub use types::*;
