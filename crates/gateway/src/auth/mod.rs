//! Authentication and authorization for gateway sessions.

pub mod context;
pub mod jwt;
pub mod policy;

pub use context::{AuthContext, ScopeResolver};
pub use jwt::{JwtVerifier, TokenError, TokenVerifier, VerifiedClaims};
pub use policy::PolicyConfig;

#[cfg(test)]
pub(crate) use jwt::test_support;
