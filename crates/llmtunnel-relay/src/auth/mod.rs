//! Authentication module for the llmtunnel relay.
//!
//! Identity is issued elsewhere; the relay only validates bearer JWTs and
//! trusts the `sub`, `tier` and `role` claims they carry.

pub mod claims;
pub mod jwt;

pub use claims::{Claims, Tier};
pub use jwt::JwtManager;
