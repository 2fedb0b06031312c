//! Authentication for internal service routes

pub mod middleware;

pub use middleware::{require_internal_token, AuthError, InternalToken};
