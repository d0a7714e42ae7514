//! API middleware

mod cors;
mod jwt;

pub use cors::cors_layer;
pub use jwt::{require_auth, AuthError, AuthenticatedUser, Claims, JwtAuth};
