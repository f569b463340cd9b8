//! Authentication module for the NITP portal

#[cfg(test)]
mod edge_case_tests;
pub mod identity;
pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;
pub mod password;
pub mod sessions;

pub use identity::{Identity, ROLE_ADMIN, ROLE_MEMBER};
pub use jwt::{Claims, IssuedToken, JwtManager};
pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser};
pub use password::{hash_password, validate_password_strength, verify_password};
