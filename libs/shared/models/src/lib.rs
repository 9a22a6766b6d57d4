pub mod auth;
pub mod error;

pub use auth::{Identity, Role, User};
pub use error::AppError;
