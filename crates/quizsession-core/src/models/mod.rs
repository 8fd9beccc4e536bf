//! Data models shared with the quiz service.
//!
//! - `Identity`, `Role`: the signed-in user as reported by the auth endpoints
//! - `Quiz`, `Difficulty`, `Attempt`: read-only views used by feature calls

pub mod quiz;
pub mod user;

pub use quiz::{Attempt, Difficulty, Quiz};
pub use user::{Identity, Role};
