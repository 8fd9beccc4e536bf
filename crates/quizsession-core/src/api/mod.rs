//! REST API client module for the quiz service.
//!
//! This module provides the `ApiClient`, the token pipeline every
//! authenticated call goes through, plus the quiz and attempt calls that
//! feature code uses.
//!
//! The API uses JWT bearer token authentication; tokens are issued by the
//! `/api/auth` endpoints and renewed with a refresh token.

pub mod client;
pub mod error;
pub mod quiz;

pub use client::ApiClient;
pub use error::ApiError;
